//! Deferred overlay primitives queued during a processing cycle

use tracing::warn;

use crate::error::{Error, NackReason};
use crate::overlay::compositor;
use crate::pipeline::artifacts::Image;

/// Longest caption kept by [`DrawCommandQueue::enqueue_string`]
pub const MAX_TEXT_LEN: usize = 64;

/// Overlay colors understood by the compositor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Red,
    Green,
    Blue,
    Black,
    White,
    Yellow,
    Cyan,
    Magenta,
}

impl Color {
    pub fn rgb(self) -> [u8; 3] {
        match self {
            Color::Red => [255, 0, 0],
            Color::Green => [0, 255, 0],
            Color::Blue => [0, 0, 255],
            Color::Black => [0, 0, 0],
            Color::White => [255, 255, 255],
            Color::Yellow => [255, 255, 0],
            Color::Cyan => [0, 255, 255],
            Color::Magenta => [255, 0, 255],
        }
    }
}

impl TryFrom<u8> for Color {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        Ok(match value {
            0 => Color::Red,
            1 => Color::Green,
            2 => Color::Blue,
            3 => Color::Black,
            4 => Color::White,
            5 => Color::Yellow,
            6 => Color::Cyan,
            7 => Color::Magenta,
            other => return Err(Error::InvalidRequest(NackReason::InvalidArgument(other.into()))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Font {
    /// 5x7 glyphs
    Small,
    /// 5x7 glyphs at double scale
    Large,
}

impl Font {
    pub fn scale(self) -> i32 {
        match self {
            Font::Small => 1,
            Font::Large => 2,
        }
    }
}

impl TryFrom<u16> for Font {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self, Error> {
        match value {
            0 => Ok(Font::Small),
            1 => Ok(Font::Large),
            other => Err(Error::InvalidRequest(NackReason::InvalidArgument(other.into()))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrawCommand {
    Box {
        left: i32,
        bottom: i32,
        right: i32,
        top: i32,
        filled: bool,
        color: Color,
    },
    Line {
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        color: Color,
    },
    Text {
        x: i32,
        y: i32,
        font: Font,
        color: Color,
        text: String,
    },
}

/// Insertion-ordered queue of overlay primitives.
///
/// Nothing is rendered until an image is requested; then
/// [`composite_into`](Self::composite_into) draws every command in order and
/// empties the queue.
#[derive(Debug, Clone)]
pub struct DrawCommandQueue {
    commands: Vec<DrawCommand>,
    capacity: usize,
    dropped: u64,
}

impl DrawCommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            commands: Vec::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    pub fn enqueue_box(
        &mut self,
        left: i32,
        bottom: i32,
        right: i32,
        top: i32,
        filled: bool,
        color: Color,
    ) -> bool {
        self.push(DrawCommand::Box {
            left,
            bottom,
            right,
            top,
            filled,
            color,
        })
    }

    pub fn enqueue_line(&mut self, x1: i32, y1: i32, x2: i32, y2: i32, color: Color) -> bool {
        self.push(DrawCommand::Line {
            x1,
            y1,
            x2,
            y2,
            color,
        })
    }

    /// Queue a caption, copying at most `max_len` characters of `text`.
    ///
    /// The copy also stops at the first NUL and never exceeds
    /// [`MAX_TEXT_LEN`].
    pub fn enqueue_string(
        &mut self,
        x: i32,
        y: i32,
        max_len: usize,
        font: Font,
        color: Color,
        text: &str,
    ) -> bool {
        let text: String = text
            .chars()
            .take_while(|c| *c != '\0')
            .take(max_len.min(MAX_TEXT_LEN))
            .collect();
        self.push(DrawCommand::Text {
            x,
            y,
            font,
            color,
            text,
        })
    }

    fn push(&mut self, command: DrawCommand) -> bool {
        if self.commands.len() >= self.capacity {
            self.dropped += 1;
            if self.dropped.is_power_of_two() {
                warn!(dropped = self.dropped, "Overlay queue full, dropping command");
            }
            return false;
        }
        self.commands.push(command);
        true
    }

    /// Draw every queued command onto `image`, then clear the queue.
    pub fn composite_into(&mut self, image: &mut Image) {
        for command in &self.commands {
            compositor::render(command, image);
        }
        self.commands.clear();
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DrawCommand> {
        self.commands.iter()
    }

    /// Commands rejected because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_is_copied_and_clamped() {
        let mut queue = DrawCommandQueue::new(4);
        let owned = String::from("threshold 42");
        queue.enqueue_string(1, 2, 9, Font::Small, Color::Green, &owned);
        drop(owned);

        let long = "x".repeat(200);
        queue.enqueue_string(0, 0, 500, Font::Large, Color::Red, &long);
        queue.enqueue_string(0, 0, 10, Font::Small, Color::Red, "ab\0cd");

        let texts: Vec<&str> = queue
            .iter()
            .map(|c| match c {
                DrawCommand::Text { text, .. } => text.as_str(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(texts[0], "threshold");
        assert_eq!(texts[1].len(), MAX_TEXT_LEN);
        assert_eq!(texts[2], "ab");
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let mut queue = DrawCommandQueue::new(2);
        assert!(queue.enqueue_line(0, 0, 1, 1, Color::Red));
        assert!(queue.enqueue_line(0, 0, 2, 2, Color::Red));
        assert!(!queue.enqueue_line(0, 0, 3, 3, Color::Red));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(
            queue.iter().last(),
            Some(&DrawCommand::Line {
                x1: 0,
                y1: 0,
                x2: 2,
                y2: 2,
                color: Color::Red
            })
        );
    }

    #[test]
    fn test_selectors_parse() {
        assert_eq!(Color::try_from(4).unwrap(), Color::White);
        assert!(Color::try_from(8).is_err());
        assert_eq!(Font::try_from(1).unwrap(), Font::Large);
        assert!(Font::try_from(2).is_err());
    }
}
