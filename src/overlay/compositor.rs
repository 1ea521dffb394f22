//! Rasterizes draw commands onto an image, clipping at the borders.

use crate::overlay::command::{Color, DrawCommand, Font};
use crate::overlay::font::{glyph, GLYPH_ADVANCE, GLYPH_HEIGHT, GLYPH_WIDTH};
use crate::pipeline::artifacts::Image;

pub fn render(command: &DrawCommand, image: &mut Image) {
    match command {
        DrawCommand::Box {
            left,
            bottom,
            right,
            top,
            filled,
            color,
        } => {
            if *filled {
                fill_rect(image, *left, *top, *right, *bottom, *color);
            } else {
                draw_rectangle(image, *left, *top, *right, *bottom, *color);
            }
        }
        DrawCommand::Line {
            x1,
            y1,
            x2,
            y2,
            color,
        } => draw_line(image, *x1, *y1, *x2, *y2, *color),
        DrawCommand::Text {
            x,
            y,
            font,
            color,
            text,
        } => draw_label(image, *x, *y, *font, text, *color),
    }
}

/// Row and column span of a box given in either corner order, clipped to
/// the image. `None` when nothing of it is visible.
fn clip_span(image: &Image, x1: i32, y1: i32, x2: i32, y2: i32) -> Option<(i32, i32, i32, i32)> {
    let (left, right) = (x1.min(x2), x1.max(x2));
    let (top, bottom) = (y1.min(y2), y1.max(y2));
    let width = image.width() as i32;
    let height = image.height() as i32;
    if right < 0 || bottom < 0 || left >= width || top >= height {
        return None;
    }
    Some((
        left.max(0),
        top.max(0),
        right.min(width - 1),
        bottom.min(height - 1),
    ))
}

fn fill_rect(image: &mut Image, left: i32, top: i32, right: i32, bottom: i32, color: Color) {
    let Some((left, top, right, bottom)) = clip_span(image, left, top, right, bottom) else {
        return;
    };
    let rgb = color.rgb();
    for y in top..=bottom {
        for x in left..=right {
            image.put(x, y, rgb);
        }
    }
}

fn draw_rectangle(image: &mut Image, left: i32, top: i32, right: i32, bottom: i32, color: Color) {
    // Edges outside the image must stay invisible, so paint unclipped
    // coordinates and let `put` discard the rest
    let (x0, x1) = (left.min(right), left.max(right));
    let (y0, y1) = (top.min(bottom), top.max(bottom));
    let Some((cx0, cy0, cx1, cy1)) = clip_span(image, x0, y0, x1, y1) else {
        return;
    };
    let rgb = color.rgb();
    for x in cx0..=cx1 {
        image.put(x, y0, rgb);
        image.put(x, y1, rgb);
    }
    for y in cy0..=cy1 {
        image.put(x0, y, rgb);
        image.put(x1, y, rgb);
    }
}

const INSIDE: u8 = 0;
const LEFT: u8 = 1;
const RIGHT: u8 = 2;
const ABOVE: u8 = 4;
const BELOW: u8 = 8;

fn outcode(x: i64, y: i64, width: i64, height: i64) -> u8 {
    let mut code = INSIDE;
    if x < 0 {
        code |= LEFT;
    } else if x >= width {
        code |= RIGHT;
    }
    if y < 0 {
        code |= ABOVE;
    } else if y >= height {
        code |= BELOW;
    }
    code
}

/// Value of `a` where `b` reaches `at` along the segment. `b1 != b2`.
fn intercept(a1: i64, a2: i64, b1: i64, b2: i64, at: i64) -> i64 {
    // Products of two 33-bit differences need i128
    let step = i128::from(a2 - a1) * i128::from(at - b1) / i128::from(b2 - b1);
    a1 + step as i64
}

/// Cohen-Sutherland clip of a segment to the image. `None` when the segment
/// misses the image entirely.
fn clip_line(image: &Image, x1: i32, y1: i32, x2: i32, y2: i32) -> Option<[i64; 4]> {
    let width = i64::from(image.width());
    let height = i64::from(image.height());
    let (mut x1, mut y1, mut x2, mut y2) = (
        i64::from(x1),
        i64::from(y1),
        i64::from(x2),
        i64::from(y2),
    );
    let mut code1 = outcode(x1, y1, width, height);
    let mut code2 = outcode(x2, y2, width, height);

    loop {
        if code1 | code2 == INSIDE {
            return Some([x1, y1, x2, y2]);
        }
        if code1 & code2 != INSIDE {
            return None;
        }
        let code = if code1 != INSIDE { code1 } else { code2 };
        let (x, y) = if code & BELOW != 0 {
            let y = height - 1;
            (intercept(x1, x2, y1, y2, y), y)
        } else if code & ABOVE != 0 {
            (intercept(x1, x2, y1, y2, 0), 0)
        } else if code & RIGHT != 0 {
            let x = width - 1;
            (x, intercept(y1, y2, x1, x2, x))
        } else {
            (0, intercept(y1, y2, x1, x2, 0))
        };
        if code == code1 {
            (x1, y1) = (x, y);
            code1 = outcode(x1, y1, width, height);
        } else {
            (x2, y2) = (x, y);
            code2 = outcode(x2, y2, width, height);
        }
    }
}

fn draw_line(image: &mut Image, x1: i32, y1: i32, x2: i32, y2: i32, color: Color) {
    let Some([mut x, mut y, x2, y2]) = clip_line(image, x1, y1, x2, y2) else {
        return;
    };
    let rgb = color.rgb();
    let dx = (x2 - x).abs();
    let dy = -(y2 - y).abs();
    let sx = if x < x2 { 1 } else { -1 };
    let sy = if y < y2 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        image.put(x as i32, y as i32, rgb);
        if x == x2 && y == y2 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

fn draw_label(image: &mut Image, x: i32, y: i32, font: Font, text: &str, color: Color) {
    let rgb = color.rgb();
    let scale = i64::from(font.scale());
    let width = i64::from(image.width());
    let height = i64::from(image.height());
    let y = i64::from(y);
    if y >= height || y + i64::from(GLYPH_HEIGHT) * scale <= 0 {
        return;
    }
    let mut pen = i64::from(x);

    for ch in text.chars() {
        if pen >= width {
            break;
        }
        let Some(rows) = glyph(ch).filter(|_| pen + i64::from(GLYPH_WIDTH) * scale > 0) else {
            pen += i64::from(GLYPH_ADVANCE) * scale;
            continue;
        };
        for (row, pattern) in rows.iter().enumerate() {
            for col in 0..i64::from(GLYPH_WIDTH) {
                if (pattern >> (i64::from(GLYPH_WIDTH) - 1 - col)) & 1 == 0 {
                    continue;
                }
                for dy in 0..scale {
                    let py = y + row as i64 * scale + dy;
                    if py < 0 || py >= height {
                        continue;
                    }
                    for dx in 0..scale {
                        let px = pen + col * scale + dx;
                        if (0..width).contains(&px) {
                            image.put(px as i32, py as i32, rgb);
                        }
                    }
                }
            }
        }
        pen += i64::from(GLYPH_ADVANCE) * scale;
    }
}
