pub mod command;
pub mod compositor;
pub mod font;

pub use command::{Color, DrawCommand, DrawCommandQueue, Font, MAX_TEXT_LEN};
