pub mod color;
pub mod cursor;
pub mod grid;
pub mod modes;
pub mod parser;
pub mod screen;

pub use parser::{Parser, Perform};
pub use screen::ScreenBuffer;
