//! Mark phase data structures.

pub mod bitmap;
pub mod stack;

pub use bitmap::MarkBitmap;
pub use stack::MarkStack;
