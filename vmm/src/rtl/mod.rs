//! Runtime library analogue (rtl)
//!
//! Support structures with no memory-management policy of their own.

pub mod bitmap;

pub use bitmap::{InterlockedBitmap, BITMAP_NOT_FOUND};
