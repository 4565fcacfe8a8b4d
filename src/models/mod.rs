//! Wire-level data types.

pub mod frame;

pub use frame::*;
