//! Firmware artifact catalog.

mod catalog;

pub use catalog::*;
