//! Shared Types

mod voice;

pub use voice::*;
