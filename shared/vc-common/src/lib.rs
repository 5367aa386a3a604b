//! `VoiceChat` Common Library
//!
//! Wire types shared by the presence server and the voice client.

pub mod error;
pub mod protocol;
pub mod types;

pub use error::{Error, Result};
pub use protocol::{ClientMessage, ServerMessage, VoiceEvent};
pub use types::*;
