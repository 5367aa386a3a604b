//! Kaiku Voice Presence Server
//!
//! Tracks which voice channel every user occupies, hands out call provider
//! tokens, and keeps both in agreement when clients crash or messages are lost.

pub mod access;
pub mod api;
pub mod auth;
pub mod config;
pub mod locks;
pub mod notify;
pub mod presence;
pub mod provider;
pub mod voice;
pub mod ws;
