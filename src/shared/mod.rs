//! Shared utilities and types for the multilang binding
//!
//! This module contains the pieces used by every component role: the framed
//! channel, the handshake, the server configuration and process wiring.

pub mod channel;
pub mod handshake;
pub mod panic;
pub mod server;
mod stdio;
pub mod traits;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{FrameConfig, FrameReader, FrameWriter};
pub use handshake::{ComponentContext, Handshake};
pub use server::ServerConfig;
pub use types::*;
