//! Tunnel Protocol Definitions
//!
//! This crate defines the per-stream metadata exchanged between the session
//! layer and the client-side dispatcher, plus the registration-time tunnel
//! descriptor.

pub mod codec;
pub mod messages;

pub use codec::MAX_CONTROL_MESSAGE_SIZE;
pub use messages::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;
