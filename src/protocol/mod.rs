//! Wireless Protocol Layer
//!
//! Wire format and transport seam for the coordination mesh. The transport is
//! a connectionless, single-hop datagram layer: fixed 40-byte frames, no
//! acknowledgement, no authentication. Everything above it validates
//! structurally (size, checksum, type range) and trusts semantically.
//!
//! ## Module Structure
//!
//! - `message`: wire frame, message types, encode/decode
//! - `transport`: `Transport` trait, link addresses, received datagrams
//! - `hub`: in-process broadcast domain for tests and the demo binary
//! - `dispatch`: per-role `MessageHandler` seam and the receive loop

pub mod dispatch;
pub mod hub;
pub mod message;
pub mod transport;

// Re-export key types
pub use dispatch::{run_receiver, MessageHandler};
pub use hub::{Hub, HubRadio};
pub use message::{DecodeError, Message, MessageType, MAX_PAYLOAD, WIRE_SIZE};
pub use transport::{Datagram, LinkAddr, Transport, TransportError};
