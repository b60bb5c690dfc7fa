//! Core primitives shared by every unit role.
//!
//! Nothing in this module talks to a radio or holds a lock; the clock and
//! checksum are pure so the protocol and state machines stay testable.

pub mod crc;
pub mod time;

// Re-export core types
pub use crc::crc16;
pub use time::{Clock, ManualClock, MonotonicClock};
