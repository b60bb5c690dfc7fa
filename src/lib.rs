//! # Laser Parcour Coordination Core
//!
//! Coordination logic for a wireless laser obstacle-course game: a central
//! coordinator unit, a set of laser emitter units, and a finish-signal
//! button, all talking over a single-hop packet radio.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   LASER PARCOUR CORE                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Shared primitives                         │
//! │  ├── time.rs     - Monotonic clock seam                      │
//! │  └── crc.rs      - CRC-16 frame checksum                     │
//! │                                                              │
//! │  protocol/       - Wire protocol and transport               │
//! │  ├── message.rs  - Fixed-size frame codec                    │
//! │  ├── transport.rs- Radio abstraction                         │
//! │  ├── hub.rs      - In-process broadcast domain               │
//! │  └── dispatch.rs - Receive loop and handler seam             │
//! │                                                              │
//! │  coordinator/    - Central unit                              │
//! │  ├── registry.rs - Peer liveness and roles                   │
//! │  ├── game.rs     - Game session state machine                │
//! │  ├── store.rs    - Statistics persistence                    │
//! │  └── coordinator.rs - Command surface and radio handling     │
//! │                                                              │
//! │  satellite/      - Paired units                              │
//! │  ├── pairing.rs  - Channel-scanning discovery                │
//! │  ├── laser.rs    - Laser unit and fail-safe watchdog         │
//! │  └── finish.rs   - Finish-signal unit                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Safety Obligation
//!
//! A laser unit whose coordinator falls silent for longer than
//! [`satellite::laser::FAILSAFE_TIMEOUT_MS`] while its diode is energized
//! forces the diode off, whatever the game or pairing state says. The
//! watchdog runs on atomics only and can never be delayed by a held lock.
//!
//! ## Timekeeping
//!
//! All timing flows through the [`core::time::Clock`] seam as milliseconds
//! since an arbitrary monotonic origin. State machines take `now_ms`
//! explicitly, so every timeout and threshold in the crate is testable with
//! a [`core::time::ManualClock`] and no sleeping.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod coordinator;
pub mod core;
pub mod protocol;
pub mod satellite;

// Re-export commonly used types
pub use coordinator::{Coordinator, CoordinatorConfig, GameMode, GameState, SessionConfig};
pub use protocol::{LinkAddr, Message, MessageType, Transport};
pub use satellite::{FinishUnit, FinishUnitConfig, LaserUnit, LaserUnitConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
