//! Satellite Roles
//!
//! The units paired to a coordinator: laser emitters and the finish-signal
//! button. Each runs the discovery/pairing state machine plus its own timers
//! (pairing retry, heartbeat, and for laser units the safety watchdog).
//!
//! ## Module Structure
//!
//! - `pairing`: channel-scanning discovery state machine
//! - `laser`: laser unit, actuator seam and the fail-safe watchdog
//! - `finish`: finish-signal unit

pub mod finish;
pub mod laser;
pub mod pairing;

use crate::protocol::message::{Message, MessageType, MAX_PAYLOAD, WIRE_SIZE};

// Re-export key types
pub use finish::{FinishUnit, FinishUnitConfig};
pub use laser::{
    Actuator, BeamSensor, LaserUnit, LaserUnitConfig, SimulatedBeamSensor, SimulatedLaser,
};
pub use pairing::{Pairing, PairingState, ScanPlan};

/// Wire role byte of a laser unit.
pub const ROLE_LASER: u8 = 1;

/// Wire role byte of the finish-signal unit.
pub const ROLE_FINISH: u8 = 2;

/// Build a wire frame from a satellite. Internal payloads always fit the
/// fixed field.
pub(crate) fn frame(
    kind: MessageType,
    source_id: u8,
    now_ms: u64,
    payload: &[u8],
) -> [u8; WIRE_SIZE] {
    let mut buf = [0u8; MAX_PAYLOAD];
    buf[..payload.len()].copy_from_slice(payload);
    Message {
        kind,
        source_id,
        timestamp: now_ms as u32,
        payload: buf,
    }
    .encode()
}
