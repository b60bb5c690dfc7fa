//! Protocol Messages
//!
//! Fixed-size wire frame exchanged between the coordinator and satellite
//! units. Layout (little-endian, packed, 40 bytes total):
//!
//! ```text
//! offset  size  field
//!      0     1  type
//!      1     1  source_id   (module id of the sender)
//!      2     4  timestamp   (ms since sender boot)
//!      6    32  payload     (zero-padded, meaning depends on type)
//!     38     2  checksum    (CRC-16 over bytes 0..38)
//! ```
//!
//! Decoding recomputes the checksum before exposing any field. Frames that
//! fail size, checksum or type validation are rejected and must be dropped
//! silently by callers: the link is unauthenticated, so corrupt or forged
//! frames fail closed with no response.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::crc::crc16;

/// Total frame size on the wire.
pub const WIRE_SIZE: usize = 40;

/// Maximum payload length.
pub const MAX_PAYLOAD: usize = 32;

// =============================================================================
// MESSAGE TYPE
// =============================================================================

/// Closed set of message types. Wire values match the deployed firmware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Start game command (coordinator -> satellites).
    GameStart = 0x01,
    /// Stop game command (coordinator -> satellites).
    GameStop = 0x02,
    /// Beam break notification (laser unit -> coordinator).
    BeamBroken = 0x03,
    /// Periodic status update.
    StatusUpdate = 0x04,
    /// Configuration update.
    ConfigUpdate = 0x05,
    /// Keep-alive signal, sent in both directions.
    Heartbeat = 0x06,
    /// Broadcast by an unpaired satellite; payload\[0\] carries the role.
    PairingRequest = 0x07,
    /// Unicast reply that completes pairing.
    PairingResponse = 0x08,
    /// Energize the laser; payload\[0\] is the intensity (0-100).
    LaserOn = 0x09,
    /// De-energize the laser.
    LaserOff = 0x0A,
    /// Recalibrate the beam sensor.
    SensorCalibrate = 0x0B,
    /// Return a satellite to its boot state (re-pair from scratch).
    Reset = 0x0C,
    /// Retune notification; payload\[0\] is the new channel.
    ChannelChange = 0x0D,
    /// Best-effort acknowledgement of a channel change.
    ChannelAck = 0x0E,
    /// Finish button pressed (finish unit -> coordinator).
    FinishPressed = 0x0F,
}

impl MessageType {
    /// Parse a wire byte. Returns `None` for values outside the closed set.
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::GameStart),
            0x02 => Some(Self::GameStop),
            0x03 => Some(Self::BeamBroken),
            0x04 => Some(Self::StatusUpdate),
            0x05 => Some(Self::ConfigUpdate),
            0x06 => Some(Self::Heartbeat),
            0x07 => Some(Self::PairingRequest),
            0x08 => Some(Self::PairingResponse),
            0x09 => Some(Self::LaserOn),
            0x0A => Some(Self::LaserOff),
            0x0B => Some(Self::SensorCalibrate),
            0x0C => Some(Self::Reset),
            0x0D => Some(Self::ChannelChange),
            0x0E => Some(Self::ChannelAck),
            0x0F => Some(Self::FinishPressed),
            _ => None,
        }
    }
}

// =============================================================================
// DECODE ERRORS
// =============================================================================

/// Frame validation failure. Callers drop the frame and send nothing back.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Frame length does not match the fixed wire size.
    #[error("invalid frame size: {0} bytes (expected {WIRE_SIZE})")]
    Size(usize),
    /// Checksum mismatch.
    #[error("checksum mismatch: computed {computed:#06x}, frame carries {received:#06x}")]
    Integrity {
        /// CRC computed over the received bytes.
        computed: u16,
        /// CRC carried in the frame.
        received: u16,
    },
    /// Type byte outside the closed message set.
    #[error("unknown message type: {0:#04x}")]
    UnknownType(u8),
}

/// Payload larger than the fixed payload field.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("payload too large: {0} bytes (max {MAX_PAYLOAD})")]
pub struct PayloadTooLarge(pub usize);

// =============================================================================
// MESSAGE
// =============================================================================

/// A validated wire message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Message {
    /// Message type.
    pub kind: MessageType,
    /// Module id of the sender.
    pub source_id: u8,
    /// Milliseconds since the sender booted, truncated to 32 bits.
    pub timestamp: u32,
    /// Payload, zero-padded to the fixed field size.
    pub payload: [u8; MAX_PAYLOAD],
}

impl Message {
    /// Build a message with a zero-padded payload.
    ///
    /// Fails if `payload` exceeds the fixed payload field.
    pub fn new(
        kind: MessageType,
        source_id: u8,
        timestamp: u32,
        payload: &[u8],
    ) -> Result<Self, PayloadTooLarge> {
        if payload.len() > MAX_PAYLOAD {
            return Err(PayloadTooLarge(payload.len()));
        }
        let mut buf = [0u8; MAX_PAYLOAD];
        buf[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            kind,
            source_id,
            timestamp,
            payload: buf,
        })
    }

    /// Serialize to the fixed wire frame, computing the checksum.
    pub fn encode(&self) -> [u8; WIRE_SIZE] {
        let mut frame = [0u8; WIRE_SIZE];
        frame[0] = self.kind as u8;
        frame[1] = self.source_id;
        frame[2..6].copy_from_slice(&self.timestamp.to_le_bytes());
        frame[6..38].copy_from_slice(&self.payload);
        let checksum = crc16(&frame[..38]);
        frame[38..40].copy_from_slice(&checksum.to_le_bytes());
        frame
    }

    /// Validate and deserialize a wire frame.
    ///
    /// Checks size, then checksum, then type range. No field is exposed
    /// before the checksum verifies. Partial frames are a transport error,
    /// not a protocol one, and are rejected outright.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        if frame.len() != WIRE_SIZE {
            return Err(DecodeError::Size(frame.len()));
        }
        let received = u16::from_le_bytes([frame[38], frame[39]]);
        let computed = crc16(&frame[..38]);
        if computed != received {
            return Err(DecodeError::Integrity { computed, received });
        }
        let kind = MessageType::from_wire(frame[0]).ok_or(DecodeError::UnknownType(frame[0]))?;
        let mut payload = [0u8; MAX_PAYLOAD];
        payload.copy_from_slice(&frame[6..38]);
        Ok(Self {
            kind,
            source_id: frame[1],
            timestamp: u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]),
            payload,
        })
    }
}
