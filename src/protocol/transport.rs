//! Transport Seam
//!
//! Contract between the coordination core and the radio driver. The driver
//! delivers received frames from its own execution context; that context must
//! never block, so reception is a bounded `mpsc` hand-off (`try_send`) and
//! all real work happens on the consumer side.

use std::fmt;

use thiserror::Error;
use tokio::sync::mpsc;

// =============================================================================
// LINK ADDRESS
// =============================================================================

/// 6-byte link-layer address of a radio.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkAddr(pub [u8; 6]);

impl LinkAddr {
    /// The broadcast address.
    pub const BROADCAST: LinkAddr = LinkAddr([0xFF; 6]);

    /// Whether this is the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for LinkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for LinkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LinkAddr({})", hex::encode(self.0))
    }
}

/// A received frame, tagged with its sender.
#[derive(Clone, Debug)]
pub struct Datagram {
    /// Link address of the sending radio.
    pub from: LinkAddr,
    /// Raw frame bytes, not yet validated.
    pub bytes: Vec<u8>,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Radio-side failure. Logged and surfaced to the caller, never fatal.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Channel outside the valid range (1-13).
    #[error("invalid channel: {0}")]
    InvalidChannel(u8),
    /// The driver refused the frame.
    #[error("send failed: {0}")]
    SendFailed(String),
}

// =============================================================================
// TRANSPORT TRAIT
// =============================================================================

/// Lowest valid radio channel.
pub const MIN_CHANNEL: u8 = 1;
/// Highest valid radio channel.
pub const MAX_CHANNEL: u8 = 13;

/// Radio driver contract consumed by the coordination core.
///
/// `add_peer`/`remove_peer` manage the driver's link-layer peer table; on
/// drivers without one they are no-ops. Reception is not part of this trait:
/// the driver is constructed with an `mpsc::Sender<Datagram>` and pushes
/// frames into it without blocking.
pub trait Transport: Send + Sync {
    /// Send a frame to `dest`, or to everyone if `dest` is the broadcast
    /// address. Fire-and-forget; delivery is not acknowledged.
    fn send(&self, dest: LinkAddr, frame: &[u8]) -> Result<(), TransportError>;

    /// Retune the radio.
    fn set_channel(&self, channel: u8) -> Result<(), TransportError>;

    /// Current channel.
    fn channel(&self) -> u8;

    /// Register a link-layer peer association.
    fn add_peer(&self, addr: LinkAddr) -> Result<(), TransportError>;

    /// Tear down a link-layer peer association.
    fn remove_peer(&self, addr: LinkAddr) -> Result<(), TransportError>;

    /// This radio's own address.
    fn local_addr(&self) -> LinkAddr;
}

/// Depth of the receive hand-off queue.
///
/// Frames arriving while the queue is full are dropped at the radio boundary;
/// the transport gives no delivery guarantee either way.
pub const RX_QUEUE_DEPTH: usize = 64;

/// Create the receive hand-off pair for a radio.
pub fn rx_channel() -> (mpsc::Sender<Datagram>, mpsc::Receiver<Datagram>) {
    mpsc::channel(RX_QUEUE_DEPTH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_address() {
        assert!(LinkAddr::BROADCAST.is_broadcast());
        assert!(!LinkAddr([1, 2, 3, 4, 5, 6]).is_broadcast());
    }

    #[test]
    fn display_is_hex() {
        let addr = LinkAddr([0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03]);
        assert_eq!(addr.to_string(), "aabbcc010203");
    }
}
