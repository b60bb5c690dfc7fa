//! Peer Registry
//!
//! The coordinator's view of every satellite unit it has heard from. Entries
//! are created on first PairingRequest or Heartbeat, refreshed on every
//! message, and aged against two thresholds: a short one that flips the
//! operator-visible liveness to Offline, and a long one that evicts the
//! record entirely. The gap between the two keeps transient radio dropouts
//! from churning the peer list while still forgetting genuinely dead units.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::protocol::transport::LinkAddr;

/// Silence after which a peer is reported Offline (5x the heartbeat interval).
pub const ONLINE_TIMEOUT_MS: u64 = 15_000;

/// Silence after which a peer is evicted and its link association torn down.
pub const EVICTION_TIMEOUT_MS: u64 = 60_000;

// =============================================================================
// ROLES AND LIVENESS
// =============================================================================

/// What a satellite unit does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    /// Projects a beam and reports breaks.
    Laser,
    /// Carries the run-completion button.
    FinishSignal,
    /// Never observed with a role byte.
    Unknown,
}

impl PeerRole {
    /// Parse the role byte carried in a PairingRequest payload.
    ///
    /// Anything that is not the finish-signal marker reads as Laser: units
    /// running older firmware send no role byte at all, and those have always
    /// been laser units.
    pub fn from_wire(byte: u8) -> Self {
        if byte == 2 {
            Self::FinishSignal
        } else {
            Self::Laser
        }
    }

    /// Wire encoding of this role.
    pub fn to_wire(self) -> u8 {
        match self {
            Self::Laser | Self::Unknown => 1,
            Self::FinishSignal => 2,
        }
    }
}

/// Derived liveness of a peer at a point in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    /// Heard from within the online threshold.
    Online,
    /// Silent past the online threshold but not yet evicted.
    Offline,
}

// =============================================================================
// PEER
// =============================================================================

/// One satellite unit as known by the coordinator.
#[derive(Clone, Debug)]
pub struct Peer {
    /// Stable module id, assigned by unit configuration.
    pub module_id: u8,
    /// Link-layer address last used by the unit.
    pub addr: LinkAddr,
    /// Role of the unit.
    pub role: PeerRole,
    /// True while the role is only the backward-compat default, not one the
    /// unit actually claimed. A later claimed role may replace it; a claimed
    /// role is never replaced by the default.
    pub role_is_default: bool,
    /// Coordinator clock at the last received message.
    pub last_seen_ms: u64,
    /// Signal quality (RSSI, dBm).
    pub signal_quality: i8,
    /// Last commanded laser state. Meaningful for Laser peers only.
    pub laser_on: bool,
}

impl Peer {
    fn liveness(&self, now_ms: u64) -> Liveness {
        if now_ms.saturating_sub(self.last_seen_ms) > ONLINE_TIMEOUT_MS {
            Liveness::Offline
        } else {
            Liveness::Online
        }
    }
}

/// Read-only peer row for the control surface.
#[derive(Clone, Debug, Serialize)]
pub struct PeerView {
    /// Stable module id.
    pub module_id: u8,
    /// Link-layer address, hex.
    pub addr: String,
    /// Role of the unit.
    pub role: PeerRole,
    /// Liveness at snapshot time.
    pub liveness: Liveness,
    /// Signal quality (RSSI, dBm).
    pub signal_quality: i8,
    /// Last commanded laser state.
    pub laser_on: bool,
    /// Milliseconds of silence at snapshot time.
    pub silent_ms: u64,
}

// =============================================================================
// REGISTRY
// =============================================================================

/// All known satellite units, keyed by module id.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<u8, Peer>,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer from a received message.
    ///
    /// A new peer with no role hint is recorded as Laser with the default
    /// marker set. A hint upgrades a defaulted or Unknown role; it never
    /// downgrades a role the unit already claimed.
    pub fn observe(
        &mut self,
        module_id: u8,
        addr: LinkAddr,
        role_hint: Option<PeerRole>,
        signal_quality: i8,
        now_ms: u64,
    ) {
        match self.peers.get_mut(&module_id) {
            Some(peer) => {
                peer.addr = addr;
                peer.last_seen_ms = now_ms;
                peer.signal_quality = signal_quality;
                if let Some(role) = role_hint {
                    if peer.role_is_default || peer.role == PeerRole::Unknown {
                        peer.role = role;
                        peer.role_is_default = false;
                    }
                }
            }
            None => {
                let (role, role_is_default) = match role_hint {
                    Some(role) => (role, false),
                    None => (PeerRole::Laser, true),
                };
                info!(module_id, %addr, ?role, "new unit registered");
                self.peers.insert(
                    module_id,
                    Peer {
                        module_id,
                        addr,
                        role,
                        role_is_default,
                        last_seen_ms: now_ms,
                        signal_quality,
                        laser_on: false,
                    },
                );
            }
        }
    }

    /// Remove peers silent past the eviction threshold, returning them so the
    /// caller can tear down their link associations.
    pub fn evict_stale(&mut self, now_ms: u64) -> Vec<Peer> {
        let stale: Vec<u8> = self
            .peers
            .values()
            .filter(|p| now_ms.saturating_sub(p.last_seen_ms) > EVICTION_TIMEOUT_MS)
            .map(|p| p.module_id)
            .collect();
        stale
            .into_iter()
            .filter_map(|id| {
                let peer = self.peers.remove(&id)?;
                info!(
                    module_id = peer.module_id,
                    silent_s = now_ms.saturating_sub(peer.last_seen_ms) / 1000,
                    "evicting silent unit"
                );
                Some(peer)
            })
            .collect()
    }

    /// Age every entry and return up to `max` rows for display.
    ///
    /// Does not evict; call [`evict_stale`](Self::evict_stale) first so the
    /// caller gets the removed addresses.
    pub fn snapshot(&self, now_ms: u64, max: usize) -> Vec<PeerView> {
        self.peers
            .values()
            .take(max)
            .map(|peer| PeerView {
                module_id: peer.module_id,
                addr: peer.addr.to_string(),
                role: peer.role,
                liveness: peer.liveness(now_ms),
                signal_quality: peer.signal_quality,
                laser_on: peer.laser_on,
                silent_ms: now_ms.saturating_sub(peer.last_seen_ms),
            })
            .collect()
    }

    /// Whether at least one unit of `role` is currently Online.
    pub fn has_online(&self, role: PeerRole, now_ms: u64) -> bool {
        self.peers
            .values()
            .any(|p| p.role == role && p.liveness(now_ms) == Liveness::Online)
    }

    /// Addresses of all known peers (for game start/stop notification).
    pub fn addresses(&self) -> Vec<(u8, LinkAddr)> {
        self.peers.values().map(|p| (p.module_id, p.addr)).collect()
    }

    /// Look up a peer's address.
    pub fn address_of(&self, module_id: u8) -> Option<LinkAddr> {
        self.peers.get(&module_id).map(|p| p.addr)
    }

    /// Record the commanded laser state for a unit.
    pub fn set_laser_state(&mut self, module_id: u8, on: bool) -> bool {
        match self.peers.get_mut(&module_id) {
            Some(peer) => {
                peer.laser_on = on;
                debug!(module_id, on, "laser state recorded");
                true
            }
            None => false,
        }
    }

    /// Remove a peer outright.
    pub fn remove(&mut self, module_id: u8) -> Option<Peer> {
        self.peers.remove(&module_id)
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
