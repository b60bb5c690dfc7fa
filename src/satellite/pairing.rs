//! Discovery & Pairing State Machine
//!
//! Runs on every satellite. The unit does not know which channel the
//! coordinator lives on, so it advertises itself on a channel sequence until
//! a PairingResponse arrives:
//!
//! ```text
//! Scanning ──PairingResponse──> Paired
//!     ▲                           │
//!     └────────── Reset ──────────┘
//! ```
//!
//! `Paired` is terminal until an explicit Reset; a unit that silently loses
//! its coordinator is not demoted here. That gap is deliberate and covered
//! by the safety watchdog, which forces the actuator off independent of
//! pairing state.

use tracing::{debug, info};

use crate::protocol::transport::{LinkAddr, MAX_CHANNEL, MIN_CHANNEL};

/// Pairing retry interval.
pub const PAIRING_INTERVAL_MS: u64 = 1_500;

// =============================================================================
// SCAN PLAN
// =============================================================================

/// Channel sequence and per-channel attempt budget for discovery.
#[derive(Clone, Debug)]
pub struct ScanPlan {
    channels: Vec<u8>,
    attempts_per_channel: u8,
}

impl ScanPlan {
    /// Sweep all channels, one attempt each, starting at `start_channel` and
    /// wrapping after the last. Used by laser units: the coordinator may sit
    /// anywhere, so cover everything fast.
    pub fn full_sweep(start_channel: u8) -> Self {
        let start = start_channel.clamp(MIN_CHANNEL, MAX_CHANNEL);
        let channels = (start..=MAX_CHANNEL).chain(MIN_CHANNEL..start).collect();
        Self {
            channels,
            attempts_per_channel: 1,
        }
    }

    /// Cycle the common channels (1, 6, 11), three attempts each. Used by
    /// the finish unit, whose coordinator is expected on one of them.
    pub fn common_channels() -> Self {
        Self {
            channels: vec![1, 6, 11],
            attempts_per_channel: 3,
        }
    }
}

// =============================================================================
// STATE MACHINE
// =============================================================================

/// Pairing state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairingState {
    /// Advertising on the scan plan.
    Scanning,
    /// Coordinator found at the given address.
    Paired(LinkAddr),
}

/// What the periodic discovery timer should do this tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanTick {
    /// Channel the PairingRequest goes out on.
    pub channel: u8,
    /// Channel to retune to afterwards, when this channel's attempt budget
    /// is spent.
    pub retune_to: Option<u8>,
}

/// The discovery/pairing state machine. Pure: the owning unit sends the
/// frames and retunes the radio.
#[derive(Debug)]
pub struct Pairing {
    plan: ScanPlan,
    channel_index: usize,
    attempts: u8,
    state: PairingState,
}

impl Pairing {
    /// Start scanning at the head of `plan`.
    pub fn new(plan: ScanPlan) -> Self {
        Self {
            plan,
            channel_index: 0,
            attempts: 0,
            state: PairingState::Scanning,
        }
    }

    /// Current state.
    pub fn state(&self) -> PairingState {
        self.state
    }

    /// Coordinator address, once paired.
    pub fn coordinator(&self) -> Option<LinkAddr> {
        match self.state {
            PairingState::Paired(addr) => Some(addr),
            PairingState::Scanning => None,
        }
    }

    /// Channel the radio should currently be tuned to.
    pub fn current_channel(&self) -> u8 {
        self.plan.channels[self.channel_index]
    }

    /// Advance on the periodic discovery timer.
    ///
    /// Returns `None` once paired (the timer keeps firing cooperatively but
    /// does nothing). Otherwise: advertise on the current channel, and when
    /// the attempt budget is spent, move to the next channel in the plan,
    /// wrapping after the last.
    pub fn on_timer(&mut self) -> Option<ScanTick> {
        if self.state != PairingState::Scanning {
            return None;
        }
        let channel = self.current_channel();
        self.attempts += 1;
        let retune_to = if self.attempts >= self.plan.attempts_per_channel {
            self.attempts = 0;
            self.channel_index = (self.channel_index + 1) % self.plan.channels.len();
            if self.channel_index == 0 {
                debug!("completed full channel scan, wrapping");
            }
            Some(self.current_channel())
        } else {
            None
        };
        Some(ScanTick { channel, retune_to })
    }

    /// A PairingResponse arrived. Record the coordinator and stop scanning.
    pub fn on_response(&mut self, from: LinkAddr) {
        if let PairingState::Paired(existing) = self.state {
            debug!(%from, %existing, "pairing response while already paired, ignored");
            return;
        }
        info!(coordinator = %from, channel = self.current_channel(), "paired");
        self.state = PairingState::Paired(from);
        self.attempts = 0;
    }

    /// Explicit Reset: back to Scanning with all scan state zeroed, so the
    /// next tick starts at the head of the plan rather than mid-sequence.
    pub fn reset(&mut self) {
        self.state = PairingState::Scanning;
        self.channel_index = 0;
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> LinkAddr {
        LinkAddr([n; 6])
    }

    #[test]
    fn laser_scan_advances_after_one_attempt() {
        let mut p = Pairing::new(ScanPlan::full_sweep(1));
        assert_eq!(p.current_channel(), 1);

        let tick = p.on_timer().unwrap();
        assert_eq!(tick.channel, 1);
        assert_eq!(tick.retune_to, Some(2));

        // Response on channel 2 completes pairing; no further requests.
        p.on_response(addr(9));
        assert_eq!(p.state(), PairingState::Paired(addr(9)));
        assert_eq!(p.coordinator(), Some(addr(9)));
        assert_eq!(p.on_timer(), None);
    }

    #[test]
    fn full_sweep_wraps_after_last_channel() {
        let mut p = Pairing::new(ScanPlan::full_sweep(12));
        assert_eq!(p.on_timer().unwrap(), ScanTick { channel: 12, retune_to: Some(13) });
        assert_eq!(p.on_timer().unwrap(), ScanTick { channel: 13, retune_to: Some(1) });
        assert_eq!(p.on_timer().unwrap(), ScanTick { channel: 1, retune_to: Some(2) });
    }

    #[test]
    fn finish_plan_spends_three_attempts_per_channel() {
        let mut p = Pairing::new(ScanPlan::common_channels());
        for _ in 0..2 {
            let tick = p.on_timer().unwrap();
            assert_eq!(tick.channel, 1);
            assert_eq!(tick.retune_to, None);
        }
        let tick = p.on_timer().unwrap();
        assert_eq!(tick.channel, 1);
        assert_eq!(tick.retune_to, Some(6));
        // Next budget runs on channel 6, then 11, then wraps to 1.
        for _ in 0..2 {
            assert_eq!(p.on_timer().unwrap().retune_to, None);
        }
        assert_eq!(p.on_timer().unwrap().retune_to, Some(11));
        for _ in 0..2 {
            assert_eq!(p.on_timer().unwrap().retune_to, None);
        }
        assert_eq!(p.on_timer().unwrap().retune_to, Some(1));
    }

    #[test]
    fn reset_zeroes_scan_state() {
        let mut p = Pairing::new(ScanPlan::full_sweep(1));
        p.on_timer();
        p.on_timer();
        assert_eq!(p.current_channel(), 3);
        p.on_response(addr(9));

        p.reset();
        assert_eq!(p.state(), PairingState::Scanning);
        assert_eq!(p.coordinator(), None);
        // Resumes from the head of the plan, not mid-sequence.
        assert_eq!(p.on_timer().unwrap().channel, 1);
    }

    #[test]
    fn second_response_does_not_repair() {
        let mut p = Pairing::new(ScanPlan::full_sweep(1));
        p.on_response(addr(1));
        p.on_response(addr(2));
        assert_eq!(p.coordinator(), Some(addr(1)));
    }
}
