//! Laser Unit
//!
//! Projects the beam and reports breaks. Carries the one piece of logic in
//! the whole system with a hard real-time safety obligation: if the paired
//! coordinator falls silent while the diode is energized, the diode must be
//! forced off. The watchdog therefore runs on atomics only, never behind the
//! unit's state lock, so a slow lock holder can never delay it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::core::time::Clock;
use crate::protocol::dispatch::{run_receiver, MessageHandler};
use crate::protocol::message::{Message, MessageType};
use crate::protocol::transport::{Datagram, LinkAddr, Transport};

use super::pairing::{Pairing, ScanPlan, PAIRING_INTERVAL_MS};
use super::{frame, ROLE_LASER};

/// Coordinator silence after which an energized diode is forced off.
pub const FAILSAFE_TIMEOUT_MS: u64 = 30_000;

/// Watchdog check period.
pub const SAFETY_CHECK_INTERVAL_MS: u64 = 2_000;

/// Heartbeat period once paired.
pub const HEARTBEAT_INTERVAL_MS: u64 = 3_000;

/// Intensity used when a game start energizes the diode.
const GAME_INTENSITY: u8 = 100;

// =============================================================================
// COLLABORATOR SEAMS
// =============================================================================

/// The laser diode driver. Hardware PWM on the deployed units.
pub trait Actuator: Send + Sync {
    /// Energize at `intensity` (0-100).
    fn energize(&self, intensity: u8);
    /// De-energize.
    fn de_energize(&self);
    /// Whether the diode is currently energized.
    fn is_energized(&self) -> bool;
}

/// The beam sensor driver. Break/restore detection and debouncing live in
/// the driver; it calls [`LaserUnit::beam_broken`] when a break fires.
pub trait BeamSensor: Send + Sync {
    /// Begin watching the beam (game started).
    fn start_monitoring(&self);
    /// Stop watching the beam.
    fn stop_monitoring(&self);
    /// Recalibrate against ambient light.
    fn calibrate(&self);
}

/// In-memory actuator for tests and the simulator.
#[derive(Debug, Default)]
pub struct SimulatedLaser {
    energized: AtomicBool,
    intensity: AtomicU8,
    de_energize_count: AtomicU32,
}

impl SimulatedLaser {
    /// Create a de-energized diode.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last commanded intensity.
    pub fn intensity(&self) -> u8 {
        self.intensity.load(Ordering::SeqCst)
    }

    /// Number of de-energize commands issued, for diagnostics.
    pub fn de_energize_count(&self) -> u32 {
        self.de_energize_count.load(Ordering::SeqCst)
    }
}

impl Actuator for SimulatedLaser {
    fn energize(&self, intensity: u8) {
        self.intensity.store(intensity, Ordering::SeqCst);
        self.energized.store(true, Ordering::SeqCst);
    }

    fn de_energize(&self) {
        self.energized.store(false, Ordering::SeqCst);
        self.de_energize_count.fetch_add(1, Ordering::SeqCst);
    }

    fn is_energized(&self) -> bool {
        self.energized.load(Ordering::SeqCst)
    }
}

/// Beam sensor that only tracks the monitoring flag.
#[derive(Debug, Default)]
pub struct SimulatedBeamSensor {
    monitoring: AtomicBool,
}

impl SimulatedBeamSensor {
    /// Create an idle sensor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether monitoring is active.
    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::SeqCst)
    }
}

impl BeamSensor for SimulatedBeamSensor {
    fn start_monitoring(&self) {
        self.monitoring.store(true, Ordering::SeqCst);
    }

    fn stop_monitoring(&self) {
        self.monitoring.store(false, Ordering::SeqCst);
    }

    fn calibrate(&self) {}
}

// =============================================================================
// LASER UNIT
// =============================================================================

/// Laser unit configuration.
#[derive(Clone, Debug)]
pub struct LaserUnitConfig {
    /// This unit's module id.
    pub module_id: u8,
    /// Channel the scan starts on.
    pub start_channel: u8,
    /// Sensor id reported with beam breaks.
    pub sensor_id: u8,
}

struct LaserCore {
    pairing: Pairing,
    game_mode: bool,
}

/// A laser emitter unit.
pub struct LaserUnit {
    config: LaserUnitConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    actuator: Arc<dyn Actuator>,
    sensor: Arc<dyn BeamSensor>,
    state: Mutex<LaserCore>,
    /// Clock reading at the last message confirmed to come from the paired
    /// coordinator's address. 0 means never. Atomic: the watchdog reads it
    /// without the state lock.
    last_coordinator_seen_ms: AtomicU64,
    /// Latched after a fail-safe shutdown; cleared only by Reset.
    fault_latched: AtomicBool,
}

impl LaserUnit {
    /// Create a laser unit in `Scanning`.
    pub fn new(
        config: LaserUnitConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        actuator: Arc<dyn Actuator>,
        sensor: Arc<dyn BeamSensor>,
    ) -> Self {
        let pairing = Pairing::new(ScanPlan::full_sweep(config.start_channel));
        Self {
            config,
            transport,
            clock,
            actuator,
            sensor,
            state: Mutex::new(LaserCore {
                pairing,
                game_mode: false,
            }),
            last_coordinator_seen_ms: AtomicU64::new(0),
            fault_latched: AtomicBool::new(false),
        }
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn touch_coordinator(&self) {
        self.last_coordinator_seen_ms
            .store(self.now_ms().max(1), Ordering::SeqCst);
    }

    /// Whether the fail-safe fault indicator is latched.
    pub fn fault_latched(&self) -> bool {
        self.fault_latched.load(Ordering::SeqCst)
    }

    /// Sensor id reported with beam breaks.
    pub fn sensor_id(&self) -> u8 {
        self.config.sensor_id
    }

    /// Coordinator address, once paired.
    pub async fn coordinator(&self) -> Option<LinkAddr> {
        self.state.lock().await.pairing.coordinator()
    }

    /// One discovery timer tick: advertise and advance the scan plan.
    /// No-op once paired.
    pub async fn pairing_tick(&self) {
        let tick = {
            let mut st = self.state.lock().await;
            match st.pairing.on_timer() {
                Some(tick) => tick,
                None => return,
            }
        };
        debug!(channel = tick.channel, "sending pairing request");
        let request = frame(
            MessageType::PairingRequest,
            self.config.module_id,
            self.now_ms(),
            &[ROLE_LASER],
        );
        if let Err(err) = self.transport.send(LinkAddr::BROADCAST, &request) {
            warn!(%err, "pairing request failed");
        }
        if let Some(channel) = tick.retune_to {
            debug!(channel, "no response, scanning next channel");
            if let Err(err) = self.transport.set_channel(channel) {
                warn!(%err, channel, "retune failed");
            }
        }
    }

    /// One heartbeat timer tick: unicast a keep-alive to the coordinator.
    /// No-op while scanning.
    pub async fn heartbeat_tick(&self) {
        let coordinator = { self.state.lock().await.pairing.coordinator() };
        let Some(coordinator) = coordinator else {
            return;
        };
        let heartbeat = frame(
            MessageType::Heartbeat,
            self.config.module_id,
            self.now_ms(),
            &[],
        );
        if let Err(err) = self.transport.send(coordinator, &heartbeat) {
            warn!(%err, "heartbeat send failed");
        }
    }

    /// Fail-safe watchdog check.
    ///
    /// Deliberately lock-free: reads only the actuator and the last-seen
    /// atomic, so it can never be delayed by a held state lock. Forces the
    /// diode off when the coordinator has been silent past the fail-safe
    /// threshold, regardless of pairing or game state, and latches the
    /// fault indicator.
    pub fn safety_check(&self) {
        let last_seen = self.last_coordinator_seen_ms.load(Ordering::SeqCst);
        if last_seen == 0 || !self.actuator.is_energized() {
            return;
        }
        let silent_ms = self.now_ms().saturating_sub(last_seen);
        if silent_ms > FAILSAFE_TIMEOUT_MS {
            error!(
                silent_ms,
                "fail-safe: coordinator silent with laser energized, forcing off"
            );
            self.actuator.de_energize();
            self.fault_latched.store(true, Ordering::SeqCst);
        }
    }

    /// Report a beam break detected by the sensor driver.
    pub async fn beam_broken(&self, sensor_id: u8) {
        let coordinator = { self.state.lock().await.pairing.coordinator() };
        let Some(coordinator) = coordinator else {
            warn!(sensor_id, "beam break while unpaired, not reported");
            return;
        };
        info!(sensor_id, "beam broken");
        let report = frame(
            MessageType::BeamBroken,
            self.config.module_id,
            self.now_ms(),
            &[sensor_id],
        );
        if let Err(err) = self.transport.send(coordinator, &report) {
            warn!(%err, "beam break report failed");
        }
    }

    async fn on_message(&self, from: LinkAddr, msg: Message) {
        // Any message confirmed to come from the paired coordinator refreshes
        // the fail-safe deadline, not just heartbeats.
        {
            let st = self.state.lock().await;
            if st.pairing.coordinator() == Some(from) {
                self.touch_coordinator();
            }
        }
        match msg.kind {
            MessageType::GameStart => {
                info!("game start");
                self.state.lock().await.game_mode = true;
                // Arm the watchdog even if pairing never completed: an
                // energized diode must always have a live deadline.
                self.touch_coordinator();
                self.actuator.energize(GAME_INTENSITY);
                self.sensor.start_monitoring();
            }
            MessageType::GameStop => {
                info!("game stop");
                self.state.lock().await.game_mode = false;
                self.sensor.stop_monitoring();
                self.actuator.de_energize();
            }
            MessageType::LaserOn => {
                info!(intensity = msg.payload[0], "manual laser on");
                // Same rule as GameStart: an energized diode must always
                // have a live watchdog deadline, paired or not.
                self.touch_coordinator();
                self.actuator.energize(msg.payload[0]);
            }
            MessageType::LaserOff => {
                info!("manual laser off");
                self.actuator.de_energize();
            }
            MessageType::PairingResponse => {
                let mut st = self.state.lock().await;
                st.pairing.on_response(from);
                drop(st);
                self.touch_coordinator();
                if let Err(err) = self.transport.add_peer(from) {
                    warn!(%err, "coordinator peer registration failed");
                }
            }
            MessageType::Reset => {
                info!("reset command");
                let mut st = self.state.lock().await;
                if let Some(coordinator) = st.pairing.coordinator() {
                    if let Err(err) = self.transport.remove_peer(coordinator) {
                        warn!(%err, "coordinator peer teardown failed");
                    }
                }
                st.game_mode = false;
                st.pairing.reset();
                let head = st.pairing.current_channel();
                drop(st);
                self.sensor.stop_monitoring();
                self.actuator.de_energize();
                self.fault_latched.store(false, Ordering::SeqCst);
                self.last_coordinator_seen_ms.store(0, Ordering::SeqCst);
                if let Err(err) = self.transport.set_channel(head) {
                    warn!(%err, "retune to scan head failed");
                }
            }
            MessageType::ChannelChange => {
                let channel = msg.payload[0];
                info!(channel, "channel change request");
                match self.transport.set_channel(channel) {
                    Ok(()) => {
                        let ack = frame(
                            MessageType::ChannelAck,
                            self.config.module_id,
                            self.now_ms(),
                            &[],
                        );
                        if let Err(err) = self.transport.send(LinkAddr::BROADCAST, &ack) {
                            warn!(%err, "channel ack failed");
                        }
                    }
                    Err(err) => warn!(%err, channel, "channel change failed"),
                }
            }
            MessageType::SensorCalibrate => {
                info!("sensor calibration request");
                self.sensor.calibrate();
            }
            MessageType::Heartbeat => {
                // Deadline refresh already handled above; satellites ignore
                // heartbeats from anyone but their coordinator.
            }
            other => {
                debug!(kind = ?other, "message ignored by laser unit");
            }
        }
    }
}

impl MessageHandler for LaserUnit {
    fn handle_message(&self, from: LinkAddr, msg: Message) -> impl Future<Output = ()> + Send {
        self.on_message(from, msg)
    }
}

// =============================================================================
// RUN LOOPS
// =============================================================================

/// Drive a laser unit: receive dispatch plus its three cooperative timers.
pub async fn run(unit: Arc<LaserUnit>, rx: mpsc::Receiver<Datagram>) {
    tokio::join!(
        run_receiver(unit.clone(), rx),
        pairing_loop(unit.clone()),
        heartbeat_loop(unit.clone()),
        safety_loop(unit),
    );
}

async fn pairing_loop(unit: Arc<LaserUnit>) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_millis(PAIRING_INTERVAL_MS));
    loop {
        interval.tick().await;
        unit.pairing_tick().await;
    }
}

async fn heartbeat_loop(unit: Arc<LaserUnit>) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    loop {
        interval.tick().await;
        unit.heartbeat_tick().await;
    }
}

async fn safety_loop(unit: Arc<LaserUnit>) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_millis(SAFETY_CHECK_INTERVAL_MS));
    loop {
        interval.tick().await;
        unit.safety_check();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::ManualClock;
    use crate::protocol::hub::Hub;
    use crate::satellite::pairing::PairingState;

    fn addr(n: u8) -> LinkAddr {
        LinkAddr([n; 6])
    }

    struct Rig {
        unit: LaserUnit,
        clock: Arc<ManualClock>,
        actuator: Arc<SimulatedLaser>,
        sensor: Arc<SimulatedBeamSensor>,
        coordinator_rx: mpsc::Receiver<Datagram>,
        coordinator_addr: LinkAddr,
        unit_radio_channel: Arc<dyn Transport>,
    }

    /// Unit on channel 1, a listening coordinator radio on channel 2.
    fn rig() -> Rig {
        let hub = Hub::new();
        let coordinator_addr = addr(0);
        let (coordinator_radio, coordinator_rx) = hub.attach(coordinator_addr, 2);
        let (unit_radio, _unit_rx) = hub.attach(addr(1), 1);
        let unit_radio: Arc<dyn Transport> = Arc::new(unit_radio);
        let clock = Arc::new(ManualClock::at(1));
        let actuator = Arc::new(SimulatedLaser::new());
        let sensor = Arc::new(SimulatedBeamSensor::new());
        let unit = LaserUnit::new(
            LaserUnitConfig {
                module_id: 1,
                start_channel: 1,
                sensor_id: 1,
            },
            unit_radio.clone(),
            clock.clone(),
            actuator.clone(),
            sensor.clone(),
        );
        drop(coordinator_radio);
        Rig {
            unit,
            clock,
            actuator,
            sensor,
            coordinator_rx,
            coordinator_addr,
            unit_radio_channel: unit_radio,
        }
    }

    fn msg(kind: MessageType, payload: &[u8]) -> Message {
        Message::new(kind, 0, 0, payload).unwrap()
    }

    #[tokio::test]
    async fn scan_advances_then_pairs_then_heartbeats() {
        let mut rig = rig();

        // One attempt on channel 1 reaches nobody; the unit retunes to 2.
        rig.unit.pairing_tick().await;
        assert!(rig.coordinator_rx.try_recv().is_err());
        assert_eq!(rig.unit_radio_channel.channel(), 2);

        // Second attempt lands on the coordinator's channel.
        rig.unit.pairing_tick().await;
        let dgram = rig.coordinator_rx.recv().await.unwrap();
        let request = Message::decode(&dgram.bytes).unwrap();
        assert_eq!(request.kind, MessageType::PairingRequest);
        assert_eq!(request.source_id, 1);
        assert_eq!(request.payload[0], ROLE_LASER);

        rig.unit
            .on_message(rig.coordinator_addr, msg(MessageType::PairingResponse, &[]))
            .await;
        assert_eq!(
            rig.unit.coordinator().await,
            Some(rig.coordinator_addr)
        );

        // Scheduled events after pairing: a heartbeat, no more requests.
        rig.unit.pairing_tick().await;
        rig.unit.heartbeat_tick().await;
        // The unit retuned to channel 3 before the response arrived; move the
        // coordinator's radio there to observe the heartbeat.
        let dgram = rig.coordinator_rx.try_recv();
        assert!(dgram.is_err(), "coordinator moved off channel 3");
        let state = rig.unit.state.lock().await;
        assert!(matches!(state.pairing.state(), PairingState::Paired(_)));
    }

    #[tokio::test]
    async fn game_start_energizes_and_monitors() {
        let rig = rig();
        rig.unit
            .on_message(rig.coordinator_addr, msg(MessageType::GameStart, &[]))
            .await;
        assert!(rig.actuator.is_energized());
        assert_eq!(rig.actuator.intensity(), GAME_INTENSITY);
        assert!(rig.sensor.is_monitoring());

        rig.unit
            .on_message(rig.coordinator_addr, msg(MessageType::GameStop, &[]))
            .await;
        assert!(!rig.actuator.is_energized());
        assert!(!rig.sensor.is_monitoring());
    }

    #[tokio::test]
    async fn watchdog_forces_off_exactly_once() {
        let rig = rig();
        rig.unit
            .on_message(rig.coordinator_addr, msg(MessageType::PairingResponse, &[]))
            .await;
        rig.unit
            .on_message(rig.coordinator_addr, msg(MessageType::GameStart, &[]))
            .await;
        assert!(rig.actuator.is_energized());

        rig.clock.advance(FAILSAFE_TIMEOUT_MS);
        rig.unit.safety_check();
        assert!(rig.actuator.is_energized(), "threshold not yet exceeded");

        rig.clock.advance(1);
        rig.unit.safety_check();
        assert!(!rig.actuator.is_energized());
        assert!(rig.unit.fault_latched());
        assert_eq!(rig.actuator.de_energize_count(), 1);

        // Further checks must not fire again.
        rig.clock.advance(10_000);
        rig.unit.safety_check();
        assert_eq!(rig.actuator.de_energize_count(), 1);
    }

    #[tokio::test]
    async fn any_coordinator_message_refreshes_watchdog() {
        let rig = rig();
        rig.unit
            .on_message(rig.coordinator_addr, msg(MessageType::PairingResponse, &[]))
            .await;
        rig.unit
            .on_message(rig.coordinator_addr, msg(MessageType::GameStart, &[]))
            .await;

        // 29s of silence, then a heartbeat; another 29s still under threshold.
        rig.clock.advance(29_000);
        rig.unit
            .on_message(rig.coordinator_addr, msg(MessageType::Heartbeat, &[]))
            .await;
        rig.clock.advance(29_000);
        rig.unit.safety_check();
        assert!(rig.actuator.is_energized());

        // Heartbeats from strangers must not refresh the deadline.
        rig.unit
            .on_message(addr(7), msg(MessageType::Heartbeat, &[]))
            .await;
        rig.clock.advance(2_000);
        rig.unit.safety_check();
        assert!(!rig.actuator.is_energized());
    }

    #[tokio::test]
    async fn watchdog_independent_of_game_state() {
        let rig = rig();
        rig.unit
            .on_message(rig.coordinator_addr, msg(MessageType::PairingResponse, &[]))
            .await;
        // Manual laser on, never a game: the obligation holds regardless.
        rig.unit
            .on_message(rig.coordinator_addr, msg(MessageType::LaserOn, &[60]))
            .await;
        rig.clock.advance(FAILSAFE_TIMEOUT_MS + 1);
        rig.unit.safety_check();
        assert!(!rig.actuator.is_energized());
        assert!(rig.unit.fault_latched());
    }

    #[tokio::test]
    async fn manual_laser_on_while_unpaired_arms_watchdog() {
        let rig = rig();
        // No pairing: the command alone must start the silence deadline.
        rig.unit
            .on_message(rig.coordinator_addr, msg(MessageType::LaserOn, &[60]))
            .await;
        assert!(rig.actuator.is_energized());

        rig.clock.advance(FAILSAFE_TIMEOUT_MS + 1);
        rig.unit.safety_check();
        assert!(!rig.actuator.is_energized());
        assert!(rig.unit.fault_latched());
    }

    #[tokio::test]
    async fn beam_break_reported_only_when_paired() {
        let mut rig = rig();
        rig.unit.beam_broken(1).await;
        assert!(rig.coordinator_rx.try_recv().is_err());

        // Pair, and put both radios on the same channel.
        rig.unit
            .on_message(rig.coordinator_addr, msg(MessageType::PairingResponse, &[]))
            .await;
        rig.unit_radio_channel.set_channel(2).unwrap();
        rig.unit.beam_broken(4).await;
        let dgram = rig.coordinator_rx.recv().await.unwrap();
        let report = Message::decode(&dgram.bytes).unwrap();
        assert_eq!(report.kind, MessageType::BeamBroken);
        assert_eq!(report.payload[0], 4);
    }

    #[tokio::test]
    async fn reset_returns_to_scanning_and_clears_fault() {
        let rig = rig();
        rig.unit
            .on_message(rig.coordinator_addr, msg(MessageType::PairingResponse, &[]))
            .await;
        rig.unit
            .on_message(rig.coordinator_addr, msg(MessageType::GameStart, &[]))
            .await;
        rig.clock.advance(FAILSAFE_TIMEOUT_MS + 1);
        rig.unit.safety_check();
        assert!(rig.unit.fault_latched());

        rig.unit
            .on_message(rig.coordinator_addr, msg(MessageType::Reset, &[]))
            .await;
        assert!(!rig.unit.fault_latched());
        assert!(!rig.actuator.is_energized());
        assert_eq!(rig.unit.coordinator().await, None);
        // Radio back at the head of the scan plan.
        assert_eq!(rig.unit_radio_channel.channel(), 1);
    }

    #[tokio::test]
    async fn channel_change_retunes_and_acks() {
        let mut rig = rig();
        rig.unit
            .on_message(rig.coordinator_addr, msg(MessageType::ChannelChange, &[2]))
            .await;
        assert_eq!(rig.unit_radio_channel.channel(), 2);
        // The ack goes out on the new channel, where the coordinator radio is.
        let dgram = rig.coordinator_rx.recv().await.unwrap();
        assert_eq!(
            Message::decode(&dgram.bytes).unwrap().kind,
            MessageType::ChannelAck
        );
    }

    #[tokio::test]
    async fn invalid_channel_change_not_acked() {
        let mut rig = rig();
        rig.unit
            .on_message(rig.coordinator_addr, msg(MessageType::ChannelChange, &[0]))
            .await;
        assert_eq!(rig.unit_radio_channel.channel(), 1);
        assert!(rig.coordinator_rx.try_recv().is_err());
    }
}
