//! Finish-Signal Unit
//!
//! The button at the end of the course. Much simpler than a laser unit: no
//! actuator, no watchdog obligation. It scans the common channels for its
//! coordinator, broadcasts heartbeats once paired, and reports button
//! presses upstream.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::core::time::Clock;
use crate::protocol::dispatch::{run_receiver, MessageHandler};
use crate::protocol::message::{Message, MessageType};
use crate::protocol::transport::{Datagram, LinkAddr, Transport};

use super::pairing::{Pairing, ScanPlan, PAIRING_INTERVAL_MS};
use super::{frame, ROLE_FINISH};

/// Heartbeat period once paired. The finish unit announces itself by
/// broadcast rather than unicast, so a coordinator that restarted on the
/// same channel re-learns it without a new pairing round.
pub const HEARTBEAT_INTERVAL_MS: u64 = 3_000;

/// Finish unit configuration.
#[derive(Clone, Debug)]
pub struct FinishUnitConfig {
    /// This unit's module id.
    pub module_id: u8,
}

/// The finish-signal unit.
pub struct FinishUnit {
    config: FinishUnitConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    pairing: Mutex<Pairing>,
}

impl FinishUnit {
    /// Create a finish unit scanning the common channels.
    pub fn new(
        config: FinishUnitConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            transport,
            clock,
            pairing: Mutex::new(Pairing::new(ScanPlan::common_channels())),
        }
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Coordinator address, once paired.
    pub async fn coordinator(&self) -> Option<LinkAddr> {
        self.pairing.lock().await.coordinator()
    }

    /// One discovery timer tick. No-op once paired.
    pub async fn pairing_tick(&self) {
        let tick = {
            let mut pairing = self.pairing.lock().await;
            match pairing.on_timer() {
                Some(tick) => tick,
                None => return,
            }
        };
        debug!(channel = tick.channel, "sending pairing request");
        let request = frame(
            MessageType::PairingRequest,
            self.config.module_id,
            self.now_ms(),
            &[ROLE_FINISH],
        );
        if let Err(err) = self.transport.send(LinkAddr::BROADCAST, &request) {
            warn!(%err, "pairing request failed");
        }
        if let Some(channel) = tick.retune_to {
            debug!(channel, "no response, trying next common channel");
            if let Err(err) = self.transport.set_channel(channel) {
                warn!(%err, channel, "retune failed");
            }
        }
    }

    /// One heartbeat timer tick: broadcast a keep-alive. No-op while scanning.
    pub async fn heartbeat_tick(&self) {
        if self.pairing.lock().await.coordinator().is_none() {
            return;
        }
        let heartbeat = frame(
            MessageType::Heartbeat,
            self.config.module_id,
            self.now_ms(),
            &[],
        );
        if let Err(err) = self.transport.send(LinkAddr::BROADCAST, &heartbeat) {
            warn!(%err, "heartbeat send failed");
        }
    }

    /// Report a button press. Silently discarded while unpaired.
    pub async fn button_pressed(&self) {
        let coordinator = { self.pairing.lock().await.coordinator() };
        let Some(coordinator) = coordinator else {
            warn!("button press while unpaired, not reported");
            return;
        };
        info!("finish button pressed");
        let report = frame(
            MessageType::FinishPressed,
            self.config.module_id,
            self.now_ms(),
            &[],
        );
        if let Err(err) = self.transport.send(coordinator, &report) {
            warn!(%err, "finish press report failed");
        }
    }

    async fn on_message(&self, from: LinkAddr, msg: Message) {
        match msg.kind {
            MessageType::PairingResponse => {
                self.pairing.lock().await.on_response(from);
                if let Err(err) = self.transport.add_peer(from) {
                    warn!(%err, "coordinator peer registration failed");
                }
            }
            MessageType::Reset => {
                info!("reset command");
                let mut pairing = self.pairing.lock().await;
                if let Some(coordinator) = pairing.coordinator() {
                    if let Err(err) = self.transport.remove_peer(coordinator) {
                        warn!(%err, "coordinator peer teardown failed");
                    }
                }
                pairing.reset();
                let head = pairing.current_channel();
                drop(pairing);
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
            other => {
                debug!(kind = ?other, "message ignored by finish unit");
            }
        }
    }
}

impl MessageHandler for FinishUnit {
    fn handle_message(&self, from: LinkAddr, msg: Message) -> impl Future<Output = ()> + Send {
        self.on_message(from, msg)
    }
}

/// Drive a finish unit: receive dispatch plus its two cooperative timers.
pub async fn run(unit: Arc<FinishUnit>, rx: mpsc::Receiver<Datagram>) {
    tokio::join!(
        run_receiver(unit.clone(), rx),
        pairing_loop(unit.clone()),
        heartbeat_loop(unit),
    );
}

async fn pairing_loop(unit: Arc<FinishUnit>) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_millis(PAIRING_INTERVAL_MS));
    loop {
        interval.tick().await;
        unit.pairing_tick().await;
    }
}

async fn heartbeat_loop(unit: Arc<FinishUnit>) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    loop {
        interval.tick().await;
        unit.heartbeat_tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::ManualClock;
    use crate::protocol::hub::Hub;

    fn addr(n: u8) -> LinkAddr {
        LinkAddr([n; 6])
    }

    struct Rig {
        unit: FinishUnit,
        coordinator_rx: mpsc::Receiver<Datagram>,
        coordinator_addr: LinkAddr,
        unit_radio: Arc<dyn Transport>,
    }

    /// Finish unit starts on channel 1; coordinator radio sits on channel 6.
    fn rig() -> Rig {
        let hub = Hub::new();
        let coordinator_addr = addr(0);
        let (_coordinator_radio, coordinator_rx) = hub.attach(coordinator_addr, 6);
        let (unit_radio, _unit_rx) = hub.attach(addr(5), 1);
        let unit_radio: Arc<dyn Transport> = Arc::new(unit_radio);
        let clock = Arc::new(ManualClock::at(0));
        let unit = FinishUnit::new(
            FinishUnitConfig { module_id: 5 },
            unit_radio.clone(),
            clock,
        );
        Rig {
            unit,
            coordinator_rx,
            coordinator_addr,
            unit_radio,
        }
    }

    fn msg(kind: MessageType, payload: &[u8]) -> Message {
        Message::new(kind, 0, 0, payload).unwrap()
    }

    #[tokio::test]
    async fn scans_common_channels_and_pairs() {
        let mut rig = rig();

        // Three attempts on channel 1 reach nobody.
        for _ in 0..3 {
            rig.unit.pairing_tick().await;
        }
        assert!(rig.coordinator_rx.try_recv().is_err());
        assert_eq!(rig.unit_radio.channel(), 6);

        // First attempt on channel 6 lands on the coordinator.
        rig.unit.pairing_tick().await;
        let dgram = rig.coordinator_rx.recv().await.unwrap();
        let request = Message::decode(&dgram.bytes).unwrap();
        assert_eq!(request.kind, MessageType::PairingRequest);
        assert_eq!(request.source_id, 5);
        assert_eq!(request.payload[0], ROLE_FINISH);

        rig.unit
            .on_message(rig.coordinator_addr, msg(MessageType::PairingResponse, &[]))
            .await;
        assert_eq!(rig.unit.coordinator().await, Some(rig.coordinator_addr));

        // Once paired: no more requests, broadcast heartbeats instead.
        rig.unit.pairing_tick().await;
        rig.unit.heartbeat_tick().await;
        let dgram = rig.coordinator_rx.recv().await.unwrap();
        assert_eq!(
            Message::decode(&dgram.bytes).unwrap().kind,
            MessageType::Heartbeat
        );
        assert!(rig.coordinator_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn button_press_reported_only_when_paired() {
        let mut rig = rig();
        rig.unit.button_pressed().await;
        assert!(rig.coordinator_rx.try_recv().is_err());

        rig.unit
            .on_message(rig.coordinator_addr, msg(MessageType::PairingResponse, &[]))
            .await;
        rig.unit_radio.set_channel(6).unwrap();
        rig.unit.button_pressed().await;
        let dgram = rig.coordinator_rx.recv().await.unwrap();
        let report = Message::decode(&dgram.bytes).unwrap();
        assert_eq!(report.kind, MessageType::FinishPressed);
        assert_eq!(report.source_id, 5);
    }

    #[tokio::test]
    async fn reset_returns_to_common_channel_scan() {
        let rig = rig();
        rig.unit
            .on_message(rig.coordinator_addr, msg(MessageType::PairingResponse, &[]))
            .await;
        rig.unit_radio.set_channel(11).unwrap();

        rig.unit
            .on_message(rig.coordinator_addr, msg(MessageType::Reset, &[]))
            .await;
        assert_eq!(rig.unit.coordinator().await, None);
        assert_eq!(rig.unit_radio.channel(), 1);
    }

    #[tokio::test]
    async fn channel_change_retunes_and_acks() {
        let mut rig = rig();
        rig.unit
            .on_message(rig.coordinator_addr, msg(MessageType::ChannelChange, &[6]))
            .await;
        assert_eq!(rig.unit_radio.channel(), 6);
        let dgram = rig.coordinator_rx.recv().await.unwrap();
        assert_eq!(
            Message::decode(&dgram.bytes).unwrap().kind,
            MessageType::ChannelAck
        );
    }
}
