//! Coordinator
//!
//! Owns the three pieces of shared state (session, registry, statistics)
//! behind a single lock, constructed once at startup and handed by `Arc` to
//! every task and command handler. The lock is acquired with a bounded wait
//! at every call site; a timeout is a transient `Busy` error returned to the
//! caller, never an unbounded retry and never silently ignored.
//!
//! Sequences that check state, release the lock and then send radio messages
//! (game start/stop notification) are intentionally non-atomic: the set of
//! units recorded at the check may differ slightly from the set actually
//! notified. Accepted for a soft-real-time game controller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::core::time::Clock;
use crate::protocol::dispatch::{run_receiver, MessageHandler};
use crate::protocol::message::{Message, MessageType, MAX_PAYLOAD, WIRE_SIZE};
use crate::protocol::transport::{Datagram, LinkAddr, Transport};

use super::game::{
    AggregateStatistics, GameError, GameMode, GameSession, SessionConfig, SessionSnapshot,
};
use super::registry::{PeerRegistry, PeerRole, PeerView};
use super::store::{save_best_effort, StatsStore};

/// Bounded lock wait for control-surface commands.
const COMMAND_LOCK_WAIT: Duration = Duration::from_millis(250);

/// Bounded lock wait on the radio event path.
const EVENT_LOCK_WAIT: Duration = Duration::from_millis(50);

/// The radio driver does not expose per-frame RSSI; record a placeholder.
const DEFAULT_SIGNAL_QUALITY: i8 = -50;

/// Coordinator configuration.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// This unit's module id (0 by convention).
    pub module_id: u8,
    /// Initial session configuration.
    pub session: SessionConfig,
    /// Interval of the keep-alive broadcast that feeds satellite safety
    /// timers.
    pub heartbeat_interval: Duration,
    /// Cap on peer rows returned to the control surface.
    pub max_peer_views: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            module_id: 0,
            session: SessionConfig::default(),
            heartbeat_interval: Duration::from_secs(5),
            max_peer_views: 10,
        }
    }
}

struct Shared {
    session: GameSession,
    registry: PeerRegistry,
    /// `total_games` at the last successful persist, to save once per
    /// completion however the completion was detected.
    persisted_games: u32,
}

/// The coordinator unit: game session, peer registry and statistics behind
/// one lock, plus the radio.
pub struct Coordinator {
    config: CoordinatorConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn StatsStore>>,
    state: Mutex<Shared>,
}

impl Coordinator {
    /// Create a coordinator. Persisted statistics, if any, are loaded here.
    pub fn new(
        config: CoordinatorConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        store: Option<Arc<dyn StatsStore>>,
    ) -> Self {
        let mut session = GameSession::new(config.session.clone());
        let mut persisted_games = 0;
        if let Some(store) = &store {
            match store.load_statistics() {
                Ok(Some(stats)) => {
                    info!(total_games = stats.total_games, "loaded persisted statistics");
                    persisted_games = stats.total_games;
                    session.load_stats(stats);
                }
                Ok(None) => {}
                Err(err) => warn!(%err, "could not load persisted statistics"),
            }
        }
        Self {
            config,
            transport,
            clock,
            store,
            state: Mutex::new(Shared {
                session,
                registry: PeerRegistry::new(),
                persisted_games,
            }),
        }
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Acquire the state lock with a bounded wait.
    async fn lock(&self, wait: Duration) -> Result<MutexGuard<'_, Shared>, GameError> {
        match timeout(wait, self.state.lock()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                warn!(wait_ms = wait.as_millis() as u64, "state lock wait expired");
                Err(GameError::Busy)
            }
        }
    }

    /// Build a wire frame from this unit. Internal payloads always fit the
    /// fixed field.
    fn frame(&self, kind: MessageType, payload: &[u8]) -> [u8; WIRE_SIZE] {
        let mut buf = [0u8; MAX_PAYLOAD];
        buf[..payload.len()].copy_from_slice(payload);
        Message {
            kind,
            source_id: self.config.module_id,
            timestamp: self.now_ms() as u32,
            payload: buf,
        }
        .encode()
    }

    /// Evict silent peers and tear down their link associations.
    fn evict_and_teardown(&self, st: &mut Shared, now_ms: u64) {
        for peer in st.registry.evict_stale(now_ms) {
            if let Err(err) = self.transport.remove_peer(peer.addr) {
                warn!(module_id = peer.module_id, %err, "peer teardown failed");
            }
        }
    }

    /// Persist statistics if a run completed since the last save.
    fn persist_if_completed(&self, st: &mut Shared) {
        let stats = st.session.stats();
        if stats.total_games != st.persisted_games {
            st.persisted_games = stats.total_games;
            if let Some(store) = &self.store {
                save_best_effort(store.as_ref(), stats);
            }
        }
    }

    /// Unicast a frame to every listed unit, logging failures per unit.
    fn send_to_all(&self, targets: &[(u8, LinkAddr)], kind: MessageType) {
        let frame = self.frame(kind, &[]);
        for &(module_id, addr) in targets {
            if let Err(err) = self.transport.send(addr, &frame) {
                warn!(module_id, %err, kind = ?kind, "unit notification failed");
            }
        }
    }

    // =========================================================================
    // COMMAND SURFACE
    // =========================================================================

    /// Start a run.
    ///
    /// Precondition: at least one laser unit online; refused with the
    /// dedicated `NoEmitters` error otherwise, so the UI can say why.
    pub async fn start(&self, mode: GameMode, player_name: &str) -> Result<(), GameError> {
        let now = self.now_ms();
        let targets = {
            let mut st = self.lock(COMMAND_LOCK_WAIT).await?;
            self.evict_and_teardown(&mut st, now);
            if !st.registry.has_online(PeerRole::Laser, now) {
                return Err(GameError::NoEmitters);
            }
            st.session.start(mode, player_name, now)?;
            st.registry.addresses()
        };
        // Lock released: the notified set may lag the checked set.
        self.send_to_all(&targets, MessageType::GameStart);
        Ok(())
    }

    /// Abort the run.
    pub async fn stop(&self) -> Result<(), GameError> {
        let now = self.now_ms();
        let targets = {
            let mut st = self.lock(COMMAND_LOCK_WAIT).await?;
            st.session.stop(now)?;
            self.persist_if_completed(&mut st);
            st.registry.addresses()
        };
        self.send_to_all(&targets, MessageType::GameStop);
        Ok(())
    }

    /// Pause the run.
    pub async fn pause(&self) -> Result<(), GameError> {
        let now = self.now_ms();
        self.lock(COMMAND_LOCK_WAIT).await?.session.pause(now)
    }

    /// Resume a paused run.
    pub async fn resume(&self) -> Result<(), GameError> {
        let now = self.now_ms();
        self.lock(COMMAND_LOCK_WAIT).await?.session.resume(now)
    }

    /// Complete the run successfully (finish signal or debug surface).
    pub async fn finish(&self) -> Result<(), GameError> {
        let now = self.now_ms();
        let targets = {
            let mut st = self.lock(COMMAND_LOCK_WAIT).await?;
            st.session.finish(now)?;
            self.persist_if_completed(&mut st);
            st.registry.addresses()
        };
        self.send_to_all(&targets, MessageType::GameStop);
        Ok(())
    }

    /// Session row for display.
    pub async fn session_snapshot(&self) -> Result<SessionSnapshot, GameError> {
        let now = self.now_ms();
        let mut st = self.lock(COMMAND_LOCK_WAIT).await?;
        let snap = st.session.snapshot(now);
        // The time limit is detected lazily on reads; a completion observed
        // here still gets persisted.
        self.persist_if_completed(&mut st);
        Ok(snap)
    }

    /// Peer rows for display, after aging and eviction.
    pub async fn peers(&self, max: usize) -> Result<Vec<PeerView>, GameError> {
        let now = self.now_ms();
        let mut st = self.lock(COMMAND_LOCK_WAIT).await?;
        self.evict_and_teardown(&mut st, now);
        Ok(st.registry.snapshot(now, max.min(self.config.max_peer_views)))
    }

    /// Aggregate statistics.
    pub async fn statistics(&self) -> Result<AggregateStatistics, GameError> {
        Ok(self.lock(COMMAND_LOCK_WAIT).await?.session.stats().clone())
    }

    /// Manually energize or de-energize one laser unit.
    pub async fn set_laser(&self, module_id: u8, on: bool, intensity: u8) -> Result<(), GameError> {
        let addr = {
            let mut st = self.lock(COMMAND_LOCK_WAIT).await?;
            let addr = st
                .registry
                .address_of(module_id)
                .ok_or(GameError::UnknownModule(module_id))?;
            st.registry.set_laser_state(module_id, on);
            addr
        };
        info!(module_id, on, intensity, "manual laser control");
        let frame = if on {
            self.frame(MessageType::LaserOn, &[intensity])
        } else {
            self.frame(MessageType::LaserOff, &[])
        };
        self.transport.send(addr, &frame)?;
        Ok(())
    }

    /// Return a satellite to its boot state so it re-pairs.
    ///
    /// Broadcast rather than unicast: the unit may have lost its pairing and
    /// with it any unicast reachability.
    pub async fn reset_peer(&self, module_id: u8) -> Result<(), GameError> {
        info!(module_id, "resetting unit");
        self.transport
            .send(LinkAddr::BROADCAST, &self.frame(MessageType::Reset, &[]))?;
        Ok(())
    }

    // =========================================================================
    // CHANNEL MIGRATION
    // =========================================================================

    /// Retune the whole mesh to `new_channel`.
    ///
    /// The notification is broadcast three times with 100 ms spacing;
    /// repetition substitutes for acknowledgement since the broadcast itself
    /// cannot be acked atomically. Satellites reply with a courtesy
    /// ChannelAck that is not waited on. Best-effort by contract: a unit
    /// that misses all three frames is stranded until it re-scans.
    pub async fn migrate_channel(
        &self,
        new_channel: u8,
        grace: Duration,
    ) -> Result<(), GameError> {
        info!(new_channel, "migrating mesh channel");
        let frame = self.frame(MessageType::ChannelChange, &[new_channel]);
        for _ in 0..3 {
            if let Err(err) = self.transport.send(LinkAddr::BROADCAST, &frame) {
                warn!(%err, "channel change notification failed");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.transport.set_channel(new_channel)?;
        self.transport.add_peer(LinkAddr::BROADCAST)?;
        tokio::time::sleep(grace).await;
        Ok(())
    }

    // =========================================================================
    // RADIO EVENTS
    // =========================================================================

    async fn on_message(&self, from: LinkAddr, msg: Message) -> Result<(), GameError> {
        let now = self.now_ms();
        match msg.kind {
            MessageType::PairingRequest => {
                let role = PeerRole::from_wire(msg.payload[0]);
                {
                    let mut st = self.lock(EVENT_LOCK_WAIT).await?;
                    st.registry.observe(
                        msg.source_id,
                        from,
                        Some(role),
                        DEFAULT_SIGNAL_QUALITY,
                        now,
                    );
                }
                self.transport.add_peer(from)?;
                self.transport
                    .send(from, &self.frame(MessageType::PairingResponse, &[]))?;
                info!(module_id = msg.source_id, ?role, %from, "pairing response sent");
            }
            MessageType::Heartbeat => {
                {
                    let mut st = self.lock(EVENT_LOCK_WAIT).await?;
                    st.registry
                        .observe(msg.source_id, from, None, DEFAULT_SIGNAL_QUALITY, now);
                }
                // Re-establish the link association; covers units that kept
                // heartbeating across a coordinator restart.
                self.transport.add_peer(from)?;
            }
            MessageType::BeamBroken => {
                let mut st = self.lock(EVENT_LOCK_WAIT).await?;
                st.registry
                    .observe(msg.source_id, from, None, DEFAULT_SIGNAL_QUALITY, now);
                match st.session.beam_break(msg.source_id, now) {
                    Ok(()) => {}
                    // Breaks outside a run (or during a dwell) carry no game
                    // meaning; drop them quietly.
                    Err(GameError::InvalidState { .. }) => {
                        debug!(module_id = msg.source_id, "beam break outside active run")
                    }
                    Err(err) => return Err(err),
                }
            }
            MessageType::FinishPressed => {
                let targets = {
                    let mut st = self.lock(EVENT_LOCK_WAIT).await?;
                    st.registry
                        .observe(msg.source_id, from, None, DEFAULT_SIGNAL_QUALITY, now);
                    match st.session.finish(now) {
                        Ok(()) => {
                            self.persist_if_completed(&mut st);
                            Some(st.registry.addresses())
                        }
                        Err(GameError::InvalidState { .. }) => {
                            debug!("finish signal outside active run");
                            None
                        }
                        Err(err) => return Err(err),
                    }
                };
                if let Some(targets) = targets {
                    info!(module_id = msg.source_id, "run solved via finish signal");
                    self.send_to_all(&targets, MessageType::GameStop);
                }
            }
            MessageType::StatusUpdate | MessageType::ChannelAck => {
                let mut st = self.lock(EVENT_LOCK_WAIT).await?;
                st.registry
                    .observe(msg.source_id, from, None, DEFAULT_SIGNAL_QUALITY, now);
                debug!(module_id = msg.source_id, kind = ?msg.kind, "status message");
            }
            other => {
                debug!(module_id = msg.source_id, kind = ?other, "unexpected message, ignored");
            }
        }
        Ok(())
    }
}

impl MessageHandler for Coordinator {
    fn handle_message(&self, from: LinkAddr, msg: Message) -> impl Future<Output = ()> + Send {
        async move {
            if let Err(err) = self.on_message(from, msg).await {
                warn!(%err, kind = ?msg.kind, %from, "coordinator event failed");
            }
        }
    }
}

// =============================================================================
// RUN LOOPS
// =============================================================================

/// Drive the coordinator: receive dispatch plus the keep-alive broadcast.
///
/// Broadcasts a Reset first so satellites that outlived a coordinator
/// restart drop their stale pairing and re-scan.
pub async fn run(coordinator: Arc<Coordinator>, rx: mpsc::Receiver<Datagram>) {
    let reset = coordinator.frame(MessageType::Reset, &[]);
    if let Err(err) = coordinator.transport.send(LinkAddr::BROADCAST, &reset) {
        warn!(%err, "startup reset broadcast failed");
    }
    tokio::join!(
        run_receiver(coordinator.clone(), rx),
        heartbeat_loop(coordinator),
    );
}

async fn heartbeat_loop(coordinator: Arc<Coordinator>) {
    let mut interval = tokio::time::interval(coordinator.config.heartbeat_interval);
    loop {
        interval.tick().await;
        let frame = coordinator.frame(MessageType::Heartbeat, &[]);
        if let Err(err) = coordinator.transport.send(LinkAddr::BROADCAST, &frame) {
            warn!(%err, "heartbeat broadcast failed");
        }
    }
}
