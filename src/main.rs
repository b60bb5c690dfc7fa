//! Laser Parcour Demo
//!
//! Drives a simulated mesh end to end: one coordinator, two laser units and
//! a finish button attached to an in-process hub. Pairs the units, runs a
//! scripted game with a beam break and a finish press, then migrates the
//! mesh to another channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use laser_parcour::coordinator::{self, Coordinator, CoordinatorConfig, JsonStatsStore};
use laser_parcour::core::time::MonotonicClock;
use laser_parcour::protocol::hub::Hub;
use laser_parcour::protocol::transport::LinkAddr;
use laser_parcour::satellite::finish::{self, FinishUnit, FinishUnitConfig};
use laser_parcour::satellite::laser::{
    self, Actuator, LaserUnit, LaserUnitConfig, SimulatedBeamSensor, SimulatedLaser,
};
use laser_parcour::{GameMode, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Laser Parcour v{}", VERSION);

    let hub = Hub::new();
    let clock = Arc::new(MonotonicClock::new());

    // Coordinator on channel 6, statistics persisted next to the binary.
    let (radio, coordinator_rx) = hub.attach(LinkAddr([0x10; 6]), 6);
    let store = Arc::new(JsonStatsStore::new("laser-parcour-stats.json"));
    let coordinator = Arc::new(Coordinator::new(
        CoordinatorConfig::default(),
        Arc::new(radio),
        clock.clone(),
        Some(store),
    ));
    tokio::spawn(coordinator::run(coordinator.clone(), coordinator_rx));

    // Two laser units. Starting their scan on the coordinator's channel
    // keeps the demo short; real units sweep the whole band.
    let mut lasers = Vec::new();
    for module_id in 1..=2u8 {
        let (radio, rx) = hub.attach(LinkAddr([module_id; 6]), 6);
        let actuator = Arc::new(SimulatedLaser::new());
        let unit = Arc::new(LaserUnit::new(
            LaserUnitConfig {
                module_id,
                start_channel: 6,
                sensor_id: module_id,
            },
            Arc::new(radio),
            clock.clone(),
            actuator.clone(),
            Arc::new(SimulatedBeamSensor::new()),
        ));
        tokio::spawn(laser::run(unit.clone(), rx));
        lasers.push((unit, actuator));
    }

    // Finish button, scanning the common channels from channel 1.
    let (radio, finish_rx) = hub.attach(LinkAddr([0x05; 6]), 1);
    let finish_unit = Arc::new(FinishUnit::new(
        FinishUnitConfig { module_id: 5 },
        Arc::new(radio),
        clock.clone(),
    ));
    tokio::spawn(finish::run(finish_unit.clone(), finish_rx));

    // Let discovery settle: the button needs a few retries on channel 1
    // before it reaches channel 6.
    info!("=== Pairing ===");
    tokio::time::sleep(Duration::from_secs(6)).await;
    for peer in coordinator.peers(10).await? {
        info!(
            module_id = peer.module_id,
            role = ?peer.role,
            addr = %peer.addr,
            "peer online"
        );
    }

    info!("=== Starting Run ===");
    coordinator.start(GameMode::SingleSpeedrun, "Demo Player").await?;
    tokio::time::sleep(Duration::from_secs(2)).await;
    let (unit, actuator) = &lasers[0];
    info!(energized = actuator.is_energized(), "laser 1 state");

    // The player clips a beam, serves the penalty dwell, then finishes.
    unit.beam_broken(unit.sensor_id()).await;
    tokio::time::sleep(Duration::from_secs(4)).await;
    finish_unit.button_pressed().await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let snap = coordinator.session_snapshot().await?;
    info!(
        state = ?snap.state,
        completion = ?snap.completion,
        elapsed_ms = snap.elapsed_ms,
        beam_breaks = snap.beam_breaks,
        penalty_ms = snap.accumulated_penalty_ms,
        "run finished"
    );
    let stats = coordinator.statistics().await?;
    info!(
        total_games = stats.total_games,
        best_time_ms = stats.best_time_ms,
        avg_time_ms = stats.avg_time_ms,
        total_beam_breaks = stats.total_beam_breaks,
        "aggregate statistics"
    );

    info!("=== Channel Migration ===");
    coordinator.migrate_channel(11, Duration::from_secs(1)).await?;
    tokio::time::sleep(Duration::from_secs(4)).await;
    let peers = coordinator.peers(10).await?;
    info!(online = peers.len(), "peers after migration");

    Ok(())
}
