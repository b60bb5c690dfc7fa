//! Game Session State Machine
//!
//! The authoritative session run by the coordinator. Pure state: every
//! operation takes the current time explicitly, so the whole machine is
//! testable without timers. All time arithmetic is integer milliseconds.
//!
//! ```text
//! Idle ──start──> Running <──────┐
//!                   │  ▲         │ dwell elapsed
//!            break  │  │ resume  │
//!                   ▼  │         │
//!                Penalty ──pause─┴──> Paused
//!                   │                   │
//!                   └──finish/stop/limit┴──> Complete
//! ```
//!
//! Penalty time is charged to the score at the instant of the break; the
//! Penalty state itself is only a display dwell and reverts to Running with
//! no further time adjustment.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::protocol::transport::TransportError;

/// Fixed dwell of the Penalty display state.
pub const PENALTY_DWELL_MS: u64 = 3_000;

// =============================================================================
// ERRORS
// =============================================================================

/// Command-surface error taxonomy.
///
/// `NoEmitters` is deliberately distinct from `InvalidState` so the control
/// surface can show an actionable message instead of a generic failure.
#[derive(Debug, Error)]
pub enum GameError {
    /// Start refused: the registry has no online laser unit.
    #[error("no online laser units")]
    NoEmitters,
    /// Command not valid for the current session state.
    #[error("cannot {command} while session is {state:?}")]
    InvalidState {
        /// The refused command.
        command: &'static str,
        /// Session state at the time.
        state: GameState,
    },
    /// The coordinator state lock was not acquired within its bounded wait.
    #[error("coordinator busy")]
    Busy,
    /// No registered unit with this module id.
    #[error("unknown module id {0}")]
    UnknownModule(u8),
    /// Radio-side failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

// =============================================================================
// STATES, MODES, COMPLETION
// =============================================================================

/// Session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameState {
    /// Waiting for a run to start.
    Idle,
    /// Run in progress.
    Running,
    /// Beam-break display dwell; reverts to Running automatically.
    Penalty,
    /// Run suspended by the operator; the clock is frozen.
    Paused,
    /// Run finished; see [`CompletionStatus`] for the cause.
    Complete,
    /// Unrecoverable local fault. Sink state, not reached in normal operation.
    Error,
}

/// Game mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameMode {
    /// Single player against the clock.
    SingleSpeedrun,
    /// Multi-player challenge.
    Multiplayer,
    /// Training: breaks are counted but not penalized.
    Training,
    /// Custom settings.
    Custom,
}

/// How a run ended. Write-once per session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// Not completed yet.
    None,
    /// Completed via the finish signal.
    Solved,
    /// Elapsed time crossed the configured maximum.
    AbortedByTimeLimit,
    /// Stopped by the operator.
    AbortedManually,
}

// =============================================================================
// CONFIG
// =============================================================================

/// Session configuration, supplied by the control surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Game mode.
    pub mode: GameMode,
    /// Maximum run duration in seconds; `None` means unlimited.
    pub max_duration_s: Option<u32>,
    /// Penalty charged per beam break, seconds.
    pub penalty_s: u32,
    /// Pre-game countdown, seconds (consumed by the display collaborator).
    pub countdown_s: u32,
    /// Maximum players for multiplayer.
    pub max_players: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: GameMode::SingleSpeedrun,
            max_duration_s: Some(180),
            penalty_s: 5,
            countdown_s: 5,
            max_players: 8,
        }
    }
}

// =============================================================================
// PLAYER RECORD AND STATISTICS
// =============================================================================

/// The active or most recent run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PlayerRecord {
    /// Player name.
    pub name: String,
    /// Coordinator clock at start.
    pub start_ms: u64,
    /// Coordinator clock at completion; 0 while running.
    pub end_ms: u64,
    /// Final score time: raw duration plus accumulated penalty. Frozen at
    /// completion; computed live from the snapshot while running.
    pub elapsed_ms: u64,
    /// Beam breaks this run.
    pub beam_breaks: u16,
    /// Penalty charged so far.
    pub accumulated_penalty_ms: u64,
    /// How the run ended.
    pub completion: CompletionStatus,
}

impl Default for CompletionStatus {
    fn default() -> Self {
        Self::None
    }
}

/// Totals across all completed runs. Updated once per completion, never
/// rolled back. The only state that survives a restart.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateStatistics {
    /// Completed runs.
    pub total_games: u32,
    /// Best (lowest) final time, ms. 0 until the first completion.
    pub best_time_ms: u64,
    /// Worst (highest) final time, ms.
    pub worst_time_ms: u64,
    /// Truncating average final time, ms.
    pub avg_time_ms: u64,
    /// Beam breaks across all runs.
    pub total_beam_breaks: u32,
    /// Cumulative final time across all runs, ms.
    pub total_playtime_ms: u64,
}

impl AggregateStatistics {
    fn record(&mut self, elapsed_ms: u64, beam_breaks: u16) {
        // Increment before dividing: the average can never divide by zero.
        self.total_games += 1;
        self.total_beam_breaks += beam_breaks as u32;
        self.total_playtime_ms += elapsed_ms;
        if self.best_time_ms == 0 || elapsed_ms < self.best_time_ms {
            self.best_time_ms = elapsed_ms;
        }
        if elapsed_ms > self.worst_time_ms {
            self.worst_time_ms = elapsed_ms;
        }
        self.avg_time_ms = self.total_playtime_ms / self.total_games as u64;
    }
}

/// Read-only session row for the control surface.
#[derive(Clone, Debug, Serialize)]
pub struct SessionSnapshot {
    /// Session state.
    pub state: GameState,
    /// Mode of the current/last run.
    pub mode: GameMode,
    /// Player name.
    pub player_name: String,
    /// Score time so far (raw + penalty), or final time once complete.
    pub elapsed_ms: u64,
    /// Beam breaks so far.
    pub beam_breaks: u16,
    /// Penalty charged so far.
    pub accumulated_penalty_ms: u64,
    /// How the run ended, if it has.
    pub completion: CompletionStatus,
}

// =============================================================================
// SESSION
// =============================================================================

/// One session instance. A new run is a fresh record, not a reset of the old
/// one; transitions into Complete are one-way.
#[derive(Debug)]
pub struct GameSession {
    state: GameState,
    config: SessionConfig,
    player: PlayerRecord,
    stats: AggregateStatistics,
    paused_at_ms: Option<u64>,
    paused_total_ms: u64,
    penalty_until_ms: Option<u64>,
}

impl GameSession {
    /// Create an idle session with the given configuration.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            state: GameState::Idle,
            config,
            player: PlayerRecord::default(),
            stats: AggregateStatistics::default(),
            paused_at_ms: None,
            paused_total_ms: 0,
            penalty_until_ms: None,
        }
    }

    /// Current state (after lazy transitions as of `now_ms`).
    pub fn state(&mut self, now_ms: u64) -> GameState {
        self.refresh(now_ms);
        self.state
    }

    /// Current configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Replace the configuration. Takes effect for the next run.
    pub fn set_config(&mut self, config: SessionConfig) {
        self.config = config;
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> &AggregateStatistics {
        &self.stats
    }

    /// Install statistics loaded from the persistence collaborator.
    pub fn load_stats(&mut self, stats: AggregateStatistics) {
        self.stats = stats;
    }

    /// Raw running duration, excluding paused time and penalty.
    fn raw_elapsed_ms(&self, now_ms: u64) -> u64 {
        let effective = self.paused_at_ms.unwrap_or(now_ms);
        effective
            .saturating_sub(self.player.start_ms)
            .saturating_sub(self.paused_total_ms)
    }

    /// Score time: raw duration plus accumulated penalty.
    fn score_ms(&self, now_ms: u64) -> u64 {
        self.raw_elapsed_ms(now_ms) + self.player.accumulated_penalty_ms
    }

    /// Apply lazy transitions: penalty dwell expiry and the time limit.
    ///
    /// The time limit is detected here, on reads and at the top of every
    /// command, rather than by a dedicated timer.
    fn refresh(&mut self, now_ms: u64) {
        if self.state == GameState::Penalty {
            if let Some(until) = self.penalty_until_ms {
                if now_ms >= until {
                    // The penalty was charged at the break; the dwell ends
                    // with no further adjustment.
                    self.penalty_until_ms = None;
                    self.state = GameState::Running;
                }
            }
        }
        if matches!(self.state, GameState::Running | GameState::Penalty) {
            if let Some(limit_s) = self.config.max_duration_s {
                if self.score_ms(now_ms) >= limit_s as u64 * 1000 {
                    warn!("time limit reached, aborting run");
                    self.complete(CompletionStatus::AbortedByTimeLimit, now_ms);
                }
            }
        }
    }

    /// Start a new run. The online-emitter precondition is the caller's;
    /// this checks session state only.
    pub fn start(&mut self, mode: GameMode, name: &str, now_ms: u64) -> Result<(), GameError> {
        self.refresh(now_ms);
        if !matches!(self.state, GameState::Idle | GameState::Complete) {
            return Err(GameError::InvalidState {
                command: "start",
                state: self.state,
            });
        }
        self.config.mode = mode;
        self.player = PlayerRecord {
            name: if name.is_empty() { "Player 1".into() } else { name.into() },
            start_ms: now_ms,
            ..PlayerRecord::default()
        };
        self.paused_at_ms = None;
        self.paused_total_ms = 0;
        self.penalty_until_ms = None;
        self.state = GameState::Running;
        info!(?mode, player = %self.player.name, "run started");
        Ok(())
    }

    /// Register a beam break.
    ///
    /// The penalty is charged immediately; the Penalty state is only the
    /// display dwell. In Training mode the break is counted but neither
    /// penalized nor dwelled on. Breaks during an active dwell are ignored.
    pub fn beam_break(&mut self, sensor_id: u8, now_ms: u64) -> Result<(), GameError> {
        self.refresh(now_ms);
        if self.state != GameState::Running {
            return Err(GameError::InvalidState {
                command: "beam_break",
                state: self.state,
            });
        }
        self.player.beam_breaks += 1;
        if self.config.mode != GameMode::Training {
            self.player.accumulated_penalty_ms += self.config.penalty_s as u64 * 1000;
            self.penalty_until_ms = Some(now_ms + PENALTY_DWELL_MS);
            self.state = GameState::Penalty;
        }
        info!(
            sensor_id,
            total_breaks = self.player.beam_breaks,
            penalty_ms = self.player.accumulated_penalty_ms,
            "beam broken"
        );
        Ok(())
    }

    /// Pause the run, freezing the clock.
    pub fn pause(&mut self, now_ms: u64) -> Result<(), GameError> {
        self.refresh(now_ms);
        if !matches!(self.state, GameState::Running | GameState::Penalty) {
            return Err(GameError::InvalidState {
                command: "pause",
                state: self.state,
            });
        }
        self.paused_at_ms = Some(now_ms);
        self.penalty_until_ms = None;
        self.state = GameState::Paused;
        info!("run paused");
        Ok(())
    }

    /// Resume a paused run; paused duration is excluded from elapsed time.
    pub fn resume(&mut self, now_ms: u64) -> Result<(), GameError> {
        if self.state != GameState::Paused {
            return Err(GameError::InvalidState {
                command: "resume",
                state: self.state,
            });
        }
        if let Some(paused_at) = self.paused_at_ms.take() {
            self.paused_total_ms += now_ms.saturating_sub(paused_at);
        }
        self.state = GameState::Running;
        info!("run resumed");
        Ok(())
    }

    /// Complete the run via the finish signal.
    pub fn finish(&mut self, now_ms: u64) -> Result<(), GameError> {
        self.refresh(now_ms);
        if !matches!(self.state, GameState::Running | GameState::Penalty) {
            return Err(GameError::InvalidState {
                command: "finish",
                state: self.state,
            });
        }
        self.complete(CompletionStatus::Solved, now_ms);
        Ok(())
    }

    /// Abort the run from the control surface.
    pub fn stop(&mut self, now_ms: u64) -> Result<(), GameError> {
        self.refresh(now_ms);
        if !matches!(
            self.state,
            GameState::Running | GameState::Penalty | GameState::Paused
        ) {
            return Err(GameError::InvalidState {
                command: "stop",
                state: self.state,
            });
        }
        self.complete(CompletionStatus::AbortedManually, now_ms);
        Ok(())
    }

    /// Finalize the run and fold it into the statistics.
    ///
    /// `completion` is write-once: a cause recorded earlier (e.g. the lazily
    /// detected time limit) is never overwritten by a later one.
    fn complete(&mut self, completion: CompletionStatus, now_ms: u64) {
        self.player.end_ms = self.paused_at_ms.unwrap_or(now_ms);
        self.player.elapsed_ms = self.score_ms(now_ms);
        if self.player.completion == CompletionStatus::None {
            self.player.completion = completion;
        }
        self.stats
            .record(self.player.elapsed_ms, self.player.beam_breaks);
        self.state = GameState::Complete;
        info!(
            elapsed_ms = self.player.elapsed_ms,
            breaks = self.player.beam_breaks,
            completion = ?self.player.completion,
            "run complete"
        );
    }

    /// Session row for display. Elapsed time is computed live only while the
    /// run is active; once complete it stays frozen.
    pub fn snapshot(&mut self, now_ms: u64) -> SessionSnapshot {
        self.refresh(now_ms);
        let elapsed_ms = match self.state {
            GameState::Running | GameState::Penalty | GameState::Paused => self.score_ms(now_ms),
            _ => self.player.elapsed_ms,
        };
        SessionSnapshot {
            state: self.state,
            mode: self.config.mode,
            player_name: self.player.name.clone(),
            elapsed_ms,
            beam_breaks: self.player.beam_breaks,
            accumulated_penalty_ms: self.player.accumulated_penalty_ms,
            completion: self.player.completion,
        }
    }
}

impl Default for GameSession {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(penalty_s: u32, max_s: Option<u32>) -> GameSession {
        GameSession::new(SessionConfig {
            penalty_s,
            max_duration_s: max_s,
            ..SessionConfig::default()
        })
    }

    #[test]
    fn penalty_charged_at_break_instant() {
        let mut s = session(15, None);
        s.start(GameMode::SingleSpeedrun, "p", 0).unwrap();

        s.beam_break(1, 10_000).unwrap();
        let snap = s.snapshot(10_000);
        assert_eq!(snap.accumulated_penalty_ms, 15_000);
        assert_eq!(snap.state, GameState::Penalty);
        // Charged immediately: score at the break already includes it.
        assert_eq!(snap.elapsed_ms, 25_000);

        s.finish(40_000).unwrap();
        let snap = s.snapshot(40_000);
        assert_eq!(snap.elapsed_ms, 55_000);
        assert_eq!(snap.completion, CompletionStatus::Solved);
    }

    #[test]
    fn penalty_dwell_reverts_to_running() {
        let mut s = session(5, None);
        s.start(GameMode::SingleSpeedrun, "p", 0).unwrap();
        s.beam_break(1, 1_000).unwrap();
        assert_eq!(s.state(3_999), GameState::Penalty);
        assert_eq!(s.state(4_000), GameState::Running);
        // No second charge when the dwell ends.
        assert_eq!(s.snapshot(4_000).accumulated_penalty_ms, 5_000);
    }

    #[test]
    fn breaks_during_dwell_ignored() {
        let mut s = session(5, None);
        s.start(GameMode::SingleSpeedrun, "p", 0).unwrap();
        s.beam_break(1, 1_000).unwrap();
        assert!(s.beam_break(2, 2_000).is_err());
        assert_eq!(s.snapshot(2_000).beam_breaks, 1);
    }

    #[test]
    fn training_mode_counts_but_never_penalizes() {
        let mut s = session(5, None);
        s.start(GameMode::Training, "p", 0).unwrap();
        s.beam_break(1, 1_000).unwrap();
        let snap = s.snapshot(1_000);
        assert_eq!(snap.state, GameState::Running);
        assert_eq!(snap.beam_breaks, 1);
        assert_eq!(snap.accumulated_penalty_ms, 0);
    }

    #[test]
    fn paused_time_excluded_from_elapsed() {
        let mut s = session(5, None);
        s.start(GameMode::SingleSpeedrun, "p", 0).unwrap();
        s.pause(10_000).unwrap();
        // Clock frozen at the pause instant.
        assert_eq!(s.snapshot(25_000).elapsed_ms, 10_000);
        s.resume(30_000).unwrap();
        s.finish(50_000).unwrap();
        // 50s wall clock minus 20s paused.
        assert_eq!(s.snapshot(50_000).elapsed_ms, 30_000);
    }

    #[test]
    fn completion_status_is_write_once() {
        let mut s = session(5, Some(30));
        s.start(GameMode::SingleSpeedrun, "p", 0).unwrap();

        // Time limit crossed; a later manual stop must not rewrite the cause.
        let err = s.stop(31_000);
        assert!(err.is_err());
        let snap = s.snapshot(31_000);
        assert_eq!(snap.state, GameState::Complete);
        assert_eq!(snap.completion, CompletionStatus::AbortedByTimeLimit);
    }

    #[test]
    fn time_limit_detected_lazily_on_read() {
        let mut s = session(5, Some(60));
        s.start(GameMode::SingleSpeedrun, "p", 0).unwrap();
        assert_eq!(s.snapshot(59_999).state, GameState::Running);
        let snap = s.snapshot(60_000);
        assert_eq!(snap.state, GameState::Complete);
        assert_eq!(snap.completion, CompletionStatus::AbortedByTimeLimit);
    }

    #[test]
    fn manual_stop_sets_aborted_manually() {
        let mut s = session(5, None);
        s.start(GameMode::SingleSpeedrun, "p", 0).unwrap();
        s.stop(5_000).unwrap();
        assert_eq!(s.snapshot(5_000).completion, CompletionStatus::AbortedManually);
    }

    #[test]
    fn invalid_transitions_rejected() {
        let mut s = session(5, None);
        assert!(matches!(
            s.stop(0),
            Err(GameError::InvalidState { command: "stop", .. })
        ));
        assert!(s.pause(0).is_err());
        assert!(s.resume(0).is_err());
        assert!(s.finish(0).is_err());
        assert!(s.beam_break(0, 0).is_err());

        s.start(GameMode::SingleSpeedrun, "p", 0).unwrap();
        assert!(matches!(
            s.start(GameMode::SingleSpeedrun, "q", 1),
            Err(GameError::InvalidState { command: "start", .. })
        ));
    }

    #[test]
    fn new_run_is_a_fresh_record() {
        let mut s = session(5, None);
        s.start(GameMode::SingleSpeedrun, "first", 0).unwrap();
        s.beam_break(1, 1_000).unwrap();
        s.stop(10_000).unwrap();

        s.start(GameMode::SingleSpeedrun, "second", 20_000).unwrap();
        let snap = s.snapshot(21_000);
        assert_eq!(snap.player_name, "second");
        assert_eq!(snap.beam_breaks, 0);
        assert_eq!(snap.accumulated_penalty_ms, 0);
        assert_eq!(snap.completion, CompletionStatus::None);
        assert_eq!(snap.elapsed_ms, 1_000);
    }

    #[test]
    fn statistics_monotonicity() {
        let mut s = session(5, None);
        let runs: &[(u64, u64)] = &[(0, 30_000), (40_000, 50_000), (60_000, 120_000)];
        let mut last_games = 0;
        let mut last_best = u64::MAX;
        let mut last_worst = 0;
        for &(start, end) in runs {
            s.start(GameMode::SingleSpeedrun, "p", start).unwrap();
            s.finish(end).unwrap();
            let stats = s.stats().clone();
            assert_eq!(stats.total_games, last_games + 1);
            assert!(stats.best_time_ms <= last_best);
            assert!(stats.worst_time_ms >= last_worst);
            last_games = stats.total_games;
            last_best = stats.best_time_ms;
            last_worst = stats.worst_time_ms;
        }
        let stats = s.stats();
        assert_eq!(stats.total_games, 3);
        assert_eq!(stats.best_time_ms, 10_000);
        assert_eq!(stats.worst_time_ms, 60_000);
        assert_eq!(stats.avg_time_ms, (30_000 + 10_000 + 60_000) / 3);
        assert_eq!(stats.total_playtime_ms, 100_000);
    }

    #[test]
    fn average_is_truncating_division() {
        let mut s = session(5, None);
        s.start(GameMode::SingleSpeedrun, "p", 0).unwrap();
        s.finish(10_001).unwrap();
        s.start(GameMode::SingleSpeedrun, "p", 20_000).unwrap();
        s.finish(30_002).unwrap();
        assert_eq!(s.stats().avg_time_ms, 10_001); // (10_001 + 10_002) / 2
    }
}
