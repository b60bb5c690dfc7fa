//! Coordinator Role
//!
//! The unit that owns the authoritative game session and the registry of
//! satellite units. All shared state (session, registry, statistics) lives
//! behind one lock inside [`Coordinator`]; timers and the radio receive path
//! funnel through it with bounded waits.
//!
//! ## Module Structure
//!
//! - `registry`: known satellite units, liveness aging and eviction
//! - `game`: session state machine, penalty accounting, statistics
//! - `coordinator`: command surface, message handling, channel migration
//! - `store`: statistics persistence seam

pub mod coordinator;
pub mod game;
pub mod registry;
pub mod store;

// Re-export key types
pub use coordinator::{run, Coordinator, CoordinatorConfig};
pub use game::{
    AggregateStatistics, CompletionStatus, GameError, GameMode, GameSession, GameState,
    SessionConfig, SessionSnapshot,
};
pub use registry::{Liveness, PeerRegistry, PeerRole, PeerView};
pub use store::{JsonStatsStore, StatsStore};
