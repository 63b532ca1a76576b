//! Visit Pacer - human-paced visit orchestration
//!
//! Dispatches a bounded number of visits to a target, paced either by a
//! human-like timing model or by a traffic schedule spread over a time
//! window, optionally rotating the egress identity before each visit.

// ── Core ────────────────────────────────────────────────────────────────────
pub mod types;
pub mod error;
pub mod config;
pub mod engine;

// ── Pacing ───────────────────────────────────────────────────────────────────
pub mod timing;
pub mod behavior;
pub mod schedule;
pub mod runner;

// ── Session ──────────────────────────────────────────────────────────────────
pub mod orchestrator;
pub mod rotation;

// ── Collaborators ────────────────────────────────────────────────────────────
pub mod network;
pub mod identity;
pub mod executor;

// ── Utilities ────────────────────────────────────────────────────────────────
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// ── Re-exports ────────────────────────────────────────────────────────────────

/// Shared types for use across all modules
pub use types::{
    DeviceIdentity, EngineEvent, RotationResult, RunnerEvent, SessionEvent, SessionMode,
    SimulationSession, VisitOutcome, VisitReport,
};

// Core engine
pub use config::PacerConfig;
pub use engine::{PacerEngine, ScheduleStatus};
pub use error::{PacerError, Result};

// Pacing
pub use runner::{RunnerState, ScheduleRunner, ScheduledVisitSink};
pub use schedule::{DistributionPattern, PeakWindow, SchedulePlan, TrafficSchedule};
pub use timing::TimingModel;

// Session
pub use orchestrator::{RequestExecutor, SessionOrchestrator, SessionParams};
pub use rotation::{CommandToggle, ConnectivityToggle, RotationController};

// Collaborators
pub use executor::HttpVisitExecutor;
pub use identity::{DeviceIdentityProvider, FixedIdentity, IdentityPool};
pub use network::{NetworkStateProvider, PublicIpMonitor};
