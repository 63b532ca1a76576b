//! Shared types and constants for Visit Pacer

use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ==================== CONSTANTS ====================

/// Sentinel reported by network providers when the egress identity is not known
pub const UNKNOWN_IDENTITY: &str = "Unknown";

/// Granularity of every cooperative wait in the driving loops
pub const CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Bounded wait for a single visit to complete
pub const DEFAULT_VISIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Content length handed to the dwell planner for every visit
pub const DEFAULT_CONTENT_LENGTH: u8 = 50;

/// Floor applied to non-positive schedule intervals (ms)
pub const MIN_SCHEDULE_INTERVAL_MS: u64 = 1000;

/// Hours in a schedule day
pub const HOURS_PER_DAY: usize = 24;

/// Returns true for empty or sentinel egress identities
pub fn is_placeholder_identity(identity: &str) -> bool {
    let trimmed = identity.trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case(UNKNOWN_IDENTITY)
}

// ==================== DEVICE IDENTITY ====================

/// Client form factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    /// Phone
    Mobile,
    /// Tablet
    Tablet,
    /// Desktop browser
    Desktop,
}

/// Hardware tier, used for page-load timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceTier {
    /// Budget hardware
    Budget,
    /// Mid-range hardware
    MidRange,
    /// Flagship hardware
    Flagship,
}

impl Default for DeviceTier {
    fn default() -> Self {
        Self::MidRange
    }
}

/// Device identity attached to a visit. Opaque to the core beyond timing hints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Platform name (android, ios, windows, ...)
    pub platform: String,
    /// Hardware tier
    pub tier: DeviceTier,
    /// Client type
    pub client_type: ClientType,
    /// User agent string
    pub user_agent: String,
}

impl DeviceIdentity {
    /// Phones read faster than desktop users
    pub fn is_mobile(&self) -> bool {
        self.client_type == ClientType::Mobile
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:?}/{:?}", self.platform, self.client_type, self.tier)
    }
}

// ==================== VISITS ====================

/// What the request executor reports for a completed visit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitReport {
    /// HTTP status code
    pub status_code: u16,
    /// Whether the executor considers the visit successful
    pub success: bool,
    /// Time to response
    pub latency: Duration,
}

/// Recorded result of one visit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitOutcome {
    /// When the outcome was recorded
    pub timestamp: DateTime<Utc>,
    /// Success flag
    pub success: bool,
    /// Status code, if a response arrived
    pub status_code: Option<u16>,
    /// Latency (ms)
    pub latency_ms: u64,
    /// Egress identity at dispatch time
    pub egress_identity: String,
    /// Error description for failed visits
    pub error: Option<String>,
}

impl VisitOutcome {
    /// Outcome built from an executor report
    pub fn from_report(report: &VisitReport, egress_identity: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            success: report.success,
            status_code: Some(report.status_code),
            latency_ms: report.latency.as_millis() as u64,
            egress_identity: egress_identity.into(),
            error: None,
        }
    }

    /// Failed outcome with no response
    pub fn failed(
        egress_identity: impl Into<String>,
        latency: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            success: false,
            status_code: None,
            latency_ms: latency.as_millis() as u64,
            egress_identity: egress_identity.into(),
            error: Some(error.into()),
        }
    }
}

// ==================== ROTATION ====================

/// Why a rotation failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RotationFailure {
    /// Another rotation holds the controller
    InProgress,
    /// No connectivity before the toggle
    NotConnected,
    /// The privileged toggle path is unavailable
    CapabilityUnavailable,
    /// A toggle command failed
    ToggleFailed(String),
    /// Connectivity did not come back within the timeout
    ReconnectTimeout,
    /// Identity missing or equal to the previous one
    IdentityUnchanged,
}

impl RotationFailure {
    /// Failures that warrant the single retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ToggleFailed(_) | Self::ReconnectTimeout | Self::IdentityUnchanged
        )
    }

    /// Human-readable reason
    pub fn message(&self) -> String {
        match self {
            Self::InProgress => "rotation already in progress".to_string(),
            Self::NotConnected => "network not connected".to_string(),
            Self::CapabilityUnavailable => "rotation capability unavailable".to_string(),
            Self::ToggleFailed(reason) => format!("toggle failed: {reason}"),
            Self::ReconnectTimeout => "failed to reconnect".to_string(),
            Self::IdentityUnchanged => "identity did not change".to_string(),
        }
    }
}

/// Result of one rotation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationResult {
    /// Success flag
    pub success: bool,
    /// Identity observed before the toggle
    pub identity_before: String,
    /// Identity observed after reconnection
    pub identity_after: String,
    /// Human-readable message
    pub message: String,
    /// Time spent waiting for reconnection
    pub reconnect_wait: Duration,
    /// Failure class, `None` on success
    pub failure: Option<RotationFailure>,
}

impl RotationResult {
    /// Successful rotation
    pub fn succeeded(before: String, after: String, reconnect_wait: Duration) -> Self {
        Self {
            success: true,
            identity_before: before,
            identity_after: after,
            message: "identity rotated".to_string(),
            reconnect_wait,
            failure: None,
        }
    }

    /// Failed rotation
    pub fn failed(
        failure: RotationFailure,
        before: String,
        after: String,
        reconnect_wait: Duration,
    ) -> Self {
        Self {
            success: false,
            identity_before: before,
            identity_after: after,
            message: failure.message(),
            reconnect_wait,
            failure: Some(failure),
        }
    }
}

// ==================== SESSION ====================

/// Which driver owns a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMode {
    /// Bounded loop paced by the timing model
    Immediate,
    /// Visits fired by the schedule runner
    Scheduled,
}

/// Bookkeeping for one bounded run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSession {
    /// Session id
    pub id: Uuid,
    /// Target identifier
    pub target: String,
    /// Driver mode
    pub mode: SessionMode,
    /// Iteration budget
    pub budget: u32,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time, set once
    pub ended_at: Option<DateTime<Utc>>,
    /// Completion flag
    pub completed: bool,
    /// Device identity chosen at session start
    pub device: Option<DeviceIdentity>,
    /// Visit outcomes in dispatch order
    pub visits: Vec<VisitOutcome>,
    /// Distinct egress identities, first occurrence order
    pub identities: IndexSet<String>,
    /// Confirmed identity changes
    pub rotation_count: u32,
    /// First recorded identity
    pub initial_identity: Option<String>,
    /// Last recorded identity
    pub final_identity: Option<String>,
}

impl SimulationSession {
    /// Open a new session
    pub fn new(
        target: impl Into<String>,
        mode: SessionMode,
        budget: u32,
        device: Option<DeviceIdentity>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: target.into(),
            mode,
            budget,
            started_at: Utc::now(),
            ended_at: None,
            completed: false,
            device,
            visits: Vec::new(),
            identities: IndexSet::new(),
            rotation_count: 0,
            initial_identity: None,
            final_identity: None,
        }
    }

    /// Append an outcome. Returns false once the budget is exhausted.
    ///
    /// Timestamps stay strictly increasing even if the wall clock steps back.
    pub fn record_visit(&mut self, mut outcome: VisitOutcome) -> bool {
        if self.visits.len() >= self.budget as usize {
            return false;
        }
        if let Some(last) = self.visits.last() {
            if outcome.timestamp <= last.timestamp {
                outcome.timestamp = last.timestamp + chrono::Duration::microseconds(1);
            }
        }
        self.visits.push(outcome);
        true
    }

    /// Record an observed egress identity. Only a newly seen identity after
    /// the initial one counts as a rotation.
    pub fn record_identity(&mut self, identity: &str) {
        if is_placeholder_identity(identity) {
            return;
        }
        if self.identities.is_empty() {
            self.initial_identity = Some(identity.to_string());
            self.identities.insert(identity.to_string());
        } else if self.identities.insert(identity.to_string()) {
            self.rotation_count += 1;
        }
        self.final_identity = Some(identity.to_string());
    }

    /// Stamp the end time and mark complete. The first end time wins.
    pub fn finish(&mut self) {
        if self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
        self.completed = true;
    }

    /// Number of recorded visits
    pub fn total_visits(&self) -> usize {
        self.visits.len()
    }

    /// Number of successful visits
    pub fn successful_visits(&self) -> usize {
        self.visits.iter().filter(|v| v.success).count()
    }

    /// Success rate in percent
    pub fn success_rate(&self) -> f64 {
        if self.visits.is_empty() {
            return 0.0;
        }
        self.successful_visits() as f64 * 100.0 / self.visits.len() as f64
    }

    /// Elapsed time, measured to now while the session is open
    pub fn duration(&self) -> chrono::Duration {
        self.ended_at.unwrap_or_else(Utc::now) - self.started_at
    }
}

// ==================== EVENTS ====================

/// Session-level events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Session opened
    Started { session_id: Uuid, mode: SessionMode, budget: u32 },
    /// Iteration progress
    Progress { current: u32, total: u32 },
    /// Rotation attempt finished
    RotationFinished { result: RotationResult },
    /// Visit outcome recorded
    VisitRecorded { index: usize, success: bool },
    /// Session finalized
    Finished { session_id: Uuid, visits: usize, rotations: u32 },
}

/// Schedule runner events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RunnerEvent {
    /// Runner started, paused, resumed, stopped or completed
    StatusChanged { running: bool, progress: u32 },
    /// Next visit scheduled
    VisitScheduled { delay_ms: u64, index: usize, total: u32 },
}

/// Everything the engine publishes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    /// From the session orchestrator
    Session(SessionEvent),
    /// From the schedule runner
    Schedule(RunnerEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(success: bool) -> VisitOutcome {
        VisitOutcome::from_report(
            &VisitReport {
                status_code: if success { 200 } else { 500 },
                success,
                latency: Duration::from_millis(40),
            },
            "10.0.0.1",
        )
    }

    #[test]
    fn test_placeholder_identity() {
        assert!(is_placeholder_identity(""));
        assert!(is_placeholder_identity("  "));
        assert!(is_placeholder_identity("Unknown"));
        assert!(is_placeholder_identity("unknown"));
        assert!(!is_placeholder_identity("203.0.113.7"));
    }

    #[test]
    fn test_rotation_count_tracks_new_identities_only() {
        let mut session = SimulationSession::new("https://example.com", SessionMode::Immediate, 5, None);
        session.record_identity("1.1.1.1");
        assert_eq!(session.rotation_count, 0);
        assert_eq!(session.initial_identity.as_deref(), Some("1.1.1.1"));

        session.record_identity("2.2.2.2");
        session.record_identity("1.1.1.1");
        session.record_identity("Unknown");
        session.record_identity("3.3.3.3");

        assert_eq!(session.rotation_count, 2);
        assert_eq!(session.rotation_count as usize, session.identities.len() - 1);
        assert_eq!(
            session.identities.iter().cloned().collect::<Vec<_>>(),
            vec!["1.1.1.1", "2.2.2.2", "3.3.3.3"]
        );
        assert_eq!(session.final_identity.as_deref(), Some("3.3.3.3"));
    }

    #[test]
    fn test_budget_caps_visits() {
        let mut session = SimulationSession::new("t", SessionMode::Immediate, 2, None);
        assert!(session.record_visit(outcome(true)));
        assert!(session.record_visit(outcome(false)));
        assert!(!session.record_visit(outcome(true)));
        assert_eq!(session.total_visits(), 2);
        assert_eq!(session.successful_visits(), 1);
        assert!((session.success_rate() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let mut session = SimulationSession::new("t", SessionMode::Immediate, 3, None);
        let first = outcome(true);
        let mut second = outcome(true);
        second.timestamp = first.timestamp - chrono::Duration::seconds(5);
        session.record_visit(first);
        session.record_visit(second);
        assert!(session.visits[1].timestamp > session.visits[0].timestamp);
    }

    #[test]
    fn test_finish_keeps_first_end_time() {
        let mut session = SimulationSession::new("t", SessionMode::Scheduled, 1, None);
        session.finish();
        let first = session.ended_at;
        session.finish();
        assert!(session.completed);
        assert_eq!(session.ended_at, first);
        assert!(session.duration() >= chrono::Duration::zero());
    }

    #[test]
    fn test_retryable_failures() {
        assert!(RotationFailure::ReconnectTimeout.is_retryable());
        assert!(RotationFailure::IdentityUnchanged.is_retryable());
        assert!(RotationFailure::ToggleFailed("x".into()).is_retryable());
        assert!(!RotationFailure::NotConnected.is_retryable());
        assert!(!RotationFailure::CapabilityUnavailable.is_retryable());
        assert!(!RotationFailure::InProgress.is_retryable());
    }
}
