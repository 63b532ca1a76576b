//! Visit Pacer Engine - wires the orchestration core together

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;
use tokio::{
    sync::{broadcast, RwLock},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    config::{PacerConfig, TimingConfig},
    error::Result,
    executor::HttpVisitExecutor,
    identity::{DeviceIdentityProvider, IdentityPool},
    network::{NetworkStateProvider, PublicIpMonitor},
    orchestrator::{RequestExecutor, SessionOrchestrator, SessionParams},
    rotation::{CommandToggle, ConnectivityToggle, RotationController},
    runner::{RunnerState, ScheduleRunner, ScheduledVisitSink},
    schedule::{SchedulePlan, TrafficSchedule},
    timing::TimingModel,
    types::{EngineEvent, RotationResult, SimulationSession},
};

/// Snapshot of the schedule runner
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleStatus {
    pub state: RunnerState,
    pub progress: u32,
    pub fired: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub estimated_remaining: Option<Duration>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

/// Core engine
pub struct PacerEngine {
    /// Configuration
    config: Arc<RwLock<PacerConfig>>,
    /// Shared timing model
    timing: Arc<TimingModel>,
    /// Identity rotation
    rotation: Arc<RotationController>,
    /// Session driver
    orchestrator: Arc<SessionOrchestrator>,
    /// Scheduled-mode driver
    runner: Arc<ScheduleRunner>,
    /// Event broadcast channel
    event_tx: broadcast::Sender<EngineEvent>,
}

impl PacerEngine {
    /// Engine with the built-in network, toggle, identity and HTTP adapters
    pub async fn new(config: PacerConfig) -> Result<Self> {
        config.validate()?;
        let network = Arc::new(PublicIpMonitor::new(&config.network)?);
        network.refresh_identity().await;
        let toggle = Arc::new(CommandToggle::new(&config.rotation));
        let executor = Arc::new(HttpVisitExecutor::new(Duration::from_secs(
            config.session.visit_timeout_secs,
        ))?);

        Ok(Self::with_components(
            config,
            network,
            toggle,
            Arc::new(IdentityPool::default()),
            executor,
        ))
    }

    /// Engine over caller-supplied collaborators
    pub fn with_components(
        config: PacerConfig,
        network: Arc<dyn NetworkStateProvider>,
        toggle: Arc<dyn ConnectivityToggle>,
        identities: Arc<dyn DeviceIdentityProvider>,
        executor: Arc<dyn RequestExecutor>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(1024);

        let timing = Arc::new(TimingModel::new(config.timing.clone()));
        let rotation = Arc::new(RotationController::new(
            network.clone(),
            toggle,
            config.rotation.clone(),
        ));
        let orchestrator = SessionOrchestrator::new(
            timing.clone(),
            rotation.clone(),
            network,
            identities,
            executor,
        );
        let sink: Arc<dyn ScheduledVisitSink> = orchestrator.clone();
        let runner = Arc::new(ScheduleRunner::new(sink));

        let engine = Self {
            config: Arc::new(RwLock::new(config)),
            timing,
            rotation,
            orchestrator,
            runner,
            event_tx,
        };
        engine.start_forwarding();
        engine
    }

    fn start_forwarding(&self) {
        let mut session_rx = self.orchestrator.subscribe();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                match session_rx.recv().await {
                    Ok(event) => {
                        let _ = event_tx.send(EngineEvent::Session(event));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Event forwarder lagged, {} session events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut runner_rx = self.runner.subscribe();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                match runner_rx.recv().await {
                    Ok(event) => {
                        let _ = event_tx.send(EngineEvent::Schedule(event));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Event forwarder lagged, {} schedule events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Build the schedule described by the configuration and its plan
    pub fn plan_schedule(config: &PacerConfig) -> Result<(TrafficSchedule, SchedulePlan)> {
        let settings = &config.schedule;
        let mut schedule =
            TrafficSchedule::new(settings.total_visits, settings.duration_hours, settings.pattern)?;
        schedule.set_peak_window(settings.peak_window())?;

        let plan = if settings.apply_hourly_weights {
            schedule.weighted_plan(chrono::Local::now().hour() as u8)
        } else {
            schedule.plan()
        };
        Ok((schedule, plan))
    }

    // ── Immediate mode ──────────────────────────────────────────────────────

    /// Start the immediate-mode loop; the handle resolves when it ends
    pub async fn run_immediate(&self) -> Result<JoinHandle<()>> {
        let params = SessionParams::from_config(&self.config.read().await.session);
        self.orchestrator.start(params).await
    }

    // ── Scheduled mode ──────────────────────────────────────────────────────

    /// Open a scheduled session and start firing visits
    pub async fn start_scheduled(&self) -> Result<SchedulePlan> {
        let config = self.config.read().await.clone();
        let (_, plan) = Self::plan_schedule(&config)?;

        self.runner.configure(plan.clone())?;
        let params = SessionParams::from_config(&config.session).with_budget(plan.total_visits);
        self.orchestrator.begin_scheduled(params).await?;

        if let Err(e) = self.runner.start() {
            self.orchestrator.finish_scheduled().await;
            return Err(e);
        }
        info!(
            "📅 Scheduled mode: {} visits over {}h ({})",
            plan.total_visits, plan.duration_hours, plan.pattern
        );
        Ok(plan)
    }

    /// Wait for the schedule to complete or be stopped, then close the session
    pub async fn wait_scheduled(&self) -> RunnerState {
        let state = self.runner.wait().await;
        self.orchestrator.finish_scheduled().await;
        state
    }

    pub fn pause_schedule(&self) -> bool {
        self.runner.pause()
    }

    pub fn resume_schedule(&self) -> bool {
        self.runner.resume()
    }

    pub fn schedule_status(&self) -> ScheduleStatus {
        ScheduleStatus {
            state: self.runner.state(),
            progress: self.runner.progress(),
            fired: self.runner.fired(),
            started_at: self.runner.started_at(),
            estimated_remaining: self.runner.estimated_remaining(),
            estimated_completion: self.runner.estimated_completion(),
        }
    }

    // ── Shared ──────────────────────────────────────────────────────────────

    /// Stop whichever driver is active. Returns false if nothing was running.
    pub async fn stop(&self, reason: &str) -> bool {
        info!("🛑 Stopping: {}", reason);
        let runner_stopped = self.runner.stop();
        let session_stopped = self.orchestrator.stop().await;
        runner_stopped || session_stopped
    }

    /// One manual rotation, serialized against the session's own rotations
    pub async fn rotate_now(&self) -> RotationResult {
        self.rotation.rotate().await
    }

    /// Replace the timing parameters; the next draw uses them
    pub async fn update_timing(&self, timing: TimingConfig) {
        self.timing.set_config(timing.clone());
        self.config.write().await.timing = timing;
    }

    pub async fn config(&self) -> PacerConfig {
        self.config.read().await.clone()
    }

    /// Snapshot of the current (or last) session
    pub async fn session(&self) -> Option<SimulationSession> {
        self.orchestrator.current_session().await
    }

    pub fn is_running(&self) -> bool {
        self.orchestrator.is_running()
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }
}
