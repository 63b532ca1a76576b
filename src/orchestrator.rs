//! Session Orchestrator
//!
//! Owns the single `SimulationSession` and drives it either as a bounded
//! immediate-mode loop or as the target of scheduled single visits. Only one
//! driver may hold the session at a time.
//!
//! Per immediate-mode iteration:
//! 1. publish progress
//! 2. rotate the egress identity when requested (blocking the iteration)
//! 3. pick the device identity
//! 4. dispatch the visit with a bounded wait and record its outcome
//! 5. track the egress identity
//! 6. dwell on the page
//! 7. wait a human-like interval before the next iteration
//!
//! Every wait is sliced to one second so a stop takes effect promptly.
//! A stop never cancels in-flight dispatches or rotations; their outcomes are
//! still recorded when they land after it. A dispatch that outlives the visit
//! timeout is aborted and recorded as failed.

use std::{
    collections::HashSet,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{broadcast, RwLock},
    task::JoinHandle,
    time::{sleep, timeout, Instant},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    behavior::BehaviorSimulator,
    config::SessionConfig,
    error::{PacerError, Result},
    identity::DeviceIdentityProvider,
    network::NetworkStateProvider,
    rotation::RotationController,
    runner::ScheduledVisitSink,
    timing::TimingModel,
    types::{
        is_placeholder_identity, DeviceIdentity, SessionEvent, SessionMode, SimulationSession,
        VisitOutcome, VisitReport, CHECK_INTERVAL,
    },
    utils::{format_duration, sleep_while},
};

/// Performs one visit against the target
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    /// Resolve with a report or an error description; never panics by contract,
    /// though the orchestrator records a panic as a failed visit. A dispatch
    /// still pending after the visit timeout is aborted, so late results are
    /// never seen.
    async fn dispatch(
        &self,
        target: &str,
        device: &DeviceIdentity,
        session_id: Uuid,
    ) -> Result<VisitReport>;
}

/// Parameters of one session
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub target: String,
    /// Visit budget
    pub iterations: u32,
    pub rotate_identity: bool,
    pub random_device_identity: bool,
    pub visit_timeout: Duration,
    pub content_length: u8,
}

impl SessionParams {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            target: config.target_url.clone(),
            iterations: config.iterations,
            rotate_identity: config.rotate_identity,
            random_device_identity: config.random_device_identity,
            visit_timeout: Duration::from_secs(config.visit_timeout_secs),
            content_length: config.content_length,
        }
    }

    /// Same parameters with the budget of a schedule
    pub fn with_budget(mut self, visits: u32) -> Self {
        self.iterations = visits;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Idle,
    Running(SessionMode),
    /// Stop requested, immediate loop not yet exited
    Stopping,
}

/// Per-session working state
struct RunContext {
    params: SessionParams,
    session_id: Uuid,
    fixed_device: DeviceIdentity,
    used_identities: Mutex<HashSet<String>>,
    next_index: AtomicU32,
}

impl RunContext {
    fn mark_used(&self, identity: &str) {
        if !is_placeholder_identity(identity) {
            self.used_identities
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(identity.to_string());
        }
    }

    fn is_used(&self, identity: &str) -> bool {
        self.used_identities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(identity)
    }
}

/// Returns the loop state to `Idle` when the immediate loop ends, however it ends
struct LoopGuard<'a> {
    state: &'a Mutex<LoopState>,
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(*state, LoopState::Running(SessionMode::Immediate) | LoopState::Stopping) {
            *state = LoopState::Idle;
        }
    }
}

/// Clears the scheduled single-flight flag
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Top-level visit driver
pub struct SessionOrchestrator {
    me: Weak<SessionOrchestrator>,
    timing: Arc<TimingModel>,
    behavior: BehaviorSimulator,
    rotation: Arc<RotationController>,
    network: Arc<dyn NetworkStateProvider>,
    identities: Arc<dyn DeviceIdentityProvider>,
    executor: Arc<dyn RequestExecutor>,
    state: Mutex<LoopState>,
    session: RwLock<Option<SimulationSession>>,
    run: Mutex<Option<Arc<RunContext>>>,
    scheduled_in_flight: AtomicBool,
    last_dispatch: Mutex<Option<Instant>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionOrchestrator {
    pub fn new(
        timing: Arc<TimingModel>,
        rotation: Arc<RotationController>,
        network: Arc<dyn NetworkStateProvider>,
        identities: Arc<dyn DeviceIdentityProvider>,
        executor: Arc<dyn RequestExecutor>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            behavior: BehaviorSimulator::new(timing.clone()),
            timing,
            rotation,
            network,
            identities,
            executor,
            state: Mutex::new(LoopState::Idle),
            session: RwLock::new(None),
            run: Mutex::new(None),
            scheduled_in_flight: AtomicBool::new(false),
            last_dispatch: Mutex::new(None),
            events,
        })
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Start the immediate-mode loop in the background.
    ///
    /// Rejected with `AlreadyRunning` while any session is active.
    pub async fn start(self: &Arc<Self>, params: SessionParams) -> Result<JoinHandle<()>> {
        let ctx = self.open_session(params, SessionMode::Immediate).await?;
        let this = self.clone();
        Ok(tokio::spawn(async move {
            let _guard = LoopGuard { state: &this.state };
            let driver = this.clone();
            let run = ctx.clone();
            this.finalize_after(&ctx, async move { driver.run_loop(&run).await })
                .await;
        }))
    }

    /// Drive `work` on its own task and finalize the session however it ends
    async fn finalize_after<F>(&self, ctx: &RunContext, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Err(e) = tokio::spawn(work).await {
            error!("Session loop aborted: {}", e);
        }
        self.finalize(ctx).await;
    }

    /// Open a session whose visits are fired by the schedule runner
    pub async fn begin_scheduled(&self, params: SessionParams) -> Result<()> {
        self.open_session(params, SessionMode::Scheduled).await?;
        Ok(())
    }

    /// Close a scheduled session once the runner is done. Waits up to one
    /// visit timeout for an in-flight visit to land.
    pub async fn finish_scheduled(&self) -> bool {
        let released = {
            let mut state = self.lock_state();
            if *state == LoopState::Running(SessionMode::Scheduled) {
                *state = LoopState::Idle;
                true
            } else {
                false
            }
        };
        if !released {
            return false;
        }

        let Some(ctx) = self.current_run() else {
            return true;
        };
        let deadline = Instant::now() + ctx.params.visit_timeout;
        while self.scheduled_in_flight.load(Ordering::SeqCst) && Instant::now() < deadline {
            sleep(Duration::from_millis(100)).await;
        }
        self.finalize(&ctx).await;
        true
    }

    /// Request a stop. The immediate loop exits at its next check point; a
    /// scheduled session is released immediately. Either way the session end
    /// time is stamped now. Returns false if nothing was running.
    pub async fn stop(&self) -> bool {
        let previous = {
            let mut state = self.lock_state();
            let previous = *state;
            match previous {
                LoopState::Running(SessionMode::Immediate) => *state = LoopState::Stopping,
                LoopState::Running(SessionMode::Scheduled) => *state = LoopState::Idle,
                LoopState::Idle | LoopState::Stopping => return false,
            }
            previous
        };

        info!("🛑 Stopping session");
        match (previous, self.current_run()) {
            (LoopState::Running(SessionMode::Scheduled), Some(ctx)) => self.finalize(&ctx).await,
            _ => {
                if let Some(session) = self.session.write().await.as_mut() {
                    session.finish();
                }
            }
        }
        true
    }

    async fn open_session(&self, params: SessionParams, mode: SessionMode) -> Result<Arc<RunContext>> {
        {
            let mut state = self.lock_state();
            if *state != LoopState::Idle {
                warn!("Session already running");
                return Err(PacerError::AlreadyRunning("session"));
            }
            *state = LoopState::Running(mode);
        }

        let fixed_device = self.identities.next_identity();
        let mut session = SimulationSession::new(
            params.target.clone(),
            mode,
            params.iterations,
            Some(fixed_device.clone()),
        );
        let ctx = Arc::new(RunContext {
            session_id: session.id,
            fixed_device,
            used_identities: Mutex::new(HashSet::new()),
            next_index: AtomicU32::new(0),
            params,
        });

        let mut initial = self.network.current_identity();
        if is_placeholder_identity(&initial) {
            initial = self.network.refresh_identity().await;
        }
        session.record_identity(&initial);
        ctx.mark_used(&initial);

        info!(
            "🚀 Starting {:?} session {}: {} visits, target: {}",
            mode, session.id, ctx.params.iterations, ctx.params.target
        );
        let _ = self.events.send(SessionEvent::Started {
            session_id: session.id,
            mode,
            budget: ctx.params.iterations,
        });

        *self.session.write().await = Some(session);
        *self.run.lock().unwrap_or_else(|e| e.into_inner()) = Some(ctx.clone());
        self.scheduled_in_flight.store(false, Ordering::SeqCst);
        *self.last_dispatch.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(ctx)
    }

    // ── Immediate mode ──────────────────────────────────────────────────────

    async fn run_loop(self: &Arc<Self>, ctx: &Arc<RunContext>) {
        let total = ctx.params.iterations;
        for index in 0..total {
            if !self.keep_running(SessionMode::Immediate) {
                break;
            }
            info!("Starting iteration {}/{}", index + 1, total);
            let _ = self.events.send(SessionEvent::Progress {
                current: index + 1,
                total,
            });

            let device = self.clone().guarded_visit(ctx.clone(), index).await;

            if let Some(device) = device {
                let dwell = self.behavior.plan(&device, ctx.params.content_length);
                debug!("Dwelling {} on target", format_duration(dwell.total()));
                if !sleep_while(dwell.total(), CHECK_INTERVAL, || {
                    self.keep_running(SessionMode::Immediate)
                })
                .await
                {
                    break;
                }
            }

            if index + 1 < total {
                let wait = Duration::from_secs(self.timing.next_interval_secs());
                debug!("Waiting {} before next iteration", format_duration(wait));
                if !sleep_while(wait, CHECK_INTERVAL, || {
                    self.keep_running(SessionMode::Immediate)
                })
                .await
                {
                    break;
                }
            }
        }
    }

    fn keep_running(&self, mode: SessionMode) -> bool {
        *self.lock_state() == LoopState::Running(mode)
    }

    // ── Single visit ────────────────────────────────────────────────────────

    /// Run one visit on its own task so a panic anywhere in it still yields a
    /// recorded failure instead of tearing down the driver.
    async fn guarded_visit(self: Arc<Self>, ctx: Arc<RunContext>, index: u32) -> Option<DeviceIdentity> {
        let this = self.clone();
        let run = ctx.clone();
        match tokio::spawn(async move { this.visit(&run, index).await }).await {
            Ok(device) => Some(device),
            Err(e) => {
                error!("Iteration {} failed: {}", index + 1, e);
                self.record_missing(&ctx, index, format!("iteration failed: {e}"))
                    .await;
                None
            }
        }
    }

    async fn visit(&self, ctx: &RunContext, index: u32) -> DeviceIdentity {
        if ctx.params.rotate_identity {
            let current = self.network.current_identity();
            let reused = ctx.is_used(&current);
            if index > 0 || reused {
                if reused {
                    info!("Egress identity {} already used, forcing rotation", current);
                }
                self.rotate_for(ctx).await;
            }
        }

        let device = if ctx.params.random_device_identity {
            self.identities.next_identity()
        } else {
            ctx.fixed_device.clone()
        };
        debug!("Using device identity: {}", device);

        let egress = self.network.current_identity();
        self.log_dispatch_gap();

        let started = Instant::now();
        let executor = self.executor.clone();
        let target = ctx.params.target.clone();
        let session_id = ctx.session_id;
        let visit_device = device.clone();
        let mut dispatch =
            tokio::spawn(async move { executor.dispatch(&target, &visit_device, session_id).await });

        let outcome = match timeout(ctx.params.visit_timeout, &mut dispatch).await {
            Ok(Ok(Ok(report))) => {
                info!(
                    "Visit {} -> {} in {}ms",
                    index + 1,
                    report.status_code,
                    report.latency.as_millis()
                );
                VisitOutcome::from_report(&report, egress.clone())
            }
            Ok(Ok(Err(e))) => {
                warn!("Visit {} failed: {}", index + 1, e);
                VisitOutcome::failed(egress.clone(), started.elapsed(), e.to_string())
            }
            Ok(Err(e)) => {
                error!("Visit {} aborted: {}", index + 1, e);
                VisitOutcome::failed(egress.clone(), started.elapsed(), format!("visit aborted: {e}"))
            }
            Err(_) => {
                warn!("Visit {} timed out", index + 1);
                dispatch.abort();
                VisitOutcome::failed(
                    egress.clone(),
                    started.elapsed(),
                    format!("no result within {}", format_duration(ctx.params.visit_timeout)),
                )
            }
        };

        let success = outcome.success;
        let after = self.network.current_identity();
        {
            let mut session = self.session.write().await;
            if let Some(session) = session.as_mut().filter(|s| s.id == ctx.session_id) {
                if !session.record_visit(outcome) {
                    warn!("Visit budget exhausted, outcome dropped");
                }
                session.record_identity(&after);
            }
        }
        ctx.mark_used(&after);
        let _ = self.events.send(SessionEvent::VisitRecorded {
            index: index as usize,
            success,
        });

        device
    }

    async fn rotate_for(&self, ctx: &RunContext) {
        let result = self.rotation.rotate().await;
        if result.success {
            {
                let mut session = self.session.write().await;
                if let Some(session) = session.as_mut().filter(|s| s.id == ctx.session_id) {
                    session.record_identity(&result.identity_after);
                }
            }
            ctx.mark_used(&result.identity_after);
        } else {
            warn!("Continuing without rotation: {}", result.message);
        }
        let _ = self.events.send(SessionEvent::RotationFinished { result });
    }

    /// Record a failure for a visit that never produced an outcome
    async fn record_missing(&self, ctx: &RunContext, index: u32, error: String) {
        let egress = self.network.current_identity();
        let mut session = self.session.write().await;
        if let Some(session) = session.as_mut().filter(|s| s.id == ctx.session_id) {
            if session.total_visits() <= index as usize {
                session.record_visit(VisitOutcome::failed(egress, Duration::ZERO, error));
                let _ = self.events.send(SessionEvent::VisitRecorded {
                    index: index as usize,
                    success: false,
                });
            }
        }
    }

    fn log_dispatch_gap(&self) {
        let now = Instant::now();
        let mut last = self.last_dispatch.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = last.replace(now) {
            debug!("⏱️ {} since previous visit", format_duration(now - previous));
        }
    }

    async fn finalize(&self, ctx: &RunContext) {
        let summary = {
            let mut session = self.session.write().await;
            session.as_mut().filter(|s| s.id == ctx.session_id).map(|s| {
                s.finish();
                (s.total_visits(), s.success_rate(), s.rotation_count, s.duration())
            })
        };

        if let Some((visits, success_rate, rotations, duration)) = summary {
            info!(
                "🏁 Session completed: {} visits, {:.1}% success rate, {} rotations, {}s duration",
                visits,
                success_rate,
                rotations,
                duration.num_seconds()
            );
            let _ = self.events.send(SessionEvent::Finished {
                session_id: ctx.session_id,
                visits,
                rotations,
            });
        }
    }

    // ── Observers ───────────────────────────────────────────────────────────

    /// Snapshot of the current (or last) session
    pub async fn current_session(&self) -> Option<SimulationSession> {
        self.session.read().await.clone()
    }

    pub fn is_running(&self) -> bool {
        *self.lock_state() != LoopState::Idle
    }

    pub fn is_rotating(&self) -> bool {
        self.rotation.is_rotating()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_run(&self) -> Option<Arc<RunContext>> {
        self.run.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ScheduledVisitSink for SessionOrchestrator {
    /// Start one scheduled visit in the background. Rejected when no scheduled
    /// session is open or the previous scheduled visit is still in flight.
    fn execute_scheduled_visit(&self) -> bool {
        if !self.keep_running(SessionMode::Scheduled) {
            warn!("Cannot execute scheduled visit: session not running");
            return false;
        }
        let (Some(this), Some(ctx)) = (self.me.upgrade(), self.current_run()) else {
            return false;
        };
        if self
            .scheduled_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Cannot execute scheduled visit: another visit in progress");
            return false;
        }

        tokio::spawn(async move {
            let _flight = FlightGuard(&this.scheduled_in_flight);
            let index = ctx.next_index.fetch_add(1, Ordering::SeqCst);
            let _ = this.events.send(SessionEvent::Progress {
                current: index + 1,
                total: ctx.params.iterations,
            });
            this.clone().guarded_visit(ctx, index).await;
        });
        true
    }
}
