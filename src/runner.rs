//! Schedule Runner
//!
//! Fires one visit per planned interval from a single background task. The
//! task sleeps on one timer at a time and wakes early on any state change, so
//! pause and stop take effect immediately. Resuming restarts the full delay of
//! the pending step.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::{
    error::{PacerError, Result},
    schedule::SchedulePlan,
    types::RunnerEvent,
    utils::format_duration,
};

/// Single-visit entry point of the session layer
pub trait ScheduledVisitSink: Send + Sync {
    /// Start one visit. Returns false when the visit was rejected, e.g.
    /// because the previous one is still in flight.
    fn execute_scheduled_visit(&self) -> bool;
}

/// Runner lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunnerState {
    Stopped,
    Running,
    Paused,
    Completed,
}

impl RunnerState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

struct Shared {
    sink: Arc<dyn ScheduledVisitSink>,
    state: watch::Sender<RunnerState>,
    /// Visits fired so far
    cursor: AtomicUsize,
    events: broadcast::Sender<RunnerEvent>,
    plan: Mutex<Option<SchedulePlan>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl Shared {
    fn state(&self) -> RunnerState {
        *self.state.borrow()
    }

    /// Apply `to` only when the current state is one of `from`
    fn transition(&self, from: &[RunnerState], to: RunnerState) -> bool {
        self.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn total_visits(&self) -> u32 {
        self.plan
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|p| p.total_visits)
            .unwrap_or(0)
    }

    fn progress(&self) -> u32 {
        if self.state() == RunnerState::Completed {
            return 100;
        }
        let total = self.total_visits();
        if total == 0 {
            return 0;
        }
        (self.cursor.load(Ordering::SeqCst) * 100 / total as usize) as u32
    }

    fn notify_status(&self) {
        let _ = self.events.send(RunnerEvent::StatusChanged {
            running: self.state() == RunnerState::Running,
            progress: self.progress(),
        });
    }

    /// Wait out one step. Returns false if the runner left the active states.
    async fn wait_step(&self, delay: Duration) -> bool {
        let mut rx = self.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                RunnerState::Stopped | RunnerState::Completed => return false,
                RunnerState::Paused => {
                    if rx.changed().await.is_err() {
                        return false;
                    }
                }
                RunnerState::Running => {
                    tokio::select! {
                        _ = sleep(delay) => return true,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return false;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn drive(self: Arc<Self>, plan: SchedulePlan) {
        let total = plan.total_visits;
        for index in 0..total as usize {
            if !self.state().is_active() {
                return;
            }

            if !self.sink.execute_scheduled_visit() {
                warn!("Scheduled visit {}/{} skipped: previous visit still in flight", index + 1, total);
            }
            self.cursor.store(index + 1, Ordering::SeqCst);

            let Some(&delay_ms) = plan.intervals.get(index) else {
                break;
            };
            debug!(
                "⏱️ Next scheduled visit {}/{} in {}",
                index + 2,
                total,
                format_duration(Duration::from_millis(delay_ms))
            );
            let _ = self.events.send(RunnerEvent::VisitScheduled {
                delay_ms,
                index: index + 1,
                total,
            });

            if !self.wait_step(Duration::from_millis(delay_ms)).await {
                return;
            }
        }

        if self.transition(&[RunnerState::Running, RunnerState::Paused], RunnerState::Completed) {
            info!("✅ Schedule completed: {} visits", total);
            self.notify_status();
        }
    }
}

/// Timer-driven executor of a `SchedulePlan`
pub struct ScheduleRunner {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduleRunner {
    pub fn new(sink: Arc<dyn ScheduledVisitSink>) -> Self {
        let (state, _) = watch::channel(RunnerState::Stopped);
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                sink,
                state,
                cursor: AtomicUsize::new(0),
                events,
                plan: Mutex::new(None),
                started_at: Mutex::new(None),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Install the plan to run next. Rejected while a run is active.
    pub fn configure(&self, plan: SchedulePlan) -> Result<()> {
        if self.shared.state().is_active() {
            return Err(PacerError::AlreadyRunning("schedule runner"));
        }
        info!(
            "📅 Schedule configured: {} visits over {}h, {} ({} spacing)",
            plan.total_visits,
            plan.duration_hours,
            plan.pattern,
            if plan.start_hour.is_some() { "weighted" } else { "uniform" }
        );
        *self.shared.plan.lock().unwrap_or_else(|e| e.into_inner()) = Some(plan);
        self.shared.cursor.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Fire the first visit now and the rest on their timers
    pub fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if self.shared.state().is_active() {
            return Err(PacerError::AlreadyRunning("schedule runner"));
        }
        let plan = self
            .shared
            .plan
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(PacerError::ScheduleMissing)?;

        if let Some(old) = handle.take() {
            old.abort();
        }
        self.shared.cursor.store(0, Ordering::SeqCst);
        *self.shared.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        self.shared.state.send_replace(RunnerState::Running);

        info!("▶️ Schedule started: {} visits", plan.total_visits);
        self.shared.notify_status();
        *handle = Some(tokio::spawn(self.shared.clone().drive(plan)));
        Ok(())
    }

    /// Hold the pending step. Returns false unless the runner was running.
    pub fn pause(&self) -> bool {
        let paused = self
            .shared
            .transition(&[RunnerState::Running], RunnerState::Paused);
        if paused {
            info!("⏸️ Schedule paused at {}%", self.shared.progress());
            self.shared.notify_status();
        }
        paused
    }

    /// Continue a paused run. The pending step waits its full delay again.
    pub fn resume(&self) -> bool {
        let resumed = self
            .shared
            .transition(&[RunnerState::Paused], RunnerState::Running);
        if resumed {
            info!("▶️ Schedule resumed");
            self.shared.notify_status();
        }
        resumed
    }

    /// Cancel the run for good. Returns false if nothing was active.
    pub fn stop(&self) -> bool {
        let stopped = self.shared.transition(
            &[RunnerState::Running, RunnerState::Paused],
            RunnerState::Stopped,
        );
        if let Some(handle) = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        if stopped {
            info!("⏹️ Schedule stopped at {}%", self.shared.progress());
            self.shared.notify_status();
        }
        stopped
    }

    pub fn state(&self) -> RunnerState {
        self.shared.state()
    }

    /// `visits fired * 100 / total visits`, 100 once completed
    pub fn progress(&self) -> u32 {
        self.shared.progress()
    }

    pub fn fired(&self) -> usize {
        self.shared.cursor.load(Ordering::SeqCst)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.shared.started_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Planned wait still ahead of an active run
    pub fn estimated_remaining(&self) -> Option<Duration> {
        if !self.state().is_active() {
            return None;
        }
        let plan = self.shared.plan.lock().unwrap_or_else(|e| e.into_inner());
        plan.as_ref()
            .map(|p| Duration::from_millis(p.remaining_ms(self.fired())))
    }

    /// Wall-clock estimate of the last visit
    pub fn estimated_completion(&self) -> Option<DateTime<Utc>> {
        let remaining = self.estimated_remaining()?;
        chrono::Duration::from_std(remaining)
            .ok()
            .map(|d| Utc::now() + d)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunnerEvent> {
        self.shared.events.subscribe()
    }

    /// Wait until the run completes or is stopped
    pub async fn wait(&self) -> RunnerState {
        let mut rx = self.shared.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if !state.is_active() {
                return state;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }
}

impl Drop for ScheduleRunner {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}
