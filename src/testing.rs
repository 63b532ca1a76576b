//! In-crate collaborators for unit tests

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    error::{PacerError, Result},
    network::NetworkStateProvider,
    orchestrator::RequestExecutor,
    rotation::ConnectivityToggle,
    runner::ScheduledVisitSink,
    types::{ClientType, DeviceIdentity, DeviceTier, VisitReport},
};

pub fn test_device() -> DeviceIdentity {
    DeviceIdentity {
        platform: "android".into(),
        tier: DeviceTier::MidRange,
        client_type: ClientType::Mobile,
        user_agent: "test-agent".into(),
    }
}

/// Network whose identity changes only through queued refresh results
pub struct MockNetwork {
    connected: AtomicBool,
    identity: Mutex<String>,
    queued: Mutex<VecDeque<String>>,
    refreshes: AtomicUsize,
}

impl MockNetwork {
    pub fn new(identity: &str) -> Self {
        Self {
            connected: AtomicBool::new(true),
            identity: Mutex::new(identity.to_string()),
            queued: Mutex::new(VecDeque::new()),
            refreshes: AtomicUsize::new(0),
        }
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Identities handed out by subsequent refreshes, in order
    pub fn push_identities<I, S>(&self, identities: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queued
            .lock()
            .unwrap()
            .extend(identities.into_iter().map(Into::into));
    }
}

#[async_trait]
impl NetworkStateProvider for MockNetwork {
    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn current_identity(&self) -> String {
        self.identity.lock().unwrap().clone()
    }

    async fn refresh_identity(&self) -> String {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let mut identity = self.identity.lock().unwrap();
        if let Some(next) = self.queued.lock().unwrap().pop_front() {
            *identity = next;
        }
        identity.clone()
    }
}

/// Toggle that drives a `MockNetwork` and counts its calls
pub struct MockToggle {
    network: Arc<MockNetwork>,
    available: AtomicBool,
    restores: AtomicBool,
    failing: AtomicBool,
    disables: AtomicUsize,
    enables: AtomicUsize,
}

impl MockToggle {
    pub fn linked(network: Arc<MockNetwork>) -> Self {
        Self {
            network,
            available: AtomicBool::new(true),
            restores: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            disables: AtomicUsize::new(0),
            enables: AtomicUsize::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Whether switching back on brings the network back
    pub fn set_restores_connectivity(&self, restores: bool) {
        self.restores.store(restores, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn disables(&self) -> usize {
        self.disables.load(Ordering::SeqCst)
    }

    /// Completed off/on cycles
    pub fn cycles(&self) -> usize {
        self.enables.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectivityToggle for MockToggle {
    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn set_connectivity(&self, enabled: bool) -> Result<()> {
        if !enabled {
            self.disables.fetch_add(1, Ordering::SeqCst);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(PacerError::Toggle("mock failure".into()));
        }
        if enabled {
            self.enables.fetch_add(1, Ordering::SeqCst);
            if self.restores.load(Ordering::SeqCst) {
                self.network.set_connected(true);
            }
        } else {
            self.network.set_connected(false);
        }
        Ok(())
    }
}

/// How `MockExecutor` answers a dispatch
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Succeed,
    Fail,
    Panic,
    Slow(Duration),
}

pub struct MockExecutor {
    behavior: Mutex<Behavior>,
    dispatched: AtomicUsize,
    completed: AtomicUsize,
    devices: Mutex<Vec<DeviceIdentity>>,
}

impl MockExecutor {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            dispatched: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            devices: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::SeqCst)
    }

    /// Dispatches that ran to the end with a report
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn devices(&self) -> Vec<DeviceIdentity> {
        self.devices.lock().unwrap().clone()
    }
}

#[async_trait]
impl RequestExecutor for MockExecutor {
    async fn dispatch(
        &self,
        _target: &str,
        device: &DeviceIdentity,
        _session_id: Uuid,
    ) -> Result<VisitReport> {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        self.devices.lock().unwrap().push(device.clone());
        let behavior = *self.behavior.lock().unwrap();
        let latency = match behavior {
            Behavior::Succeed => Duration::from_millis(20),
            Behavior::Fail => return Err(PacerError::Dispatch("connection refused".into())),
            Behavior::Panic => panic!("executor blew up"),
            Behavior::Slow(delay) => {
                tokio::time::sleep(delay).await;
                delay
            }
        };
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(VisitReport {
            status_code: 200,
            success: true,
            latency,
        })
    }
}

/// Sink recording when the runner fired
pub struct MockSink {
    fired: Mutex<Vec<Instant>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self {
            fired: Mutex::new(Vec::new()),
        }
    }

    pub fn fired(&self) -> Vec<Instant> {
        self.fired.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.fired.lock().unwrap().len()
    }
}

impl ScheduledVisitSink for MockSink {
    fn execute_scheduled_visit(&self) -> bool {
        self.fired.lock().unwrap().push(Instant::now());
        true
    }
}
