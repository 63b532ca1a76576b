//! Egress identity rotation
//!
//! One rotation toggles connectivity off and on, waits for the network to come
//! back and checks that the egress identity changed. A failed attempt of a
//! retryable class is repeated exactly once. At most one rotation runs at a
//! time; a concurrent request is rejected without touching the toggle.

use std::{
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    process::Command,
    time::{sleep, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    config::RotationConfig,
    error::{PacerError, Result},
    network::NetworkStateProvider,
    types::{is_placeholder_identity, RotationFailure, RotationResult},
};

/// Privileged connectivity switch
#[async_trait]
pub trait ConnectivityToggle: Send + Sync {
    /// Whether the privileged path can be used at all
    async fn is_available(&self) -> bool;

    /// Turn connectivity off (`false`) or on (`true`)
    async fn set_connectivity(&self, enabled: bool) -> Result<()>;
}

/// Toggle backed by user-configured shell commands
pub struct CommandToggle {
    probe: Option<String>,
    disable: String,
    enable: String,
}

impl CommandToggle {
    pub fn new(config: &RotationConfig) -> Self {
        Self {
            probe: config.probe_command.clone(),
            disable: config.disable_command.clone(),
            enable: config.enable_command.clone(),
        }
    }

    async fn run(command: &str) -> Result<()> {
        let status = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;

        if status.success() {
            Ok(())
        } else {
            Err(PacerError::Toggle(format!("`{command}` exited with {status}")))
        }
    }
}

#[async_trait]
impl ConnectivityToggle for CommandToggle {
    async fn is_available(&self) -> bool {
        match &self.probe {
            Some(probe) => Self::run(probe).await.is_ok(),
            None => true,
        }
    }

    async fn set_connectivity(&self, enabled: bool) -> Result<()> {
        let command = if enabled { &self.enable } else { &self.disable };
        debug!("Connectivity {}: {}", if enabled { "on" } else { "off" }, command);
        Self::run(command).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RotationState {
    Idle,
    Rotating,
}

/// Resets the controller to `Idle` however the rotation ends
struct RotationGuard<'a> {
    state: &'a Mutex<RotationState>,
}

impl Drop for RotationGuard<'_> {
    fn drop(&mut self) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = RotationState::Idle;
    }
}

/// Serialized egress identity rotation
pub struct RotationController {
    network: Arc<dyn NetworkStateProvider>,
    toggle: Arc<dyn ConnectivityToggle>,
    settings: RotationConfig,
    state: Mutex<RotationState>,
}

impl RotationController {
    pub fn new(
        network: Arc<dyn NetworkStateProvider>,
        toggle: Arc<dyn ConnectivityToggle>,
        settings: RotationConfig,
    ) -> Self {
        Self {
            network,
            toggle,
            settings,
            state: Mutex::new(RotationState::Idle),
        }
    }

    /// Whether a rotation currently holds the controller
    pub fn is_rotating(&self) -> bool {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) == RotationState::Rotating
    }

    fn try_begin(&self) -> Option<RotationGuard<'_>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == RotationState::Rotating {
            return None;
        }
        *state = RotationState::Rotating;
        Some(RotationGuard { state: &self.state })
    }

    /// Rotate the egress identity. Never returns an error: every outcome,
    /// including rejection of a concurrent call, is a `RotationResult`.
    pub async fn rotate(&self) -> RotationResult {
        let before = self.network.current_identity();

        let Some(_guard) = self.try_begin() else {
            debug!("Rotation request rejected: another rotation is running");
            return RotationResult::failed(
                RotationFailure::InProgress,
                before.clone(),
                before,
                Duration::ZERO,
            );
        };

        if !self.network.is_connected().await {
            warn!("Rotation skipped: network not connected");
            return RotationResult::failed(
                RotationFailure::NotConnected,
                before.clone(),
                before,
                Duration::ZERO,
            );
        }

        if !self.toggle.is_available().await {
            warn!("Rotation skipped: capability unavailable");
            return RotationResult::failed(
                RotationFailure::CapabilityUnavailable,
                before.clone(),
                before,
                Duration::ZERO,
            );
        }

        info!("🔄 Rotating egress identity (current: {})", before);
        let first = self.attempt(&before).await;
        let retry = first
            .failure
            .as_ref()
            .map(RotationFailure::is_retryable)
            .unwrap_or(false);
        if !retry {
            log_result(&first);
            return first;
        }

        warn!("Rotation attempt failed ({}), retrying once", first.message);
        sleep(self.settings.retry_delay()).await;
        let second = self.attempt(&before).await;
        log_result(&second);
        second
    }

    async fn attempt(&self, before: &str) -> RotationResult {
        if let Err(e) = self.cycle_connectivity().await {
            return RotationResult::failed(
                RotationFailure::ToggleFailed(e.to_string()),
                before.to_string(),
                self.network.current_identity(),
                Duration::ZERO,
            );
        }

        let started = Instant::now();
        let reconnected = self
            .network
            .wait_for_reconnection(self.settings.reconnect_timeout())
            .await;
        let waited = started.elapsed();
        if !reconnected {
            return RotationResult::failed(
                RotationFailure::ReconnectTimeout,
                before.to_string(),
                self.network.current_identity(),
                waited,
            );
        }
        debug!("Reconnected after {:?}", waited);

        sleep(self.settings.settle_delay()).await;
        let after = self.poll_identity().await;

        if !is_placeholder_identity(&after) && after != before {
            RotationResult::succeeded(before.to_string(), after, waited)
        } else {
            RotationResult::failed(
                RotationFailure::IdentityUnchanged,
                before.to_string(),
                after,
                waited,
            )
        }
    }

    async fn cycle_connectivity(&self) -> Result<()> {
        self.toggle.set_connectivity(false).await?;
        sleep(self.settings.toggle_delay()).await;
        self.toggle.set_connectivity(true).await
    }

    /// First non-placeholder identity within the polling budget
    async fn poll_identity(&self) -> String {
        let attempts = self.settings.identity_poll_attempts.max(1);
        for attempt in 1..=attempts {
            let identity = self.network.refresh_identity().await;
            if !is_placeholder_identity(&identity) {
                return identity;
            }
            if attempt < attempts {
                sleep(self.settings.identity_poll_interval()).await;
            }
        }
        self.network.current_identity()
    }
}

fn log_result(result: &RotationResult) {
    if result.success {
        info!(
            "✅ Egress identity rotated: {} -> {} (reconnect {:?})",
            result.identity_before, result.identity_after, result.reconnect_wait
        );
    } else {
        warn!("❌ Rotation failed: {}", result.message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        testing::{MockNetwork, MockToggle},
        types::UNKNOWN_IDENTITY,
    };

    fn settings() -> RotationConfig {
        RotationConfig {
            probe_command: None,
            ..RotationConfig::default()
        }
    }

    fn controller(network: &Arc<MockNetwork>, toggle: &Arc<MockToggle>) -> RotationController {
        RotationController::new(network.clone(), toggle.clone(), settings())
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_succeeds_on_new_identity() {
        let network = Arc::new(MockNetwork::new("1.1.1.1"));
        network.push_identities(["2.2.2.2"]);
        let toggle = Arc::new(MockToggle::linked(network.clone()));
        let rotation = controller(&network, &toggle);

        let result = rotation.rotate().await;
        assert!(result.success, "{}", result.message);
        assert_eq!(result.identity_before, "1.1.1.1");
        assert_eq!(result.identity_after, "2.2.2.2");
        assert_eq!(toggle.cycles(), 1);
        assert!(!rotation.is_rotating());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_rotation_rejected_without_side_effects() {
        let network = Arc::new(MockNetwork::new("1.1.1.1"));
        network.push_identities(["2.2.2.2"]);
        let toggle = Arc::new(MockToggle::linked(network.clone()));
        let rotation = controller(&network, &toggle);

        let (first, second) = tokio::join!(rotation.rotate(), rotation.rotate());
        assert!(first.success);
        assert!(!second.success);
        assert_eq!(second.failure, Some(RotationFailure::InProgress));
        assert_eq!(second.message, "rotation already in progress");
        assert_eq!(toggle.cycles(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_connected_fails_fast() {
        let network = Arc::new(MockNetwork::new("1.1.1.1"));
        network.set_connected(false);
        let toggle = Arc::new(MockToggle::linked(network.clone()));
        let rotation = controller(&network, &toggle);

        let result = rotation.rotate().await;
        assert_eq!(result.failure, Some(RotationFailure::NotConnected));
        assert_eq!(result.message, "network not connected");
        assert_eq!(result.reconnect_wait, Duration::ZERO);
        assert_eq!(toggle.disables(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_capability_fails_fast() {
        let network = Arc::new(MockNetwork::new("1.1.1.1"));
        let toggle = Arc::new(MockToggle::linked(network.clone()));
        toggle.set_available(false);
        let rotation = controller(&network, &toggle);

        let result = rotation.rotate().await;
        assert_eq!(result.failure, Some(RotationFailure::CapabilityUnavailable));
        assert_eq!(toggle.disables(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_identity_retried_once() {
        let network = Arc::new(MockNetwork::new("1.1.1.1"));
        let toggle = Arc::new(MockToggle::linked(network.clone()));
        let rotation = controller(&network, &toggle);

        let result = rotation.rotate().await;
        assert_eq!(result.failure, Some(RotationFailure::IdentityUnchanged));
        assert_eq!(toggle.cycles(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_after_unchanged_identity() {
        let network = Arc::new(MockNetwork::new("1.1.1.1"));
        // First attempt sees the old identity, the retry a new one.
        network.push_identities(["1.1.1.1", "1.1.1.1", "3.3.3.3"]);
        let toggle = Arc::new(MockToggle::linked(network.clone()));
        let rotation = controller(&network, &toggle);

        let result = rotation.rotate().await;
        assert!(result.success, "{}", result.message);
        assert_eq!(result.identity_after, "3.3.3.3");
        assert_eq!(toggle.cycles(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_placeholder_identity_after_reconnect_fails_and_retries() {
        let network = Arc::new(MockNetwork::new("1.1.1.1"));
        network.push_identities(vec![UNKNOWN_IDENTITY; 40]);
        let toggle = Arc::new(MockToggle::linked(network.clone()));
        let rotation = controller(&network, &toggle);

        let result = rotation.rotate().await;
        assert!(!result.success);
        assert_eq!(result.failure, Some(RotationFailure::IdentityUnchanged));
        assert_eq!(result.identity_after, UNKNOWN_IDENTITY);
        assert_eq!(toggle.cycles(), 2);
        // Per attempt: one refresh on reconnect plus the full poll budget.
        let per_attempt = 1 + settings().identity_poll_attempts as usize;
        assert_eq!(network.refreshes(), 2 * per_attempt);
    }

    #[tokio::test(start_paused = true)]
    async fn test_placeholder_then_new_identity_within_poll_budget() {
        let network = Arc::new(MockNetwork::new("1.1.1.1"));
        network.push_identities([UNKNOWN_IDENTITY, "", UNKNOWN_IDENTITY, "4.4.4.4"]);
        let toggle = Arc::new(MockToggle::linked(network.clone()));
        let rotation = controller(&network, &toggle);

        let started = Instant::now();
        let result = rotation.rotate().await;
        assert!(result.success, "{}", result.message);
        assert_eq!(result.identity_after, "4.4.4.4");
        assert_eq!(toggle.cycles(), 1);
        assert_eq!(network.refreshes(), 4);
        // Two placeholder polls, each followed by one poll interval.
        let settings = settings();
        let minimum = settings.toggle_delay()
            + settings.settle_delay()
            + 2 * settings.identity_poll_interval();
        assert!(started.elapsed() >= minimum);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_timeout_retried_once() {
        let network = Arc::new(MockNetwork::new("1.1.1.1"));
        let toggle = Arc::new(MockToggle::linked(network.clone()));
        toggle.set_restores_connectivity(false);
        let rotation = controller(&network, &toggle);

        let started = Instant::now();
        let result = rotation.rotate().await;
        assert_eq!(result.failure, Some(RotationFailure::ReconnectTimeout));
        assert_eq!(result.message, "failed to reconnect");
        assert!(result.reconnect_wait >= Duration::from_secs(30));
        assert_eq!(toggle.cycles(), 2);
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_error_is_a_result() {
        let network = Arc::new(MockNetwork::new("1.1.1.1"));
        let toggle = Arc::new(MockToggle::linked(network.clone()));
        toggle.set_failing(true);
        let rotation = controller(&network, &toggle);

        let result = rotation.rotate().await;
        assert!(matches!(result.failure, Some(RotationFailure::ToggleFailed(_))));
        assert_eq!(toggle.disables(), 2);
        assert!(!rotation.is_rotating());
    }

    #[tokio::test]
    async fn test_command_toggle() {
        let toggle = CommandToggle::new(&RotationConfig {
            probe_command: Some("exit 0".into()),
            disable_command: "exit 3".into(),
            enable_command: "true".into(),
            ..RotationConfig::default()
        });
        assert!(toggle.is_available().await);
        assert!(toggle.set_connectivity(true).await.is_ok());
        assert!(matches!(
            toggle.set_connectivity(false).await,
            Err(PacerError::Toggle(_))
        ));

        let unavailable = CommandToggle::new(&RotationConfig {
            probe_command: Some("false".into()),
            ..RotationConfig::default()
        });
        assert!(!unavailable.is_available().await);
    }
}
