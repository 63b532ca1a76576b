//! Network state
//!
//! Connectivity and egress identity as seen by the orchestration core.

use std::{sync::RwLock, time::Duration};

use async_trait::async_trait;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::{
    config::NetworkConfig,
    error::Result,
    types::{is_placeholder_identity, UNKNOWN_IDENTITY},
};

/// Spacing of reconnection polls
const RECONNECT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Connectivity and egress identity provider
#[async_trait]
pub trait NetworkStateProvider: Send + Sync {
    /// Whether the network is currently usable
    async fn is_connected(&self) -> bool;

    /// Last known egress identity, possibly empty or `"Unknown"`
    fn current_identity(&self) -> String;

    /// Re-query the egress identity and return it
    async fn refresh_identity(&self) -> String;

    /// Poll connectivity until it is back or `limit` elapses. Refreshes the
    /// identity on success.
    async fn wait_for_reconnection(&self, limit: Duration) -> bool {
        let started = Instant::now();
        loop {
            if self.is_connected().await {
                self.refresh_identity().await;
                return true;
            }
            if started.elapsed() >= limit {
                return false;
            }
            sleep(RECONNECT_POLL_INTERVAL).await;
        }
    }
}

/// Probes a TCP endpoint for connectivity and a plain-text lookup service for
/// the public IP
pub struct PublicIpMonitor {
    client: reqwest::Client,
    lookup_url: String,
    probe_addr: String,
    probe_timeout: Duration,
    identity: RwLock<String>,
}

impl PublicIpMonitor {
    pub fn new(config: &NetworkConfig) -> Result<Self> {
        let probe_timeout = Duration::from_millis(config.probe_timeout_ms);
        let client = reqwest::Client::builder().timeout(probe_timeout).build()?;
        Ok(Self {
            client,
            lookup_url: config.ip_lookup_url.clone(),
            probe_addr: config.connectivity_probe.clone(),
            probe_timeout,
            identity: RwLock::new(UNKNOWN_IDENTITY.to_string()),
        })
    }

    async fn lookup(&self) -> Result<String> {
        let body = self
            .client
            .get(&self.lookup_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body.trim().to_string())
    }
}

#[async_trait]
impl NetworkStateProvider for PublicIpMonitor {
    async fn is_connected(&self) -> bool {
        match timeout(
            self.probe_timeout,
            tokio::net::TcpStream::connect(self.probe_addr.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => {
                drop(stream);
                true
            }
            Ok(Err(e)) => {
                debug!("Connectivity probe to {} failed: {}", self.probe_addr, e);
                false
            }
            Err(_) => false,
        }
    }

    fn current_identity(&self) -> String {
        self.identity.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn refresh_identity(&self) -> String {
        let identity = match self.lookup().await {
            Ok(ip) if !is_placeholder_identity(&ip) => ip,
            Ok(_) => UNKNOWN_IDENTITY.to_string(),
            Err(e) => {
                warn!("Egress lookup failed: {}", e);
                UNKNOWN_IDENTITY.to_string()
            }
        };
        *self.identity.write().unwrap_or_else(|e| e.into_inner()) = identity.clone();
        identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockNetwork;

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_reconnection_times_out() {
        let network = MockNetwork::new("1.1.1.1");
        network.set_connected(false);
        let started = tokio::time::Instant::now();
        assert!(!network.wait_for_reconnection(Duration::from_secs(3)).await);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_reconnection_refreshes_identity() {
        let network = MockNetwork::new("1.1.1.1");
        network.push_identities(["2.2.2.2"]);
        assert!(network.wait_for_reconnection(Duration::from_secs(3)).await);
        assert_eq!(network.current_identity(), "2.2.2.2");
    }

    #[test]
    fn test_monitor_starts_unknown() {
        let monitor = PublicIpMonitor::new(&NetworkConfig::default()).unwrap();
        assert_eq!(monitor.current_identity(), UNKNOWN_IDENTITY);
    }
}
