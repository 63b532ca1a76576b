//! HTTP request executor
//!
//! Plain GET against the target with the device identity's user agent.
//! Redirect and success statuses count as a successful visit.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::Result,
    orchestrator::RequestExecutor,
    types::{DeviceIdentity, VisitReport},
};

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

pub struct HttpVisitExecutor {
    client: reqwest::Client,
}

impl HttpVisitExecutor {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

/// 2xx and 3xx
pub fn is_success_status(status: u16) -> bool {
    (200..400).contains(&status)
}

#[async_trait]
impl RequestExecutor for HttpVisitExecutor {
    async fn dispatch(
        &self,
        target: &str,
        device: &DeviceIdentity,
        session_id: Uuid,
    ) -> Result<VisitReport> {
        let started = Instant::now();
        let response = self
            .client
            .get(target)
            .header(USER_AGENT, device.user_agent.as_str())
            .header(ACCEPT, ACCEPT_HTML)
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .send()
            .await?;
        let latency = started.elapsed();
        let status = response.status().as_u16();
        debug!("[{}] GET {} -> {} ({:?})", session_id, target, status, latency);

        Ok(VisitReport {
            status_code: status,
            success: is_success_status(status),
            latency,
        })
    }
}
