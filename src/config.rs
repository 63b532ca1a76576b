//! Configuration Management
//!
//! Layered loading: built-in defaults, then an optional TOML file, then
//! `VISIT_PACER__<SECTION>__<KEY>` environment variables.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{PacerError, Result},
    schedule::{DistributionPattern, PeakWindow},
    types::{DEFAULT_CONTENT_LENGTH, HOURS_PER_DAY},
};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "VISIT_PACER";

// ==================== SECTIONS ====================

/// Immediate-mode session parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Target URL
    pub target_url: String,
    /// Number of visits in immediate mode
    pub iterations: u32,
    /// Rotate the egress identity between visits
    pub rotate_identity: bool,
    /// Fresh device identity per visit
    pub random_device_identity: bool,
    /// Bounded wait for each visit (s)
    pub visit_timeout_secs: u64,
    /// Content length hint for dwell planning (0-100)
    pub content_length: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_url: "https://example.com".to_string(),
            iterations: 10,
            rotate_identity: false,
            random_device_identity: true,
            visit_timeout_secs: 120,
            content_length: DEFAULT_CONTENT_LENGTH,
        }
    }
}

/// Statistical parameters read by the timing model on every call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Minimum inter-visit interval (s)
    pub min_interval_secs: u64,
    /// Maximum inter-visit interval (s)
    pub max_interval_secs: u64,
    /// Mean reading time (ms)
    pub reading_time_mean_ms: f64,
    /// Reading time standard deviation (ms)
    pub reading_time_stddev_ms: f64,
    /// Probability of scrolling
    pub scroll_probability: f64,
    /// Average scroll depth (%)
    pub average_scroll_depth: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 30,
            max_interval_secs: 90,
            reading_time_mean_ms: 2000.0,
            reading_time_stddev_ms: 1000.0,
            scroll_probability: 0.82,
            average_scroll_depth: 56.0,
        }
    }
}

/// Rotation timings and the shell commands backing the toggle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Hold time between disabling and re-enabling connectivity (ms)
    pub toggle_delay_ms: u64,
    /// Reconnection timeout (s)
    pub reconnect_timeout_secs: u64,
    /// Pause after reconnection before reading the new identity (ms)
    pub settle_delay_ms: u64,
    /// Identity polling attempts
    pub identity_poll_attempts: u32,
    /// Identity polling spacing (ms)
    pub identity_poll_interval_ms: u64,
    /// Pause before the single retry (ms)
    pub retry_delay_ms: u64,
    /// Command that must exit 0 for rotation to be available
    pub probe_command: Option<String>,
    /// Command that disables connectivity
    pub disable_command: String,
    /// Command that re-enables connectivity
    pub enable_command: String,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            toggle_delay_ms: 3000,
            reconnect_timeout_secs: 30,
            settle_delay_ms: 1000,
            identity_poll_attempts: 10,
            identity_poll_interval_ms: 500,
            retry_delay_ms: 1000,
            probe_command: Some("nmcli --version".to_string()),
            disable_command: "nmcli networking off".to_string(),
            enable_command: "nmcli networking on".to_string(),
        }
    }
}

impl RotationConfig {
    pub fn toggle_delay(&self) -> Duration {
        Duration::from_millis(self.toggle_delay_ms)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.reconnect_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn identity_poll_interval(&self) -> Duration {
        Duration::from_millis(self.identity_poll_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Scheduled-mode parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Total visits across the window
    pub total_visits: u32,
    /// Window length (h)
    pub duration_hours: u32,
    /// Distribution shape
    pub pattern: DistributionPattern,
    /// Peak window start hour
    pub peak_start_hour: u8,
    /// Peak window end hour (exclusive)
    pub peak_end_hour: u8,
    /// Share of traffic inside the peak window
    pub peak_weight: f64,
    /// Space visits by hourly weight instead of uniformly
    pub apply_hourly_weights: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            total_visits: 100,
            duration_hours: 24,
            pattern: DistributionPattern::Even,
            peak_start_hour: 9,
            peak_end_hour: 17,
            peak_weight: 0.7,
            apply_hourly_weights: false,
        }
    }
}

impl ScheduleConfig {
    pub fn peak_window(&self) -> PeakWindow {
        PeakWindow {
            start_hour: self.peak_start_hour,
            end_hour: self.peak_end_hour,
            weight: self.peak_weight,
        }
    }
}

/// Network state provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Plain-text egress IP lookup endpoint
    pub ip_lookup_url: String,
    /// host:port probed for connectivity
    pub connectivity_probe: String,
    /// Probe / lookup timeout (ms)
    pub probe_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ip_lookup_url: "https://api.ipify.org".to_string(),
            connectivity_probe: "1.1.1.1:443".to_string(),
            probe_timeout_ms: 3000,
        }
    }
}

// ==================== ROOT ====================

/// Full configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PacerConfig {
    pub session: SessionConfig,
    pub timing: TimingConfig,
    pub rotation: RotationConfig,
    pub schedule: ScheduleConfig,
    pub network: NetworkConfig,
}

impl PacerConfig {
    /// Load defaults, an optional TOML file and environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&PacerConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }

        let config: PacerConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PacerConfig =
            toml::from_str(content).map_err(|e| PacerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the core cannot run with
    pub fn validate(&self) -> Result<()> {
        let session = &self.session;
        if session.target_url.trim().is_empty() {
            return Err(PacerError::Config("session.target_url is empty".into()));
        }
        url::Url::parse(&session.target_url)
            .map_err(|e| PacerError::Config(format!("session.target_url: {e}")))?;
        if session.iterations == 0 {
            return Err(PacerError::Config("session.iterations must be at least 1".into()));
        }
        if session.content_length > 100 {
            return Err(PacerError::Config("session.content_length must be 0-100".into()));
        }

        let timing = &self.timing;
        if timing.min_interval_secs > timing.max_interval_secs {
            return Err(PacerError::Config(format!(
                "timing.min_interval_secs ({}) exceeds max_interval_secs ({})",
                timing.min_interval_secs, timing.max_interval_secs
            )));
        }
        if !(0.0..=1.0).contains(&timing.scroll_probability) {
            return Err(PacerError::Config("timing.scroll_probability must be 0-1".into()));
        }
        if timing.reading_time_mean_ms < 0.0 || timing.reading_time_stddev_ms < 0.0 {
            return Err(PacerError::Config("timing reading times must be non-negative".into()));
        }

        let schedule = &self.schedule;
        if schedule.total_visits == 0 {
            return Err(PacerError::Config("schedule.total_visits must be at least 1".into()));
        }
        if schedule.duration_hours == 0 {
            return Err(PacerError::Config("schedule.duration_hours must be at least 1".into()));
        }
        if schedule.peak_start_hour as usize >= HOURS_PER_DAY
            || schedule.peak_end_hour as usize >= HOURS_PER_DAY
        {
            return Err(PacerError::Config("schedule peak hours must be 0-23".into()));
        }
        if !(0.0..=1.0).contains(&schedule.peak_weight) {
            return Err(PacerError::Config("schedule.peak_weight must be 0-1".into()));
        }

        if self.rotation.identity_poll_attempts == 0 {
            return Err(PacerError::Config(
                "rotation.identity_poll_attempts must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PacerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timing.min_interval_secs, 30);
        assert_eq!(config.rotation.reconnect_timeout(), Duration::from_secs(30));
        assert_eq!(config.schedule.pattern, DistributionPattern::Even);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = PacerConfig::from_toml_str(
            r#"
            [session]
            target_url = "https://example.org/landing"
            iterations = 3

            [schedule]
            pattern = "peak-hours"
            peak_start_hour = 22
            peak_end_hour = 6
            "#,
        )
        .unwrap();

        assert_eq!(config.session.iterations, 3);
        assert_eq!(config.session.visit_timeout_secs, 120);
        assert_eq!(config.schedule.pattern, DistributionPattern::PeakHours);
        assert_eq!(config.schedule.peak_window().start_hour, 22);
        assert_eq!(config.timing.max_interval_secs, 90);
    }

    #[test]
    fn test_rejects_inverted_interval_bounds() {
        let mut config = PacerConfig::default();
        config.timing.min_interval_secs = 10;
        config.timing.max_interval_secs = 5;
        assert!(matches!(config.validate(), Err(PacerError::Config(_))));
    }

    #[test]
    fn test_rejects_bad_schedule_values() {
        let mut config = PacerConfig::default();
        config.schedule.peak_weight = 1.5;
        assert!(config.validate().is_err());

        let mut config = PacerConfig::default();
        config.schedule.peak_end_hour = 24;
        assert!(config.validate().is_err());

        let mut config = PacerConfig::default();
        config.schedule.total_visits = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unparsable_target() {
        let mut config = PacerConfig::default();
        config.session.target_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[timing]\nmin_interval_secs = 2\nmax_interval_secs = 4\n\n[rotation]\ntoggle_delay_ms = 250"
        )
        .unwrap();

        let config = PacerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.timing.min_interval_secs, 2);
        assert_eq!(config.timing.max_interval_secs, 4);
        assert_eq!(config.rotation.toggle_delay(), Duration::from_millis(250));
        assert_eq!(config.session.target_url, "https://example.com");
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = PacerConfig::load(None).unwrap();
        assert_eq!(config.schedule.total_visits, 100);
    }
}
