//! Human-like timing model
//!
//! Randomized, human-plausible durations built from a few statistical
//! primitives. All draws share one ChaCha20 source that can be seeded for
//! deterministic tests. The configuration is read on every call; nothing
//! derived from it is cached.

use std::{
    sync::{Mutex, RwLock},
    time::Duration,
};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Exp, Normal};
use tracing::debug;

use crate::{config::TimingConfig, types::DeviceIdentity};

/// Reading time never drops below this (ms)
const MIN_READING_TIME_MS: f64 = 1000.0;

/// Stddev of the scroll depth distribution (%)
const SCROLL_DEPTH_STDDEV: f64 = 20.0;

/// Branch of the human-like interval mixture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalBranch {
    /// Normal around the midpoint (50%)
    Normal,
    /// Exponential with mean `min` (30%)
    Exponential,
    /// Normal plus exponential tail (20%)
    LongTail,
}

impl IntervalBranch {
    /// Map a uniform draw in [0, 1) onto the mixture weights
    pub fn from_choice(choice: f64) -> Self {
        if choice < 0.5 {
            Self::Normal
        } else if choice < 0.8 {
            Self::Exponential
        } else {
            Self::LongTail
        }
    }
}

/// Timing model
pub struct TimingModel {
    config: RwLock<TimingConfig>,
    rng: Mutex<ChaCha20Rng>,
}

impl TimingModel {
    /// Model seeded from OS entropy
    pub fn new(config: TimingConfig) -> Self {
        Self::with_rng(config, ChaCha20Rng::from_entropy())
    }

    /// Deterministic model for tests and replays
    pub fn with_seed(config: TimingConfig, seed: u64) -> Self {
        Self::with_rng(config, ChaCha20Rng::seed_from_u64(seed))
    }

    pub fn with_rng(config: TimingConfig, rng: ChaCha20Rng) -> Self {
        Self {
            config: RwLock::new(config),
            rng: Mutex::new(rng),
        }
    }

    /// Current configuration
    pub fn config(&self) -> TimingConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the configuration
    pub fn set_config(&self, config: TimingConfig) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    /// Update only the inter-visit bounds
    pub fn set_interval_bounds(&self, min_secs: u64, max_secs: u64) {
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        config.min_interval_secs = min_secs;
        config.max_interval_secs = max_secs;
        debug!("⏱️ Interval bounds: {}s..{}s", min_secs, max_secs);
    }

    // ── Intervals ───────────────────────────────────────────────────────────

    /// Integer drawn uniformly from `[min, max]`; `min` when `min >= max`
    pub fn interval_uniform(&self, min: u64, max: u64) -> u64 {
        if min >= max {
            return min;
        }
        self.rng().gen_range(min..=max)
    }

    /// Mixture draw that avoids the flat signature of uniform sampling.
    ///
    /// `min` is clamped to at least 1 and `max` forced above `min`.
    pub fn interval_human_like(&self, min: u64, max: u64) -> u64 {
        let choice: f64 = self.rng().gen();
        self.interval_for_branch(IntervalBranch::from_choice(choice), min, max)
    }

    /// Draw from one specific mixture branch
    pub fn interval_for_branch(&self, branch: IntervalBranch, min: u64, max: u64) -> u64 {
        let min = min.max(1);
        let max = if max <= min { min + 1 } else { max };
        let (lo, hi) = (min as f64, max as f64);
        let range = hi - lo;

        let raw = match branch {
            IntervalBranch::Normal => {
                let mean = (lo + hi) / 2.0;
                let stddev = (range / 4.0).max(1.0);
                self.gaussian(mean, stddev)
            }
            IntervalBranch::Exponential => self.exponential(lo),
            IntervalBranch::LongTail => {
                let mean = lo + range / 3.0;
                let stddev = (range / 2.0).max(1.0);
                self.gaussian(mean, stddev) + self.exponential(stddev / 2.0)
            }
        };

        let value = raw.clamp(lo, hi) as u64;
        debug!("⏱️ {:?} interval: {}s", branch, value);
        value
    }

    /// Next inter-visit wait (s) from the configured bounds
    pub fn next_interval_secs(&self) -> u64 {
        let (min, max) = {
            let config = self.config.read().unwrap_or_else(|e| e.into_inner());
            (config.min_interval_secs, config.max_interval_secs)
        };
        self.interval_human_like(min, max)
    }

    // ── Reading & scrolling ─────────────────────────────────────────────────

    /// Reading time: mobile clients read 20% faster, longer content scales
    /// the mean by `0.5 + content_length / 100`. Never below one second.
    pub fn reading_time(
        &self,
        is_mobile: bool,
        content_length: u8,
        mean_ms: f64,
        stddev_ms: f64,
    ) -> Duration {
        let mut mean = if is_mobile { mean_ms * 0.8 } else { mean_ms };
        mean *= 0.5 + f64::from(content_length.min(100)) / 100.0;
        let ms = self.gaussian(mean, stddev_ms).max(MIN_READING_TIME_MS);
        Duration::from_millis(ms as u64)
    }

    /// Reading time for a device using the configured distribution
    pub fn reading_time_for(&self, device: &DeviceIdentity, content_length: u8) -> Duration {
        let config = self.config();
        self.reading_time(
            device.is_mobile(),
            content_length,
            config.reading_time_mean_ms,
            config.reading_time_stddev_ms,
        )
    }

    /// Bernoulli draw
    pub fn scroll_decision(&self, probability: f64) -> bool {
        self.rng().gen::<f64>() < probability
    }

    /// Bernoulli draw with the configured scroll probability
    pub fn will_scroll(&self) -> bool {
        let probability = self.config().scroll_probability;
        self.scroll_decision(probability)
    }

    /// Scroll depth (%) around the configured average, clamped to [0, 100]
    pub fn scroll_depth(&self) -> u8 {
        let average = self.config().average_scroll_depth;
        self.gaussian(average, SCROLL_DEPTH_STDDEV).clamp(0.0, 100.0) as u8
    }

    // ── Primitives ──────────────────────────────────────────────────────────

    /// Normal draw; a degenerate stddev yields the mean
    pub fn gaussian(&self, mean: f64, stddev: f64) -> f64 {
        match Normal::new(mean, stddev) {
            Ok(normal) => normal.sample(&mut *self.rng()),
            Err(_) => mean,
        }
    }

    /// Exponential draw with the given mean
    pub fn exponential(&self, mean: f64) -> f64 {
        if mean <= 0.0 {
            return 0.0;
        }
        match Exp::new(1.0 / mean) {
            Ok(exp) => exp.sample(&mut *self.rng()),
            Err(_) => mean,
        }
    }

    /// Uniform draw in [0, 1)
    pub fn unit(&self) -> f64 {
        self.rng().gen()
    }

    /// Uniform integer in `[lo, hi]`
    pub fn range_inclusive(&self, lo: u32, hi: u32) -> u32 {
        if lo >= hi {
            return lo;
        }
        self.rng().gen_range(lo..=hi)
    }

    fn rng(&self) -> std::sync::MutexGuard<'_, ChaCha20Rng> {
        self.rng.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for TimingModel {
    fn default() -> Self {
        Self::new(TimingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClientType, DeviceTier};

    fn model(seed: u64) -> TimingModel {
        TimingModel::with_seed(TimingConfig::default(), seed)
    }

    fn device(client_type: ClientType) -> DeviceIdentity {
        DeviceIdentity {
            platform: "android".into(),
            tier: DeviceTier::MidRange,
            client_type,
            user_agent: "test".into(),
        }
    }

    #[test]
    fn test_uniform_stays_in_bounds() {
        let timing = model(1);
        for _ in 0..5_000 {
            let v = timing.interval_uniform(3, 9);
            assert!((3..=9).contains(&v));
        }
    }

    #[test]
    fn test_uniform_degenerate_returns_min() {
        let timing = model(2);
        assert_eq!(timing.interval_uniform(7, 7), 7);
        assert_eq!(timing.interval_uniform(9, 4), 9);
    }

    #[test]
    fn test_human_like_clamped_over_many_samples() {
        let timing = model(3);
        for (min, max) in [(30, 90), (1, 5), (10, 11), (120, 600)] {
            for _ in 0..10_000 {
                let v = timing.interval_human_like(min, max);
                assert!(v >= min && v <= max, "{v} outside [{min}, {max}]");
            }
        }
    }

    #[test]
    fn test_human_like_repairs_degenerate_bounds() {
        let timing = model(4);
        for _ in 0..1_000 {
            let v = timing.interval_human_like(0, 0);
            assert!((1..=2).contains(&v));
            let v = timing.interval_human_like(8, 3);
            assert!((8..=9).contains(&v));
        }
    }

    #[test]
    fn test_branch_selection() {
        assert_eq!(IntervalBranch::from_choice(0.0), IntervalBranch::Normal);
        assert_eq!(IntervalBranch::from_choice(0.49), IntervalBranch::Normal);
        assert_eq!(IntervalBranch::from_choice(0.5), IntervalBranch::Exponential);
        assert_eq!(IntervalBranch::from_choice(0.79), IntervalBranch::Exponential);
        assert_eq!(IntervalBranch::from_choice(0.8), IntervalBranch::LongTail);
    }

    #[test]
    fn test_normal_branch_centers_on_midpoint() {
        let timing = model(5);
        let samples = 4_000;
        let total: u64 = (0..samples)
            .map(|_| timing.interval_for_branch(IntervalBranch::Normal, 20, 100))
            .sum();
        let mean = total as f64 / samples as f64;
        assert!((mean - 60.0).abs() < 3.0, "mean was {mean}");
    }

    #[test]
    fn test_exponential_branch_hugs_minimum() {
        let timing = model(6);
        let samples = 4_000;
        let total: u64 = (0..samples)
            .map(|_| timing.interval_for_branch(IntervalBranch::Exponential, 20, 100))
            .sum();
        let mean = total as f64 / samples as f64;
        assert!(mean < 40.0, "mean was {mean}");
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let a = model(42);
        let b = model(42);
        let xs: Vec<u64> = (0..50).map(|_| a.interval_human_like(30, 90)).collect();
        let ys: Vec<u64> = (0..50).map(|_| b.interval_human_like(30, 90)).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn test_reading_time_floor() {
        let timing = model(7);
        for _ in 0..2_000 {
            let t = timing.reading_time(true, 0, 100.0, 5_000.0);
            assert!(t >= Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_mobile_reads_faster_on_average() {
        let timing = model(8);
        let avg = |client| {
            let d = device(client);
            let total: u128 = (0..5_000)
                .map(|_| timing.reading_time_for(&d, 100).as_millis())
                .sum();
            total as f64 / 5_000.0
        };
        let mobile = avg(ClientType::Mobile);
        let desktop = avg(ClientType::Desktop);
        assert!(mobile < desktop, "mobile {mobile} desktop {desktop}");
    }

    #[test]
    fn test_scroll_decision_extremes() {
        let timing = model(9);
        assert!((0..100).all(|_| !timing.scroll_decision(0.0)));
        assert!((0..100).all(|_| timing.scroll_decision(1.0)));
    }

    #[test]
    fn test_scroll_depth_bounds() {
        let timing = model(10);
        for _ in 0..5_000 {
            assert!(timing.scroll_depth() <= 100);
        }
    }

    #[test]
    fn test_interval_bounds_are_read_live() {
        let timing = model(11);
        timing.set_interval_bounds(5, 6);
        for _ in 0..500 {
            assert!((5..=6).contains(&timing.next_interval_secs()));
        }
    }
}
