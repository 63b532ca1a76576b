//! Traffic Schedule
//!
//! Spreads a fixed visit budget over a time window. Each distribution pattern
//! yields a normalized 24-hour weight map; the interval array has one entry
//! per gap between consecutive visits.

use std::fmt;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{PacerError, Result},
    types::{HOURS_PER_DAY, MIN_SCHEDULE_INTERVAL_MS},
};

const MS_PER_HOUR: u64 = 60 * 60 * 1000;

const BURST_COUNT: usize = 3;
const BURST_LENGTH: usize = 3;
const BURST_WEIGHT: f64 = 1.0;
const BURST_GAP_WEIGHT: f64 = 0.1;

const RANDOM_WEIGHT_MIN: f64 = 0.1;
const RANDOM_WEIGHT_MAX: f64 = 1.0;

// ==================== PATTERN ====================

/// Hourly weighting strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DistributionPattern {
    /// Same weight for every hour
    #[default]
    Even,
    /// Fixed share of traffic inside a peak window
    PeakHours,
    /// Independent random weight per hour
    Random,
    /// Three short high-traffic windows
    Burst,
}

impl DistributionPattern {
    pub const ALL: [DistributionPattern; 4] = [
        DistributionPattern::Even,
        DistributionPattern::PeakHours,
        DistributionPattern::Random,
        DistributionPattern::Burst,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Even => "Even Distribution",
            Self::PeakHours => "Peak Hours",
            Self::Random => "Random Distribution",
            Self::Burst => "Burst Mode",
        }
    }

    /// Parse a pattern name. Unknown names fall back to `Even`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "peak-hours" | "peakhours" | "peak" => Self::PeakHours,
            "random" => Self::Random,
            "burst" => Self::Burst,
            _ => Self::Even,
        }
    }
}

impl fmt::Display for DistributionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

// ==================== PEAK WINDOW ====================

/// Peak window `[start_hour, end_hour)`, wrapping past midnight when
/// `start_hour > end_hour`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakWindow {
    pub start_hour: u8,
    pub end_hour: u8,
    /// Share of total traffic inside the window
    pub weight: f64,
}

impl Default for PeakWindow {
    fn default() -> Self {
        Self {
            start_hour: 9,
            end_hour: 17,
            weight: 0.7,
        }
    }
}

impl PeakWindow {
    pub fn contains(&self, hour: usize) -> bool {
        let (start, end) = (self.start_hour as usize, self.end_hour as usize);
        if start <= end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }

    pub fn hour_count(&self) -> usize {
        (0..HOURS_PER_DAY).filter(|h| self.contains(*h)).count()
    }
}

// ==================== PLAN ====================

/// Interval array ready for the schedule runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulePlan {
    pub total_visits: u32,
    pub duration_hours: u32,
    pub pattern: DistributionPattern,
    /// Hour the weighted derivation was anchored at, if weights were applied
    pub start_hour: Option<u8>,
    /// Waits between consecutive visits (ms), `total_visits - 1` entries
    pub intervals: Vec<u64>,
}

impl SchedulePlan {
    /// Sum of all waits (ms)
    pub fn total_wait_ms(&self) -> u64 {
        self.intervals.iter().sum()
    }

    /// Remaining wait once `fired` visits have gone out (ms)
    pub fn remaining_ms(&self, fired: usize) -> u64 {
        self.intervals.iter().skip(fired.saturating_sub(1)).sum()
    }
}

// ==================== SCHEDULE ====================

/// Visit budget, window length and hourly weight map
#[derive(Debug, Clone, Serialize)]
pub struct TrafficSchedule {
    total_visits: u32,
    duration_hours: u32,
    pattern: DistributionPattern,
    peak: PeakWindow,
    hourly_weights: [f64; HOURS_PER_DAY],
}

impl TrafficSchedule {
    pub fn new(total_visits: u32, duration_hours: u32, pattern: DistributionPattern) -> Result<Self> {
        Self::with_rng(
            total_visits,
            duration_hours,
            pattern,
            PeakWindow::default(),
            &mut ChaCha20Rng::from_entropy(),
        )
    }

    /// Schedule with an explicit peak window and random source
    pub fn with_rng<R: Rng + ?Sized>(
        total_visits: u32,
        duration_hours: u32,
        pattern: DistributionPattern,
        peak: PeakWindow,
        rng: &mut R,
    ) -> Result<Self> {
        if total_visits == 0 {
            return Err(PacerError::InvalidSchedule("total visits must be at least 1".into()));
        }
        if duration_hours == 0 {
            return Err(PacerError::InvalidSchedule("duration must be at least 1 hour".into()));
        }
        validate_peak(&peak)?;

        let mut schedule = Self {
            total_visits,
            duration_hours,
            pattern,
            peak,
            hourly_weights: [0.0; HOURS_PER_DAY],
        };
        schedule.derive_weights(rng);
        debug!(
            "📅 Schedule: {} visits over {}h ({})",
            total_visits, duration_hours, pattern
        );
        Ok(schedule)
    }

    /// Replace the peak window. Weights are re-derived only for `PeakHours`.
    pub fn set_peak_window(&mut self, peak: PeakWindow) -> Result<()> {
        validate_peak(&peak)?;
        self.peak = peak;
        if self.pattern == DistributionPattern::PeakHours {
            self.hourly_weights = peak_weights(&self.peak);
            normalize(&mut self.hourly_weights);
        }
        Ok(())
    }

    pub fn total_visits(&self) -> u32 {
        self.total_visits
    }

    pub fn duration_hours(&self) -> u32 {
        self.duration_hours
    }

    pub fn pattern(&self) -> DistributionPattern {
        self.pattern
    }

    pub fn peak_window(&self) -> PeakWindow {
        self.peak
    }

    /// Normalized hour -> weight map
    pub fn hourly_weights(&self) -> [f64; HOURS_PER_DAY] {
        self.hourly_weights
    }

    pub fn total_duration_ms(&self) -> u64 {
        u64::from(self.duration_hours) * MS_PER_HOUR
    }

    fn derive_weights<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.hourly_weights = match self.pattern {
            DistributionPattern::Even => [1.0 / HOURS_PER_DAY as f64; HOURS_PER_DAY],
            DistributionPattern::PeakHours => peak_weights(&self.peak),
            DistributionPattern::Random => {
                let mut weights = [0.0; HOURS_PER_DAY];
                for weight in weights.iter_mut() {
                    *weight = rng.gen_range(RANDOM_WEIGHT_MIN..RANDOM_WEIGHT_MAX);
                }
                weights
            }
            DistributionPattern::Burst => burst_weights(),
        };
        normalize(&mut self.hourly_weights);
    }

    /// Waits between consecutive visits (ms).
    ///
    /// `Even` uses one constant wait of `total / visits`. The other patterns
    /// place visit `i` at fraction `i / visits` of the window; waits that come
    /// out non-positive are raised to one second.
    pub fn calculate_intervals(&self) -> Vec<u64> {
        let total_ms = self.total_duration_ms();
        let n = self.total_visits as usize;

        if self.pattern == DistributionPattern::Even {
            let interval = total_ms / u64::from(self.total_visits);
            return vec![interval; n.saturating_sub(1)];
        }

        let timestamps: Vec<i64> = (0..n)
            .map(|i| (i as f64 / n as f64 * total_ms as f64) as i64)
            .collect();
        intervals_from_timestamps(&timestamps)
    }

    /// Waits that follow the hourly weights: visit `i` is placed where the
    /// cumulative weight of the window, starting at wall-clock `start_hour`,
    /// reaches `i / visits`.
    pub fn calculate_weighted_intervals(&self, start_hour: u8) -> Vec<u64> {
        let n = self.total_visits as usize;
        let hours = self.duration_hours as usize;
        let start = start_hour as usize % HOURS_PER_DAY;

        let weights: Vec<f64> = (0..hours)
            .map(|h| self.hourly_weights[(start + h) % HOURS_PER_DAY])
            .collect();
        let total_weight: f64 = weights.iter().sum();
        if total_weight <= 0.0 {
            return self.calculate_intervals();
        }

        let timestamps: Vec<i64> = (0..n)
            .map(|i| {
                let target = i as f64 / n as f64 * total_weight;
                inverse_cdf(&weights, target) as i64
            })
            .collect();
        intervals_from_timestamps(&timestamps)
    }

    /// Plan with the uniform derivation
    pub fn plan(&self) -> SchedulePlan {
        self.build_plan(None, self.calculate_intervals())
    }

    /// Plan with weights applied, anchored at `start_hour`
    pub fn weighted_plan(&self, start_hour: u8) -> SchedulePlan {
        self.build_plan(Some(start_hour), self.calculate_weighted_intervals(start_hour))
    }

    fn build_plan(&self, start_hour: Option<u8>, intervals: Vec<u64>) -> SchedulePlan {
        SchedulePlan {
            total_visits: self.total_visits,
            duration_hours: self.duration_hours,
            pattern: self.pattern,
            start_hour,
            intervals,
        }
    }
}

fn validate_peak(peak: &PeakWindow) -> Result<()> {
    if peak.start_hour as usize >= HOURS_PER_DAY || peak.end_hour as usize >= HOURS_PER_DAY {
        return Err(PacerError::InvalidSchedule("peak hours must be 0-23".into()));
    }
    if !(0.0..=1.0).contains(&peak.weight) {
        return Err(PacerError::InvalidSchedule("peak weight must be 0-1".into()));
    }
    Ok(())
}

fn peak_weights(peak: &PeakWindow) -> [f64; HOURS_PER_DAY] {
    let peak_hours = peak.hour_count();
    let off_hours = HOURS_PER_DAY - peak_hours;
    let per_peak = if peak_hours > 0 { peak.weight / peak_hours as f64 } else { 0.0 };
    let per_off = if off_hours > 0 { (1.0 - peak.weight) / off_hours as f64 } else { 0.0 };

    let mut weights = [0.0; HOURS_PER_DAY];
    for (hour, weight) in weights.iter_mut().enumerate() {
        *weight = if peak.contains(hour) { per_peak } else { per_off };
    }
    weights
}

/// Evenly spaced high-weight windows with low-weight gaps
fn burst_weights() -> [f64; HOURS_PER_DAY] {
    let spacing = (HOURS_PER_DAY - BURST_COUNT * BURST_LENGTH) / (BURST_COUNT + 1);
    let mut weights = [BURST_GAP_WEIGHT; HOURS_PER_DAY];

    let mut hour = spacing;
    for _ in 0..BURST_COUNT {
        for _ in 0..BURST_LENGTH {
            if hour < HOURS_PER_DAY {
                weights[hour] = BURST_WEIGHT;
                hour += 1;
            }
        }
        hour += spacing;
    }
    weights
}

/// Divide every weight by the sum. A zero map is left untouched.
pub fn normalize(weights: &mut [f64]) {
    let sum: f64 = weights.iter().sum();
    if sum > 0.0 {
        for weight in weights.iter_mut() {
            *weight /= sum;
        }
    }
}

/// Offset (ms) at which the cumulative hourly weight reaches `target`
fn inverse_cdf(weights: &[f64], target: f64) -> f64 {
    let mut cumulative = 0.0;
    for (hour, weight) in weights.iter().enumerate() {
        if *weight > 0.0 && cumulative + weight > target {
            let within = (target - cumulative) / weight;
            return (hour as f64 + within) * MS_PER_HOUR as f64;
        }
        cumulative += weight;
    }
    (weights.len() as u64 * MS_PER_HOUR) as f64
}

/// Successive differences, non-positive gaps raised to the floor
pub fn intervals_from_timestamps(timestamps: &[i64]) -> Vec<u64> {
    timestamps
        .windows(2)
        .map(|pair| {
            let gap = pair[1] - pair[0];
            if gap <= 0 {
                MIN_SCHEDULE_INTERVAL_MS
            } else {
                gap as u64
            }
        })
        .collect()
}
