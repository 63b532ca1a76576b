//! Dwell-time planner
//!
//! Emulates the time a visitor spends on the visited resource: page load,
//! reading, optional scrolling, an occasional secondary action and an exit
//! delay. The planner only computes durations; the orchestrator sleeps the
//! total cooperatively so a stop request is honored within a second.

use std::{sync::Arc, time::Duration};

use serde::Serialize;

use crate::{
    timing::TimingModel,
    types::{DeviceIdentity, DeviceTier},
};

const SECONDARY_ACTION_PROBABILITY: f64 = 0.3;
const SCROLL_PAUSE_PROBABILITY: f64 = 0.2;
const BASE_SCROLL_INTERVAL_MS: f64 = 300.0;

/// Secondary interaction performed after reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SecondaryAction {
    /// Find and click a link
    Click,
    /// Drag-select text
    SelectText,
    /// Hover over a few elements
    Hover,
}

/// One phase of a dwell
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DwellStep {
    PageLoad,
    Reading,
    Scroll { depth: u8, events: u32 },
    Secondary(SecondaryAction),
    Exit,
}

/// Ordered dwell phases with their durations
#[derive(Debug, Clone, Default, Serialize)]
pub struct DwellPlan {
    pub steps: Vec<(DwellStep, Duration)>,
}

impl DwellPlan {
    /// Sum of all phases
    pub fn total(&self) -> Duration {
        self.steps.iter().map(|(_, d)| *d).sum()
    }
}

/// Plans dwell phases from the shared timing model
pub struct BehaviorSimulator {
    timing: Arc<TimingModel>,
}

impl BehaviorSimulator {
    pub fn new(timing: Arc<TimingModel>) -> Self {
        Self { timing }
    }

    /// Build the dwell plan for one visit
    pub fn plan(&self, device: &DeviceIdentity, content_length: u8) -> DwellPlan {
        let mut steps = vec![
            (DwellStep::PageLoad, self.load_time(device)),
            (
                DwellStep::Reading,
                self.timing.reading_time_for(device, content_length),
            ),
        ];

        if self.timing.will_scroll() {
            let depth = self.timing.scroll_depth();
            let (events, duration) = self.scroll_time(depth);
            steps.push((DwellStep::Scroll { depth, events }, duration));
        }

        if self.timing.unit() < SECONDARY_ACTION_PROBABILITY {
            let (action, duration) = self.secondary_action();
            steps.push((DwellStep::Secondary(action), duration));
        }

        let exit_ms = 500.0 + self.timing.unit() * 2000.0;
        steps.push((DwellStep::Exit, ms(exit_ms)));

        DwellPlan { steps }
    }

    fn load_time(&self, device: &DeviceIdentity) -> Duration {
        let mut base = 1000.0;
        match device.tier {
            DeviceTier::Budget => base += 1000.0,
            DeviceTier::Flagship => base -= 200.0,
            DeviceTier::MidRange => {}
        }
        if !device.is_mobile() {
            base -= 300.0;
        }
        base += self.timing.gaussian(0.0, 300.0);
        ms(base.clamp(500.0, 5000.0))
    }

    /// Scroll events slow down as the reader gets further down the page
    fn scroll_time(&self, depth: u8) -> (u32, Duration) {
        let events = 5 + u32::from(depth) / 10;
        let mut total = 0.0;
        for i in 0..events {
            let step = BASE_SCROLL_INTERVAL_MS
                + f64::from(i) * 2.5 * BASE_SCROLL_INTERVAL_MS / f64::from(events);
            total += (step + self.timing.gaussian(0.0, 100.0)).clamp(100.0, 2000.0);

            if self.timing.unit() < SCROLL_PAUSE_PROBABILITY {
                total += self.timing.gaussian(500.0, 300.0).clamp(200.0, 1500.0);
            }
        }
        (events, ms(total))
    }

    fn secondary_action(&self) -> (SecondaryAction, Duration) {
        let roll = self.timing.unit();
        if roll < 0.5 {
            let find = self.timing.gaussian(800.0, 200.0).max(50.0);
            (SecondaryAction::Click, ms(find + 50.0 + 300.0))
        } else if roll < 0.8 {
            let drag = self.timing.gaussian(400.0, 100.0).max(50.0);
            (SecondaryAction::SelectText, ms(500.0 + drag))
        } else {
            let hovers = self.timing.range_inclusive(2, 5);
            let total: f64 = (0..hovers)
                .map(|_| {
                    self.timing.gaussian(300.0, 100.0).max(50.0)
                        + self.timing.gaussian(200.0, 150.0).max(50.0)
                })
                .sum();
            (SecondaryAction::Hover, ms(total))
        }
    }
}

fn ms(value: f64) -> Duration {
    Duration::from_millis(value.max(0.0) as u64)
}
