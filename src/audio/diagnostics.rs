use log::{debug, warn};
use serde::Serialize;

use super::fixed::Q16;
use super::TICK_BUDGET_US;

/// Flux histogram buckets of width 0.25 covering `[0, 1.5)`.
pub const FLUX_BUCKETS: usize = 6;
const FLUX_BUCKET_WIDTH: f32 = 0.25;

/// Ticks between periodic reports (about five seconds).
pub const DEFAULT_REPORT_INTERVAL: u32 = 625;

/// Rolling tick statistics of the producer. Reports go through `log::debug!`
/// once per interval; overruns are warned about at most once per interval.
#[derive(Debug, Clone, Serialize)]
pub struct Telemetry {
    pub ticks: u64,
    pub overruns: u64,
    pub max_tick_us: u64,
    pub total_tick_us: u64,
    pub flux_histogram: [u64; FLUX_BUCKETS],
    #[serde(skip)]
    report_interval: u32,
    #[serde(skip)]
    since_report: u32,
    #[serde(skip)]
    window_overruns: u32,
    #[serde(skip)]
    window_max_us: u64,
}

impl Telemetry {
    pub fn new(report_interval: u32) -> Self {
        Self {
            ticks: 0,
            overruns: 0,
            max_tick_us: 0,
            total_tick_us: 0,
            flux_histogram: [0; FLUX_BUCKETS],
            report_interval,
            since_report: 0,
            window_overruns: 0,
            window_max_us: 0,
        }
    }

    /// Records one tick. `report_interval == 0` disables the periodic report.
    pub fn record(&mut self, tick_us: u64, flux: Q16, bpm: f32, confidence: f32) {
        self.ticks += 1;
        self.total_tick_us += tick_us;
        self.max_tick_us = self.max_tick_us.max(tick_us);
        self.window_max_us = self.window_max_us.max(tick_us);
        if tick_us > TICK_BUDGET_US {
            self.overruns += 1;
            self.window_overruns += 1;
        }

        let bucket = (flux.to_f32().max(0.0) / FLUX_BUCKET_WIDTH) as usize;
        self.flux_histogram[bucket.min(FLUX_BUCKETS - 1)] += 1;

        if self.report_interval == 0 {
            return;
        }
        self.since_report += 1;
        if self.since_report < self.report_interval {
            return;
        }

        if self.window_overruns > 0 {
            warn!(
                "{} of the last {} ticks exceeded the {} us budget (worst {} us)",
                self.window_overruns, self.since_report, TICK_BUDGET_US, self.window_max_us
            );
        }
        debug!(
            "tick avg {:.0} us, max {} us | bpm {:.1} conf {:.2} | flux hist {:?}",
            self.mean_tick_us(),
            self.window_max_us,
            bpm,
            confidence,
            self.flux_histogram
        );
        self.since_report = 0;
        self.window_overruns = 0;
        self.window_max_us = 0;
    }

    pub fn mean_tick_us(&self) -> f64 {
        if self.ticks == 0 {
            0.0
        } else {
            self.total_tick_us as f64 / self.ticks as f64
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.report_interval);
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(DEFAULT_REPORT_INTERVAL)
    }
}
