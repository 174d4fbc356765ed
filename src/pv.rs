//! PV surplus estimation
//!
//! Derives the surplus that would be available without the EVs' own draw,
//! smooths it over a trailing window and gates it through a start/stop
//! hysteresis so connectors in PV modes do not flap on passing clouds.

use crate::config::{PvConfig, duration_s};
use crate::logging::get_logger;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Hard upper bound on buffered samples regardless of window length
const MAX_SAMPLES: usize = 4096;

/// Recompute the running sum from scratch after this many updates
const COMPACTION_EVERY: u32 = 256;

/// Surplus the plant would export if no EV were charging.
///
/// `grid_power_w` is signed with import positive.
pub fn surplus_without_ev(grid_power_w: f64, ev_power_w: f64) -> f64 {
    (-grid_power_w + ev_power_w).max(0.0)
}

/// Published PV figures for one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PvReading {
    pub raw_w: f64,
    pub smoothed_w: f64,
    /// Smoothed surplus when available, zero otherwise
    pub cap_w: f64,
    pub available: bool,
}

/// Cross-cycle hysteresis state
#[derive(Debug, Clone, Default, Serialize)]
pub struct PvHysteresis {
    pub available: bool,
    pub mean_w: f64,
    pub above_since: Option<DateTime<Utc>>,
    pub below_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: DateTime<Utc>,
    watts: f64,
}

/// Rolling-mean and hysteresis gate for PV surplus
#[derive(Debug, Clone)]
pub struct PvEstimator {
    config: PvConfig,
    samples: VecDeque<Sample>,
    sum: f64,
    updates_since_compaction: u32,
    state: PvHysteresis,
    last: PvReading,
    logger: crate::logging::StructuredLogger,
}

impl PvEstimator {
    pub fn new(config: PvConfig) -> Self {
        Self {
            config,
            samples: VecDeque::new(),
            sum: 0.0,
            updates_since_compaction: 0,
            state: PvHysteresis::default(),
            last: PvReading::default(),
            logger: get_logger("pv"),
        }
    }

    pub fn state(&self) -> &PvHysteresis {
        &self.state
    }

    /// Reading published by the most recent update
    pub fn last_reading(&self) -> PvReading {
        self.last
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Feed one cycle's raw surplus and grid power, returning the new reading
    pub fn update(&mut self, now: DateTime<Utc>, raw_w: f64, grid_power_w: f64) -> PvReading {
        let raw_w = if raw_w.is_finite() { raw_w.max(0.0) } else { 0.0 };
        self.push_sample(now, raw_w);
        let smoothed_w = self.mean();
        self.state.mean_w = smoothed_w;
        self.apply_hysteresis(now, raw_w, grid_power_w);

        let reading = PvReading {
            raw_w,
            smoothed_w,
            cap_w: if self.state.available {
                smoothed_w.max(0.0)
            } else {
                0.0
            },
            available: self.state.available,
        };
        self.last = reading;
        reading
    }

    fn push_sample(&mut self, now: DateTime<Utc>, watts: f64) {
        let window = duration_s(self.config.window_s);
        self.samples.push_back(Sample { at: now, watts });
        self.sum += watts;

        while let Some(front) = self.samples.front() {
            if now - front.at > window || self.samples.len() > MAX_SAMPLES {
                self.sum -= front.watts;
                self.samples.pop_front();
            } else {
                break;
            }
        }

        self.updates_since_compaction += 1;
        if self.updates_since_compaction >= COMPACTION_EVERY {
            self.sum = self.samples.iter().map(|s| s.watts).sum();
            self.updates_since_compaction = 0;
        }
    }

    fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            (self.sum / self.samples.len() as f64).max(0.0)
        }
    }

    fn apply_hysteresis(&mut self, now: DateTime<Utc>, raw_w: f64, grid_power_w: f64) {
        let start_delay = duration_s(self.config.start_delay_s);
        let stop_delay = duration_s(self.config.stop_delay_s);

        if let Some(abort) = self.config.abort_import_w
            && grid_power_w > abort
        {
            if self.state.available {
                self.logger.info(&format!(
                    "PV surplus unavailable: grid import {:.0} W exceeds abort ceiling {:.0} W",
                    grid_power_w, abort
                ));
            }
            self.state.available = false;
            self.state.above_since = None;
            self.state.below_since = None;
            return;
        }

        if raw_w >= self.config.start_threshold_w {
            self.state.below_since = None;
            if self.state.available {
                self.state.above_since = None;
                return;
            }
            let since = *self.state.above_since.get_or_insert(now);
            if now - since >= start_delay {
                self.state.available = true;
                self.state.above_since = None;
                self.logger.info(&format!(
                    "PV surplus available: {:.0} W held above {:.0} W for {}s",
                    raw_w, self.config.start_threshold_w, self.config.start_delay_s
                ));
            }
        } else if raw_w <= self.config.stop_threshold_w {
            self.state.above_since = None;
            if !self.state.available {
                self.state.below_since = None;
                return;
            }
            let since = *self.state.below_since.get_or_insert(now);
            if now - since >= stop_delay {
                self.state.available = false;
                self.state.below_since = None;
                self.logger.info(&format!(
                    "PV surplus unavailable: {:.0} W held below {:.0} W for {}s",
                    raw_w, self.config.stop_threshold_w, self.config.stop_delay_s
                ));
            }
        } else {
            self.state.above_since = None;
            self.state.below_since = None;
        }
    }
}
