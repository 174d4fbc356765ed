//! Deadline ("goal") charging
//!
//! Turns a target state of charge and a deadline into the smallest power cap
//! that still gets there in time.

use crate::config::{GoalConfig, duration_s};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How aggressively a goal is pursued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GoalStrategy {
    /// Minimal sufficient power only
    #[default]
    Plain,
    /// Also charges faster while prices are below average
    Smart,
}

impl GoalStrategy {
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("smart") {
            GoalStrategy::Smart
        } else {
            GoalStrategy::Plain
        }
    }
}

/// User-supplied deadline parameters
#[derive(Debug, Clone, PartialEq)]
pub struct GoalRequest {
    pub battery_kwh: f64,
    pub soc_pct: f64,
    pub target_soc_pct: f64,
    pub deadline: DateTime<Utc>,
    pub strategy: GoalStrategy,
}

/// Current price against its rolling average
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceSignal {
    pub now: f64,
    pub average: f64,
}

/// Result of planning one goal for one cycle
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GoalPlan {
    pub energy_wh: f64,
    pub remaining_s: i64,
    pub required_w: f64,
    /// Upper bound the allocator applies to this connector's target
    pub desired_cap_w: f64,
    /// desired / max, in 0..=1
    pub urgency: f64,
    pub deadline: DateTime<Utc>,
    /// Smart strategy lifts a tariff-forced PV-only mode
    pub lifts_tariff_pv: bool,
    pub price_boosted: bool,
}

/// Plan a goal. Returns `None` when there is nothing left to charge.
pub fn plan_goal(
    request: &GoalRequest,
    now: DateTime<Utc>,
    min_w: f64,
    max_w: f64,
    price: Option<PriceSignal>,
    config: &GoalConfig,
) -> Option<GoalPlan> {
    if max_w <= 0.0 || request.battery_kwh <= 0.0 {
        return None;
    }
    let delta_pct = (request.target_soc_pct.min(100.0) - request.soc_pct.max(0.0)).max(0.0);
    let energy_wh = request.battery_kwh * 1000.0 * delta_pct / 100.0;
    if energy_wh <= 0.0 {
        return None;
    }

    let remaining_s = (request.deadline - now).num_seconds();
    let required_w = if remaining_s <= 0 {
        max_w
    } else {
        let hours = remaining_s as f64 / 3600.0;
        (energy_wh / hours).clamp(0.0, max_w)
    };

    let base_cap = required_w.max(min_w).min(max_w);
    let urgency = (base_cap / max_w).clamp(0.0, 1.0);

    let mut desired_cap_w = base_cap;
    let mut price_boosted = false;
    let mut lifts_tariff_pv = false;
    if request.strategy == GoalStrategy::Smart {
        if let Some(p) = price
            && p.now.is_finite()
            && p.average.is_finite()
            && p.now < p.average
        {
            desired_cap_w = (base_cap * config.smart_price_factor.max(1.0)).min(max_w);
            price_boosted = desired_cap_w > base_cap;
        }
        lifts_tariff_pv =
            remaining_s <= duration_s(config.lift_window_s).num_seconds() || urgency >= config.lift_urgency;
    }

    Some(GoalPlan {
        energy_wh,
        remaining_s,
        required_w,
        desired_cap_w,
        urgency,
        deadline: request.deadline,
        lifts_tariff_pv,
        price_boosted,
    })
}
