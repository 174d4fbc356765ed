//! Per-cycle diagnostics
//!
//! A [`CycleReport`] is the serialisable view of one cycle. The controller
//! publishes it on a watch channel and mirrors a flat subset into the
//! registry under the configured prefix.

use crate::apply::{ApplyResult, ApplyStatus};
use crate::engine::CycleOutcome;
use crate::error::Result;
use crate::inputs::MappingHealth;
use crate::reason::Reason;
use crate::registry::{DatapointRegistry, DatapointValue};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapReport {
    pub name: String,
    pub watts: f64,
    pub binding: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PvReport {
    pub available: bool,
    pub raw_w: f64,
    pub smoothed_w: f64,
    pub cap_w: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectorReport {
    pub key: String,
    pub target_power_w: f64,
    pub target_current_a: f64,
    pub actual_power_w: Option<f64>,
    pub mode: Option<String>,
    pub requested_mode: String,
    pub reason: Reason,
    pub enabled: bool,
    pub online: bool,
    pub in_session: bool,
    pub session_start: Option<DateTime<Utc>>,
    pub boost_since: Option<DateTime<Utc>>,
    pub boost_remaining_s: Option<i64>,
    pub boost_expired: bool,
    pub goal_required_w: Option<f64>,
    pub goal_cap_w: Option<f64>,
    pub goal_deadline: Option<DateTime<Utc>>,
    pub goal_urgency: Option<f64>,
    pub ramp_limited: bool,
    pub mapping: MappingHealth,
    pub apply_status: Option<ApplyStatus>,
    pub apply_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub failsafe: bool,
    pub budget_mode: String,
    pub budget_w: Option<f64>,
    pub used_w: f64,
    pub remaining_w: Option<f64>,
    pub storage_assist_w: f64,
    pub caps: Vec<CapReport>,
    pub pv: PvReport,
    pub tariff_grid_charge_allowed: bool,
    pub tariff_discharge_allowed: bool,
    pub storage_gate_open: bool,
    pub order: Vec<String>,
    pub connectors: Vec<ConnectorReport>,
}

impl CycleReport {
    pub fn from_outcome(outcome: &CycleOutcome) -> Self {
        let connectors = outcome
            .connectors
            .iter()
            .map(|c| ConnectorReport {
                key: c.key.clone(),
                target_power_w: c.allocation.target_power_w,
                target_current_a: c.allocation.target_current_a,
                actual_power_w: c.measured_power_w,
                mode: c.mode.map(|m| m.as_str().to_string()),
                requested_mode: c.requested_mode.as_str().to_string(),
                reason: c.allocation.reason,
                enabled: c.enabled,
                online: c.online,
                in_session: c.session.in_session,
                session_start: c.session.session_start,
                boost_since: c.session.boost_since,
                boost_remaining_s: c.session.boost_remaining_s,
                boost_expired: c.session.boost_expired,
                goal_required_w: c.goal.map(|g| g.required_w),
                goal_cap_w: c.goal.map(|g| g.desired_cap_w),
                goal_deadline: c.goal.map(|g| g.deadline),
                goal_urgency: c.goal.map(|g| g.urgency),
                ramp_limited: c.allocation.ramp_limited,
                mapping: c.mapping,
                apply_status: None,
                apply_error: None,
            })
            .collect();

        Self {
            cycle: outcome.cycle,
            timestamp: outcome.timestamp,
            status: outcome.status.clone(),
            failsafe: outcome.failsafe,
            budget_mode: outcome.budget_mode.clone(),
            budget_w: outcome.budget.total_w,
            used_w: outcome.used_w,
            remaining_w: outcome.remaining_w,
            storage_assist_w: outcome.budget.assist_w,
            caps: outcome
                .budget
                .components
                .iter()
                .map(|c| CapReport {
                    name: c.source.as_str().to_string(),
                    watts: c.watts,
                    binding: c.binding,
                })
                .collect(),
            pv: PvReport {
                available: outcome.pv.available,
                raw_w: outcome.pv.raw_w,
                smoothed_w: outcome.pv.smoothed_w,
                cap_w: outcome.pv.cap_w,
            },
            tariff_grid_charge_allowed: outcome.tariff_grid_charge_allowed,
            tariff_discharge_allowed: outcome.tariff_discharge_allowed,
            storage_gate_open: outcome.storage_gate_open,
            order: outcome.order.clone(),
            connectors,
        }
    }

    pub fn connector(&self, key: &str) -> Option<&ConnectorReport> {
        self.connectors.iter().find(|c| c.key == key)
    }

    pub fn record_apply(&mut self, key: &str, result: &ApplyResult) {
        if let Some(c) = self.connectors.iter_mut().find(|c| c.key == key) {
            c.apply_status = Some(result.status);
            c.apply_error = result.error.clone();
        }
    }

    /// Mark a connector whose write failed during flush
    pub fn record_write_failure(&mut self, key: &str, error: &str) {
        if let Some(c) = self.connectors.iter_mut().find(|c| c.key == key) {
            c.apply_status = Some(ApplyStatus::Failed);
            c.apply_error = Some(error.to_string());
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Flat `id -> value` view mirrored into the registry
    pub fn registry_entries(&self, prefix: &str) -> Vec<(String, DatapointValue)> {
        let id = |suffix: &str| format!("{}.{}", prefix, suffix);
        let mut out: Vec<(String, DatapointValue)> = vec![
            (id("cycle"), DatapointValue::Number(self.cycle as f64)),
            (id("status"), DatapointValue::Text(self.status.clone())),
            (id("budget.mode"), DatapointValue::Text(self.budget_mode.clone())),
            (id("budget.used_w"), DatapointValue::Number(self.used_w)),
            (id("pv.available"), DatapointValue::Bool(self.pv.available)),
            (id("pv.raw_w"), DatapointValue::Number(self.pv.raw_w)),
            (id("pv.smoothed_w"), DatapointValue::Number(self.pv.smoothed_w)),
            (id("pv.cap_w"), DatapointValue::Number(self.pv.cap_w)),
        ];
        if let Some(total) = self.budget_w {
            out.push((id("budget.total_w"), DatapointValue::Number(total)));
        }
        if let Some(remaining) = self.remaining_w {
            out.push((id("budget.remaining_w"), DatapointValue::Number(remaining)));
        }
        for cap in &self.caps {
            out.push((
                id(&format!("budget.binding.{}", cap.name)),
                DatapointValue::Bool(cap.binding),
            ));
        }

        for c in &self.connectors {
            let cid = |suffix: &str| id(&format!("connectors.{}.{}", c.key, suffix));
            out.push((cid("target_w"), DatapointValue::Number(c.target_power_w)));
            out.push((cid("target_a"), DatapointValue::Number(c.target_current_a)));
            out.push((cid("reason"), DatapointValue::Text(c.reason.as_str().to_string())));
            if let Some(mode) = &c.mode {
                out.push((cid("mode"), DatapointValue::Text(mode.clone())));
            }
            if let Some(actual) = c.actual_power_w {
                out.push((cid("actual_w"), DatapointValue::Number(actual)));
            }
            if let Some(status) = c.apply_status {
                out.push((cid("apply_status"), DatapointValue::Text(status.as_str().to_string())));
            }
            if let Some(remaining) = c.boost_remaining_s {
                out.push((cid("boost_remaining_s"), DatapointValue::Number(remaining as f64)));
            }
            if let Some(required) = c.goal_required_w {
                out.push((cid("goal_required_w"), DatapointValue::Number(required)));
            }
            out.push((
                cid("mapping_ok"),
                DatapointValue::Bool(c.mapping.power && c.mapping.setpoint),
            ));
        }
        out
    }
}

/// Mirror a report into the registry. Returns the number of failed writes.
pub async fn publish_to_registry(
    registry: &dyn DatapointRegistry,
    report: &CycleReport,
    prefix: &str,
) -> usize {
    let mut failed = 0;
    for (id, value) in report.registry_entries(prefix) {
        if registry.write(&id, value).await.is_err() {
            failed += 1;
        }
    }
    failed
}
