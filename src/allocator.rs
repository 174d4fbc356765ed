//! Power allocation
//!
//! Hands out power connector by connector in scheduler order, shrinking the
//! shared pools (total budget, station ceilings, PV surplus) as it goes.

use crate::budget::{BudgetResolution, BudgetSource};
use crate::mode::EffectiveMode;
use crate::model::{ConnectorSpec, ControlBasis, StationSpec};
use crate::reason::Reason;
use serde::Serialize;
use std::collections::HashMap;

/// Tolerance for watt comparisons
pub const EPSILON_W: f64 = 1.0;

/// Default current resolution when no step is configured
pub const DEFAULT_CURRENT_STEP_A: f64 = 0.01;

/// Default power resolution when no step is configured
pub const DEFAULT_POWER_STEP_W: f64 = 1.0;

/// Remaining shared budgets for the current cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pools {
    /// `None` means unbounded
    pub total_w: Option<f64>,
    pub stations: HashMap<String, f64>,
    pub pv_w: f64,
    /// Current left per grid phase (A), `None` without a phase cap
    pub phase_a: Option<[f64; 3]>,
}

/// Phases a connector may load: its wired phases, or any of them when unknown
fn loaded_phases(spec: &ConnectorSpec) -> Vec<usize> {
    spec.wired_phases().unwrap_or_else(|| vec![0, 1, 2])
}

impl Pools {
    pub fn new(
        total_w: Option<f64>,
        stations: &[StationSpec],
        pv_w: f64,
        phase_a: Option<[f64; 3]>,
    ) -> Self {
        Self {
            total_w: total_w.map(|w| w.max(0.0)),
            stations: stations
                .iter()
                .map(|s| (s.key.clone(), s.max_power_w.max(0.0)))
                .collect(),
            pv_w: pv_w.max(0.0),
            phase_a: phase_a.map(|p| p.map(|a| a.max(0.0))),
        }
    }

    pub fn station_w(&self, station: Option<&str>) -> Option<f64> {
        station.and_then(|s| self.stations.get(s).copied())
    }

    /// Most the connector may draw before one of its phases reaches the limit
    pub fn phase_room_w(&self, spec: &ConnectorSpec) -> Option<f64> {
        let headroom = self.phase_a?;
        let worst = loaded_phases(spec)
            .into_iter()
            .map(|i| headroom[i])
            .fold(f64::INFINITY, f64::min);
        Some(spec.capability.watts_for(worst.max(0.0)))
    }

    fn consume(&mut self, spec: &ConnectorSpec, mode: EffectiveMode, watts: f64) {
        if watts <= 0.0 {
            return;
        }
        if let Some(total) = self.total_w.as_mut() {
            *total = (*total - watts).max(0.0);
        }
        if let Some(s) = spec.station.as_deref()
            && let Some(pool) = self.stations.get_mut(s)
        {
            *pool = (*pool - watts).max(0.0);
        }
        if let Some(phases) = self.phase_a.as_mut() {
            let amps = spec.capability.amps_for(watts);
            for i in loaded_phases(spec) {
                phases[i] = (phases[i] - amps).max(0.0);
            }
        }
        let pv_used = match mode {
            EffectiveMode::PvOnly => watts,
            EffectiveMode::MinPlusPv => (watts - spec.capability.min_power_w).max(0.0),
            EffectiveMode::Normal | EffectiveMode::Boost => 0.0,
        };
        self.pv_w = (self.pv_w - pv_used).max(0.0);
    }
}

/// Per-connector inputs to one allocation step
#[derive(Debug, Clone, Copy)]
pub struct AllocationRequest<'a> {
    pub spec: &'a ConnectorSpec,
    pub mode: EffectiveMode,
    pub user_limit_w: Option<f64>,
    /// Active goal cap; only ever lowers the target
    pub goal_cap_w: Option<f64>,
    /// Last commanded power, the ramp reference
    pub previous_w: f64,
}

/// Final per-connector decision
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Allocation {
    pub key: String,
    pub target_power_w: f64,
    pub target_current_a: f64,
    pub reason: Reason,
    /// Pre-quantization target
    pub raw_w: f64,
    pub ramp_limited: bool,
}

impl Allocation {
    /// Zero command with a fixed reason
    pub fn zero(key: &str, reason: Reason) -> Self {
        Self {
            key: key.to_string(),
            target_power_w: 0.0,
            target_current_a: 0.0,
            reason,
            raw_w: 0.0,
            ramp_limited: false,
        }
    }
}

/// Floor `value` to a multiple of `step`, tolerating float noise
pub fn floor_to_step(value: f64, step: f64) -> f64 {
    if !(step.is_finite() && step > 0.0) {
        return value;
    }
    ((value / step) + 1e-9).floor() * step
}

/// Cap an increase to `previous + max_delta`; decreases pass through
pub fn ramp_limit(target_w: f64, previous_w: f64, max_delta_w: Option<f64>) -> f64 {
    match max_delta_w {
        Some(delta) if target_w > previous_w => target_w.min(previous_w.max(0.0) + delta),
        _ => target_w,
    }
}

/// Quantize a power target to the connector's control basis.
/// Returns `(watts, amps)`.
pub fn quantize(spec: &ConnectorSpec, watts: f64) -> (f64, f64) {
    let cap = &spec.capability;
    match cap.control_basis {
        ControlBasis::Current => {
            let amps = floor_to_step(cap.amps_for(watts), spec.step.unwrap_or(DEFAULT_CURRENT_STEP_A));
            (cap.watts_for(amps), amps)
        }
        ControlBasis::Power => {
            let w = floor_to_step(watts, spec.step.unwrap_or(DEFAULT_POWER_STEP_W));
            (w, cap.amps_for(w))
        }
        ControlBasis::None => (watts, cap.amps_for(watts)),
    }
}

/// A ceiling that may explain a limited outcome, in rule order
#[derive(Debug, Clone, Copy)]
struct Ceiling {
    reason: Reason,
    watts: f64,
}

/// One ordered rule list decides the reason for a connector.
///
/// `desired` is what the connector would take with no shared ceiling.
fn select_reason(
    final_w: f64,
    desired_w: f64,
    min_w: f64,
    ceilings: &[Ceiling],
    fallback_zero: Reason,
) -> Reason {
    if final_w > 0.0 {
        let bound = ceilings.iter().map(|c| c.watts).fold(f64::INFINITY, f64::min);
        return ceilings
            .iter()
            .filter(|c| c.reason != Reason::NoPvSurplus)
            .find(|c| c.watts + EPSILON_W < desired_w && c.watts <= bound + EPSILON_W)
            .map_or(Reason::Allocated, |c| c.reason);
    }
    // Zero: the first ceiling that left less than the technical minimum
    let floor = if min_w > 0.0 { min_w } else { EPSILON_W };
    ceilings
        .iter()
        .find(|c| c.watts + 1e-6 < floor)
        .map_or(fallback_zero, |c| c.reason)
}

/// Allocates one cycle's worth of connectors against shared pools
#[derive(Debug, Clone)]
pub struct PowerAllocator<'b> {
    pools: Pools,
    budget: &'b BudgetResolution,
}

impl<'b> PowerAllocator<'b> {
    pub fn new(budget: &'b BudgetResolution, stations: &[StationSpec], pv_cap_w: f64) -> Self {
        Self {
            pools: Pools::new(budget.total_w, stations, pv_cap_w, budget.phase_headroom_a),
            budget,
        }
    }

    pub fn pools(&self) -> &Pools {
        &self.pools
    }

    /// Whether the total pool has been used up
    pub fn budget_exhausted(&self) -> bool {
        self.pools.total_w.is_some_and(|t| t < EPSILON_W)
    }

    pub fn allocate(&mut self, req: &AllocationRequest<'_>) -> Allocation {
        let spec = req.spec;
        let cap = &spec.capability;
        if !cap.has_setpoint() {
            return Allocation::zero(&spec.key, Reason::NoSetpoint);
        }

        let min_w = cap.min_power_w;
        let user_limit = req.user_limit_w.filter(|l| l.is_finite()).map(|l| l.max(0.0));
        let eff_max = user_limit.map_or(cap.max_power_w, |l| cap.max_power_w.min(l));
        if eff_max + 1e-6 < min_w {
            return Allocation::zero(&spec.key, Reason::LimitedByUserLimit);
        }

        let station_pool = self.pools.station_w(spec.station.as_deref());
        let total_pool = self.pools.total_w;
        let phase_room = self.pools.phase_room_w(spec);
        let grid_room = [total_pool, station_pool, phase_room]
            .into_iter()
            .flatten()
            .fold(f64::INFINITY, f64::min);
        let pv = self.pools.pv_w;

        let mut raw = match req.mode {
            EffectiveMode::PvOnly => pv.min(grid_room).min(eff_max),
            EffectiveMode::MinPlusPv if min_w <= grid_room => (min_w + pv).min(grid_room).min(eff_max),
            EffectiveMode::MinPlusPv => 0.0,
            EffectiveMode::Normal | EffectiveMode::Boost => grid_room.min(eff_max),
        };
        if let Some(goal) = req.goal_cap_w {
            raw = raw.min(goal.max(0.0));
        }
        let raw = raw.max(0.0);

        let mut ramp_limited = false;
        let (final_w, final_a) = if raw + 1e-6 < min_w || raw <= 0.0 {
            (0.0, 0.0)
        } else {
            let ramped = ramp_limit(raw, req.previous_w, spec.max_delta_w);
            ramp_limited = ramped + 1e-6 < raw;
            let (w, a) = quantize(spec, ramped);
            if w + 1e-6 < min_w || w <= 0.0 {
                (0.0, 0.0)
            } else {
                (w, a)
            }
        };

        let ceilings = self.ceilings(req, station_pool, phase_room, user_limit, pv);
        let desired = req.goal_cap_w.map_or(cap.max_power_w, |g| cap.max_power_w.min(g));
        let zero_reason = match total_pool {
            Some(t) if t < EPSILON_W => Reason::NoBudget,
            _ => Reason::BelowMin,
        };
        let mut reason = select_reason(final_w, desired, min_w, &ceilings, zero_reason);
        if reason == Reason::Allocated
            && final_w + EPSILON_W >= cap.max_power_w
            && total_pool.is_none()
            && station_pool.is_none()
            && !req.mode.uses_pv_pool()
        {
            reason = Reason::Unlimited;
        }

        self.pools.consume(spec, req.mode, final_w);

        Allocation {
            key: spec.key.clone(),
            target_power_w: final_w,
            target_current_a: final_a,
            reason,
            raw_w: raw,
            ramp_limited,
        }
    }

    fn ceilings(
        &self,
        req: &AllocationRequest<'_>,
        station_pool: Option<f64>,
        phase_room: Option<f64>,
        user_limit: Option<f64>,
        pv: f64,
    ) -> Vec<Ceiling> {
        let min_w = req.spec.capability.min_power_w;
        let binding_total = |source: BudgetSource| {
            self.pools
                .total_w
                .filter(|_| self.budget.is_binding(source))
        };
        let mut out = Vec::with_capacity(6);
        if let Some(s) = station_pool {
            out.push(Ceiling {
                reason: Reason::LimitedByStationCap,
                watts: s,
            });
        }
        if let Some(total) = binding_total(BudgetSource::GridImport) {
            out.push(Ceiling {
                reason: Reason::LimitedByGridImport,
                watts: total,
            });
        }
        let phase = match (phase_room, binding_total(BudgetSource::PhaseCurrent)) {
            (Some(room), Some(total)) => Some(room.min(total)),
            (room, total) => room.or(total),
        };
        if let Some(watts) = phase {
            out.push(Ceiling {
                reason: Reason::LimitedByPhaseCap,
                watts,
            });
        }
        if let Some(limit) = user_limit {
            out.push(Ceiling {
                reason: Reason::LimitedByUserLimit,
                watts: limit,
            });
        }
        if let Some(total) = binding_total(BudgetSource::RegulatoryCap) {
            out.push(Ceiling {
                reason: Reason::LimitedBy14a,
                watts: total,
            });
        }
        match req.mode {
            EffectiveMode::PvOnly => out.push(Ceiling {
                reason: Reason::NoPvSurplus,
                watts: pv,
            }),
            EffectiveMode::MinPlusPv => out.push(Ceiling {
                reason: Reason::NoPvSurplus,
                watts: min_w + pv,
            }),
            EffectiveMode::Normal | EffectiveMode::Boost => {}
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{HardCapInputs, SoftBudgetInputs, StorageAssist, resolve_budget};
    use crate::model::{Capability, ChargerKind};

    fn power_spec(key: &str, min_w: f64, max_w: f64) -> ConnectorSpec {
        ConnectorSpec {
            key: key.to_string(),
            name: key.to_string(),
            capability: Capability {
                kind: ChargerKind::Ac,
                phases: 3,
                voltage_v: 230.0,
                min_current_a: min_w / 690.0,
                max_current_a: max_w / 690.0,
                min_power_w: min_w,
                max_power_w: max_w,
                control_basis: ControlBasis::Power,
            },
            priority: 100,
            allow_boost: true,
            installer_enabled: true,
            station: None,
            grid_phase: None,
            connector_no: None,
            step: None,
            max_delta_w: None,
            boost_timeout_s: None,
            config_order: 0,
        }
    }

    fn current_spec(key: &str, min_a: f64, max_a: f64) -> ConnectorSpec {
        let mut s = power_spec(key, min_a * 690.0, max_a * 690.0);
        s.capability.control_basis = ControlBasis::Current;
        s.capability.min_current_a = min_a;
        s.capability.max_current_a = max_a;
        s
    }

    fn station(key: &str, max_w: f64) -> StationSpec {
        StationSpec {
            key: key.to_string(),
            max_power_w: max_w,
            members: vec![],
        }
    }

    fn request(spec: &ConnectorSpec, mode: EffectiveMode) -> AllocationRequest<'_> {
        AllocationRequest {
            spec,
            mode,
            user_limit_w: None,
            goal_cap_w: None,
            previous_w: 0.0,
        }
    }

    fn soft_static(w: f64) -> BudgetResolution {
        resolve_budget(
            &SoftBudgetInputs {
                static_w: Some(w),
                ..Default::default()
            },
            &HardCapInputs::default(),
            &StorageAssist::default(),
        )
    }

    #[test]
    fn boost_takes_station_and_neighbour_is_station_limited() {
        let mut a = power_spec("a", 4140.0, 11000.0);
        a.station = Some("st".into());
        let mut b = power_spec("b", 4140.0, 11000.0);
        b.station = Some("st".into());
        let budget = BudgetResolution::unbounded();
        let stations = [station("st", 11000.0)];
        let mut alloc = PowerAllocator::new(&budget, &stations, 0.0);

        let ra = alloc.allocate(&AllocationRequest {
            previous_w: 11000.0,
            ..request(&a, EffectiveMode::Boost)
        });
        let rb = alloc.allocate(&AllocationRequest {
            previous_w: 5000.0,
            ..request(&b, EffectiveMode::Normal)
        });
        assert_eq!(ra.target_power_w, 11000.0);
        assert_eq!(ra.reason, Reason::Allocated);
        assert_eq!(rb.target_power_w, 0.0);
        assert_eq!(rb.reason, Reason::LimitedByStationCap);
    }

    #[test]
    fn pv_only_below_minimum_is_no_pv_surplus() {
        let spec = power_spec("a", 4200.0, 7400.0);
        let budget = BudgetResolution::unbounded();
        let mut alloc = PowerAllocator::new(&budget, &[], 3000.0);
        let r = alloc.allocate(&request(&spec, EffectiveMode::PvOnly));
        assert_eq!(r.target_power_w, 0.0);
        assert_eq!(r.reason, Reason::NoPvSurplus);
        assert_eq!(alloc.pools().pv_w, 3000.0);
    }

    #[test]
    fn min_plus_pv_sources_excess_from_pv() {
        let spec = power_spec("a", 4200.0, 11000.0);
        let budget = soft_static(20000.0);
        let mut alloc = PowerAllocator::new(&budget, &[], 1000.0);
        let r = alloc.allocate(&request(&spec, EffectiveMode::MinPlusPv));
        assert_eq!(r.target_power_w, 5200.0);
        assert_eq!(r.reason, Reason::Allocated);
        assert_eq!(alloc.pools().pv_w, 0.0);
        assert_eq!(alloc.pools().total_w, Some(14800.0));
    }

    #[test]
    fn ramp_caps_increase_but_not_decrease() {
        let mut spec = power_spec("a", 4200.0, 11000.0);
        spec.max_delta_w = Some(5000.0);
        let budget = BudgetResolution::unbounded();
        let mut alloc = PowerAllocator::new(&budget, &[], 0.0);
        let r = alloc.allocate(&request(&spec, EffectiveMode::Normal));
        assert_eq!(r.target_power_w, 5000.0);
        assert!(r.ramp_limited);

        let budget = soft_static(4500.0);
        let mut alloc = PowerAllocator::new(&budget, &[], 0.0);
        let r = alloc.allocate(&AllocationRequest {
            previous_w: 11000.0,
            ..request(&spec, EffectiveMode::Normal)
        });
        assert_eq!(r.target_power_w, 4500.0);
    }

    #[test]
    fn current_basis_floors_to_step_and_rechecks_minimum() {
        let mut spec = current_spec("a", 6.0, 16.0);
        spec.step = Some(1.0);
        let budget = soft_static(5000.0);
        let mut alloc = PowerAllocator::new(&budget, &[], 0.0);
        let r = alloc.allocate(&request(&spec, EffectiveMode::Normal));
        // 5000 W / 690 = 7.24 A -> 7 A
        assert_eq!(r.target_current_a, 7.0);
        assert!((r.target_power_w - 4830.0).abs() < 1e-6);

        let budget = soft_static(4100.0);
        let mut alloc = PowerAllocator::new(&budget, &[], 0.0);
        let r = alloc.allocate(&request(&spec, EffectiveMode::Normal));
        assert_eq!(r.target_power_w, 0.0);
        assert_eq!(r.reason, Reason::BelowMin);
    }

    #[test]
    fn grid_import_cap_is_attributed_over_soft_budget() {
        let spec = power_spec("a", 4140.0, 11000.0);
        let budget = resolve_budget(
            &SoftBudgetInputs {
                static_w: Some(20000.0),
                ..Default::default()
            },
            &HardCapInputs {
                grid_power_w: 10000.0,
                grid_import_limit_w: Some(16000.0),
                ..Default::default()
            },
            &StorageAssist::default(),
        );
        let mut alloc = PowerAllocator::new(&budget, &[], 0.0);
        let r = alloc.allocate(&AllocationRequest {
            previous_w: 0.0,
            ..request(&spec, EffectiveMode::Boost)
        });
        assert_eq!(r.target_power_w, 6000.0);
        assert_eq!(r.reason, Reason::LimitedByGridImport);
    }

    #[test]
    fn user_limit_below_minimum_makes_connector_inactive() {
        let spec = power_spec("a", 4140.0, 11000.0);
        let budget = BudgetResolution::unbounded();
        let mut alloc = PowerAllocator::new(&budget, &[], 0.0);
        let r = alloc.allocate(&AllocationRequest {
            user_limit_w: Some(3000.0),
            ..request(&spec, EffectiveMode::Normal)
        });
        assert_eq!(r.target_power_w, 0.0);
        assert_eq!(r.reason, Reason::LimitedByUserLimit);

        let r = alloc.allocate(&AllocationRequest {
            user_limit_w: Some(7000.0),
            ..request(&spec, EffectiveMode::Normal)
        });
        assert_eq!(r.target_power_w, 7000.0);
        assert_eq!(r.reason, Reason::LimitedByUserLimit);
    }

    #[test]
    fn unlimited_only_without_any_ceiling() {
        let spec = power_spec("a", 4140.0, 11000.0);
        let budget = BudgetResolution::unbounded();
        let mut alloc = PowerAllocator::new(&budget, &[], 0.0);
        let r = alloc.allocate(&request(&spec, EffectiveMode::Normal));
        assert_eq!(r.target_power_w, 11000.0);
        assert_eq!(r.reason, Reason::Unlimited);

        let budget = soft_static(30000.0);
        let mut alloc = PowerAllocator::new(&budget, &[], 0.0);
        let r = alloc.allocate(&request(&spec, EffectiveMode::Normal));
        assert_eq!(r.reason, Reason::Allocated);
    }

    #[test]
    fn exhausted_budget_gives_no_budget() {
        let a = power_spec("a", 4140.0, 11000.0);
        let b = power_spec("b", 4140.0, 11000.0);
        let budget = soft_static(11000.0);
        let mut alloc = PowerAllocator::new(&budget, &[], 0.0);
        alloc.allocate(&request(&a, EffectiveMode::Normal));
        assert!(alloc.budget_exhausted());
        let r = alloc.allocate(&request(&b, EffectiveMode::Normal));
        assert_eq!(r.target_power_w, 0.0);
        assert_eq!(r.reason, Reason::NoBudget);
    }

    #[test]
    fn goal_cap_only_lowers() {
        let spec = power_spec("a", 4140.0, 11000.0);
        let budget = soft_static(6000.0);
        let mut alloc = PowerAllocator::new(&budget, &[], 0.0);
        let r = alloc.allocate(&AllocationRequest {
            goal_cap_w: Some(9000.0),
            ..request(&spec, EffectiveMode::Normal)
        });
        assert_eq!(r.target_power_w, 6000.0);

        let budget = BudgetResolution::unbounded();
        let mut alloc = PowerAllocator::new(&budget, &[], 0.0);
        let r = alloc.allocate(&AllocationRequest {
            goal_cap_w: Some(5000.0),
            ..request(&spec, EffectiveMode::Normal)
        });
        assert_eq!(r.target_power_w, 5000.0);
    }

    #[test]
    fn no_setpoint_connector_draws_nothing_from_pools() {
        let mut spec = power_spec("a", 0.0, 3680.0);
        spec.capability.control_basis = ControlBasis::None;
        let budget = soft_static(5000.0);
        let mut alloc = PowerAllocator::new(&budget, &[], 0.0);
        let r = alloc.allocate(&request(&spec, EffectiveMode::Normal));
        assert_eq!(r.reason, Reason::NoSetpoint);
        assert_eq!(alloc.pools().total_w, Some(5000.0));
    }

    #[test]
    fn single_phase_connector_is_bounded_by_its_phase() {
        let single = |key: &str, grid_phase| {
            let mut spec = current_spec(key, 6.0, 32.0);
            spec.capability.phases = 1;
            spec.capability.min_power_w = 6.0 * 230.0;
            spec.capability.max_power_w = 32.0 * 230.0;
            spec.grid_phase = grid_phase;
            spec
        };
        let budget = resolve_budget(
            &SoftBudgetInputs::default(),
            &HardCapInputs {
                phase_currents_a: Some([15.0, 0.0, 0.0]),
                phase_limit_a: Some(25.0),
                voltage_v: 230.0,
                ..Default::default()
            },
            &StorageAssist::default(),
        );
        let mut alloc = PowerAllocator::new(&budget, &[], 0.0);

        // Unknown wiring: bounded by the most loaded phase, charged to all of them
        let a = single("a", None);
        let r = alloc.allocate(&request(&a, EffectiveMode::Normal));
        assert!((r.target_current_a - 10.0).abs() < 1e-9);
        assert!((r.target_power_w - 2300.0).abs() < 1e-6);
        assert_eq!(r.reason, Reason::LimitedByPhaseCap);
        let left = alloc.pools().phase_a.unwrap();
        assert!(left[0].abs() < 1e-9 && (left[1] - 15.0).abs() < 1e-9);

        // Wired to L2: only L2 headroom counts
        let b = single("b", Some(2));
        let r = alloc.allocate(&request(&b, EffectiveMode::Normal));
        assert!((r.target_current_a - 15.0).abs() < 1e-9);
        assert_eq!(r.reason, Reason::LimitedByPhaseCap);

        // L1 is exhausted
        let c = single("c", Some(1));
        let r = alloc.allocate(&request(&c, EffectiveMode::Normal));
        assert_eq!(r.target_power_w, 0.0);
        assert_eq!(r.reason, Reason::LimitedByPhaseCap);
    }

    #[test]
    fn station_sum_never_exceeds_cap() {
        let specs: Vec<ConnectorSpec> = (0..4)
            .map(|i| {
                let mut s = current_spec(&format!("c{}", i), 6.0, 16.0);
                s.station = Some("st".into());
                s
            })
            .collect();
        let budget = BudgetResolution::unbounded();
        let stations = [station("st", 15000.0)];
        let mut alloc = PowerAllocator::new(&budget, &stations, 0.0);
        let sum: f64 = specs
            .iter()
            .map(|s| alloc.allocate(&request(s, EffectiveMode::Normal)).target_power_w)
            .sum();
        assert!(sum <= 15000.0 + EPSILON_W);
    }
}
