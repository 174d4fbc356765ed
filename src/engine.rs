//! Allocation engine
//!
//! One [`AllocationEngine::step`] is one control cycle: update PV and tariff
//! state, resolve modes and sessions, resolve the budget and hard caps, order
//! the connectors and allocate. The engine is pure with respect to I/O; it
//! consumes [`CycleInputs`] and returns a [`CycleOutcome`].

use crate::allocator::{Allocation, AllocationRequest, EPSILON_W, PowerAllocator};
use crate::apply::Setpoint;
use crate::budget::{
    BudgetResolution, HardCapInputs, SoftBudgetInputs, StorageAssist, StorageGate, resolve_budget,
};
use crate::config::{Config, duration_s};
use crate::error::Result;
use crate::goal::{GoalPlan, plan_goal};
use crate::inputs::{ConnectorInput, CycleInputs, MappingHealth};
use crate::logging::get_logger;
use crate::mode::{EffectiveMode, ModeContext, resolve_mode};
use crate::model::{ConnectorSpec, StationSpec, UserMode};
use crate::pv::{PvEstimator, PvReading, surplus_without_ev};
use crate::reason::Reason;
use crate::scheduler::{GoalRank, PriorityScheduler, ScheduleEntry};
use crate::session::{SessionObservation, SessionTracker, SessionView};
use crate::tariff::TariffPermissions;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

pub const STATUS_OK: &str = "ok";
pub const STATUS_FAILSAFE: &str = "failsafe_stale_meter";
pub const STATUS_PEAK_ZERO: &str = "paused_by_peak_shaving_zero";
pub const STATUS_PEAK_BUDGET: &str = "paused_by_peak_shaving_budget";
pub const STATUS_PEAK_HARD_CAP: &str = "paused_by_peak_shaving_hard_cap";

/// Cross-cycle state, owned exclusively by the engine
#[derive(Debug, Clone)]
pub struct EngineState {
    pub cycle: u64,
    pub pv: PvEstimator,
    pub tariff: TariffPermissions,
    pub sessions: SessionTracker,
    pub scheduler: PriorityScheduler,
    pub storage_gate: StorageGate,
    /// Connectors we sent an explicit disable to
    pub disabled_by_user: HashSet<String>,
    pub last_status: String,
}

impl EngineState {
    fn new(config: &Config) -> Self {
        Self {
            cycle: 0,
            pv: PvEstimator::new(config.pv.clone()),
            tariff: TariffPermissions::default(),
            sessions: SessionTracker::new(config.session.clone()),
            scheduler: PriorityScheduler::new(duration_s(config.scheduler.rotation_interval_s)),
            storage_gate: StorageGate::default(),
            disabled_by_user: HashSet::new(),
            last_status: String::new(),
        }
    }
}

/// Per-connector result of one cycle
#[derive(Debug, Clone, Serialize)]
pub struct ConnectorOutcome {
    pub key: String,
    pub allocation: Allocation,
    /// `None` means no apply call this cycle
    pub setpoint: Option<Setpoint>,
    pub mode: Option<EffectiveMode>,
    pub requested_mode: UserMode,
    pub enabled: bool,
    pub online: bool,
    pub measured_power_w: Option<f64>,
    pub session: SessionView,
    pub goal: Option<GoalPlan>,
    pub mapping: MappingHealth,
}

/// Result of one engine step
#[derive(Debug, Clone, Serialize)]
pub struct CycleOutcome {
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub failsafe: bool,
    pub budget: BudgetResolution,
    pub budget_mode: String,
    pub used_w: f64,
    pub remaining_w: Option<f64>,
    pub pv: PvReading,
    pub tariff_grid_charge_allowed: bool,
    pub tariff_discharge_allowed: bool,
    pub storage_gate_open: bool,
    /// Allocation order of this cycle
    pub order: Vec<String>,
    pub connectors: Vec<ConnectorOutcome>,
}

impl CycleOutcome {
    pub fn connector(&self, key: &str) -> Option<&ConnectorOutcome> {
        self.connectors.iter().find(|c| c.key == key)
    }
}

/// Static per-connector facts of this cycle, before allocation
struct Prepared<'a> {
    spec: ConnectorSpec,
    input: Option<&'a ConnectorInput>,
    enabled: bool,
    user_disabled: bool,
    online: bool,
    power_fresh: Option<f64>,
    requested: UserMode,
    session: SessionView,
}

pub struct AllocationEngine {
    config: Config,
    specs: Vec<ConnectorSpec>,
    stations: Vec<StationSpec>,
    state: EngineState,
    logger: crate::logging::StructuredLogger,
}

impl AllocationEngine {
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let specs = config.connector_specs()?;
        let stations = config.station_specs(&specs)?;
        Ok(Self {
            config: config.clone(),
            specs,
            stations,
            state: EngineState::new(config),
            logger: get_logger("engine"),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn specs(&self) -> &[ConnectorSpec] {
        &self.specs
    }

    pub fn stations(&self) -> &[StationSpec] {
        &self.stations
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Run one control cycle
    pub fn step(&mut self, inputs: &CycleInputs, now: DateTime<Utc>) -> CycleOutcome {
        self.state.cycle += 1;
        let cycle = self.state.cycle;
        let stale = duration_s(self.config.safety.stale_timeout_s);
        let plant = &inputs.plant;

        let hold = duration_s(self.config.tariff.hold_s);
        let (grid_charge_allowed, discharge_allowed) = self.state.tariff.update(
            plant.grid_charge_allowed,
            plant.discharge_allowed,
            now,
            hold,
        );

        let prepared = self.prepare(inputs, now);

        // Safety-relevant inputs
        let grid = plant.grid_power_w.and_then(|r| r.fresh(stale));
        let phases = plant.phase_currents_a.and_then(|r| r.fresh(stale));
        let external = plant.external_budget_w.and_then(|r| r.fresh(stale));
        let mut stale_inputs = Vec::new();
        if grid.is_none() {
            stale_inputs.push("grid power");
        }
        if self.config.safety.phase_current_limit_a.is_some() && phases.is_none() {
            stale_inputs.push("phase currents");
        }
        if self.config.budget.use_external && external.is_none() {
            stale_inputs.push("external budget");
        }

        let outcome = match grid {
            Some(grid_w) if stale_inputs.is_empty() => {
                self.allocate_cycle(inputs, &prepared, grid_w, phases, external, now)
            }
            _ => {
                if self.state.last_status != STATUS_FAILSAFE {
                    self.logger.warn(&format!(
                        "Failsafe: stale or missing {}; commanding all connectors to zero",
                        stale_inputs.join(", ")
                    ));
                }
                self.failsafe_cycle(&prepared, now)
            }
        };

        let configured: HashSet<&str> = self.specs.iter().map(|s| s.key.as_str()).collect();
        self.state.sessions.prune(&configured, now);

        if outcome.status != self.state.last_status {
            self.logger.info(&format!(
                "Cycle {} status {} (budget {})",
                cycle, outcome.status, outcome.budget_mode
            ));
            self.state.last_status = outcome.status.clone();
        }

        CycleOutcome {
            cycle,
            timestamp: now,
            tariff_grid_charge_allowed: grid_charge_allowed,
            tariff_discharge_allowed: discharge_allowed,
            storage_gate_open: self.state.storage_gate.is_open(),
            ..outcome
        }
    }

    fn prepare<'a>(&mut self, inputs: &'a CycleInputs, now: DateTime<Utc>) -> Vec<Prepared<'a>> {
        let meter_stale = duration_s(self.config.session.meter_stale_s);
        let global_pv_only = inputs.plant.global_pv_only.unwrap_or(false);
        let mut out = Vec::with_capacity(self.specs.len());

        for spec in &self.specs {
            let input = inputs.connector(&spec.key);
            let user_enabled = input.and_then(|i| i.user_enabled).unwrap_or(true);
            // Our own disable reads back on the device flag until re-enabled
            let reenabling = user_enabled && self.state.disabled_by_user.contains(&spec.key);
            let device_enabled =
                reenabling || input.and_then(|i| i.device_enabled).unwrap_or(true);
            let enabled = spec.installer_enabled && user_enabled && device_enabled;
            let online = input.is_none_or(ConnectorInput::online);
            let power_fresh = input
                .and_then(|i| i.power_w)
                .and_then(|r| r.fresh(meter_stale));
            let requested = input.and_then(|i| i.mode).unwrap_or_default();

            let boost_timeout_s = spec
                .boost_timeout_s
                .unwrap_or(self.config.session.boost_timeout_s);
            let obs = SessionObservation {
                enabled,
                online,
                power_w: power_fresh,
                boost_requested: requested == UserMode::Boost && spec.allow_boost && !global_pv_only,
                boost_timeout: duration_s(boost_timeout_s),
                restored_charging_since: input.and_then(|i| i.restored_charging_since),
                restored_boost_since: input.and_then(|i| i.restored_boost_since),
            };
            let session = self.state.sessions.observe(&spec.key, &obs, now);

            out.push(Prepared {
                spec: spec.clone(),
                input,
                enabled,
                user_disabled: spec.installer_enabled && !user_enabled,
                online,
                power_fresh,
                requested,
                session,
            });
        }
        out
    }

    /// Zero command for a connector that does not take part in allocation
    fn inactive_outcome(&mut self, p: &Prepared<'_>, reason: Reason) -> ConnectorOutcome {
        let cap = &p.spec.capability;
        let setpoint = if cap.has_setpoint() {
            let enable = if p.user_disabled {
                self.state.disabled_by_user.insert(p.spec.key.clone());
                Some(false)
            } else if self.state.disabled_by_user.remove(&p.spec.key) {
                Some(true)
            } else {
                None
            };
            Some(Setpoint {
                target_power_w: 0.0,
                target_current_a: 0.0,
                control_basis: cap.control_basis,
                enable,
            })
        } else {
            None
        };
        let reason = if cap.has_setpoint() {
            reason
        } else {
            Reason::NoSetpoint
        };
        self.state.sessions.record_command(&p.spec.key, 0.0, 0.0, None);
        ConnectorOutcome {
            key: p.spec.key.clone(),
            allocation: Allocation::zero(&p.spec.key, reason),
            setpoint,
            mode: None,
            requested_mode: p.requested,
            enabled: p.enabled,
            online: p.online,
            measured_power_w: p.power_fresh,
            session: p.session,
            goal: None,
            mapping: p.input.map(|i| i.mapping).unwrap_or_default(),
        }
    }

    fn failsafe_cycle(&mut self, prepared: &[Prepared<'_>], now: DateTime<Utc>) -> CycleOutcome {
        let mut connectors = Vec::with_capacity(prepared.len());
        for p in prepared {
            let reason = if !p.enabled {
                Reason::Disabled
            } else if !p.online {
                Reason::Offline
            } else {
                Reason::StaleMeter
            };
            connectors.push(self.inactive_outcome(p, reason));
        }
        CycleOutcome {
            cycle: self.state.cycle,
            timestamp: now,
            status: STATUS_FAILSAFE.to_string(),
            failsafe: true,
            budget: BudgetResolution {
                total_w: Some(0.0),
                ..BudgetResolution::unbounded()
            },
            budget_mode: "failsafe".to_string(),
            used_w: 0.0,
            remaining_w: Some(0.0),
            pv: self.state.pv.last_reading(),
            tariff_grid_charge_allowed: true,
            tariff_discharge_allowed: true,
            storage_gate_open: false,
            order: Vec::new(),
            connectors,
        }
    }

    fn allocate_cycle(
        &mut self,
        inputs: &CycleInputs,
        prepared: &[Prepared<'_>],
        grid_w: f64,
        phases: Option<[f64; 3]>,
        external: Option<f64>,
        now: DateTime<Utc>,
    ) -> CycleOutcome {
        let plant = &inputs.plant;
        let stale = duration_s(self.config.safety.stale_timeout_s);
        let voltage = self.config.safety.nominal_voltage_v;

        // Modelled EV load: fresh meter, else last command
        let mut ev_load_w = 0.0;
        let mut ev_phases = [0.0; 3];
        for p in prepared {
            let measured = p
                .power_fresh
                .unwrap_or_else(|| self.state.sessions.last_commanded_w(&p.spec.key))
                .max(0.0);
            ev_load_w += measured;
            let phase_reading = p
                .input
                .and_then(|i| i.phase_currents_a)
                .and_then(|r| r.fresh(stale));
            match phase_reading {
                Some(a) => (0..3).for_each(|i| ev_phases[i] += a[i].max(0.0)),
                None => {
                    let n = usize::from(p.spec.capability.phases.clamp(1, 3));
                    let per_phase = measured / (voltage * n as f64);
                    let wired = p.spec.wired_phases().unwrap_or_else(|| (0..n).collect());
                    wired.into_iter().for_each(|i| ev_phases[i] += per_phase);
                }
            }
        }

        // PV surplus estimation, every cycle
        let raw_surplus = plant
            .pv_surplus_w
            .and_then(|r| r.fresh(stale))
            .unwrap_or_else(|| surplus_without_ev(grid_w, ev_load_w));
        let pv = self.state.pv.update(now, raw_surplus, grid_w);

        // Effective modes and goal plans
        let global_pv_only = plant.global_pv_only.unwrap_or(false);
        let tariff_forces_pv = self.state.tariff.forces_pv();
        let mut modes: HashMap<&str, EffectiveMode> = HashMap::new();
        let mut plans: HashMap<&str, GoalPlan> = HashMap::new();
        for p in prepared.iter().filter(|p| p.enabled && p.online) {
            let cap = &p.spec.capability;
            let plan = p.input.and_then(|i| i.goal.as_ref()).and_then(|req| {
                plan_goal(
                    req,
                    now,
                    cap.min_power_w,
                    cap.max_power_w,
                    plant.price,
                    &self.config.goal,
                )
            });
            let lifts = plan.is_some_and(|g| g.lifts_tariff_pv);
            let ctx = ModeContext {
                allow_boost: p.spec.allow_boost,
                boost_expired: p.session.boost_expired,
                global_pv_only,
                tariff_forced_pv: tariff_forces_pv && !lifts,
            };
            modes.insert(p.spec.key.as_str(), resolve_mode(p.requested, &ctx));
            if let Some(plan) = plan {
                plans.insert(p.spec.key.as_str(), plan);
            }
        }
        let any_boosting = modes.values().any(|m| *m == EffectiveMode::Boost);

        // Soft budget
        let peak_active = plant.peak_shaving_active.unwrap_or(false);
        let peak_budget = plant.peak_budget_w.and_then(|r| r.fresh(stale));
        let follow = self.config.budget.peak_shaving.follow_peak_budget;
        let grid_side_cap = self.config.safety.grid_import_limit_w.is_some()
            || self.config.safety.phase_current_limit_a.is_some();
        let (peak_shaving_w, peak_status) = match (peak_active, follow, peak_budget) {
            (false, _, _) => (None, None),
            (true, true, Some(b)) => (Some(b), Some(STATUS_PEAK_BUDGET)),
            // Stale peak budget: the grid-side caps govern, else pause
            (true, true, None) if grid_side_cap => (None, Some(STATUS_PEAK_HARD_CAP)),
            (true, _, _) => (Some(0.0), Some(STATUS_PEAK_ZERO)),
        };
        let soft = SoftBudgetInputs {
            static_w: self.config.budget.static_max_w,
            external_w: if self.config.budget.use_external {
                external
            } else {
                None
            },
            peak_shaving_w,
            tariff_w: if any_boosting {
                None
            } else {
                self.config.tariff.max_power_w
            },
            pv_surplus_w: global_pv_only.then_some(pv.cap_w),
        };
        let hard = HardCapInputs {
            grid_power_w: grid_w,
            modeled_ev_load_w: ev_load_w,
            grid_import_limit_w: self.config.safety.grid_import_limit_w,
            phase_currents_a: phases,
            ev_phase_currents_a: ev_phases,
            phase_limit_a: self.config.safety.phase_current_limit_a,
            voltage_v: voltage,
            regulatory_cap_w: plant.regulatory_cap_w,
        };

        let storage_cfg = &self.config.storage;
        let assist = if storage_cfg.enabled {
            let open = self.state.storage_gate.update(
                plant.storage_soc_pct,
                storage_cfg.min_soc_pct,
                storage_cfg.soc_hysteresis_pct,
            );
            StorageAssist {
                allowed: open
                    && plant.storage_discharge_allowed.unwrap_or(true)
                    && self.state.tariff.discharge.value()
                    && !plant.storage_paused.unwrap_or(false),
                max_discharge_w: storage_cfg.max_discharge_w,
            }
        } else {
            StorageAssist::default()
        };
        let budget = resolve_budget(&soft, &hard, &assist);

        // Order the participants
        let entries: Vec<ScheduleEntry> = prepared
            .iter()
            .filter(|p| p.enabled && p.online && p.spec.capability.has_setpoint())
            .map(|p| ScheduleEntry {
                key: p.spec.key.clone(),
                station: p.spec.station.clone(),
                boost: modes.get(p.spec.key.as_str()) == Some(&EffectiveMode::Boost),
                goal: plans.get(p.spec.key.as_str()).map(|g| GoalRank {
                    deadline: g.deadline,
                    urgency: g.urgency,
                }),
                charging: p.session.charging_now,
                session_start: p.session.session_start,
                priority: p.spec.priority,
                config_order: p.spec.config_order,
            })
            .collect();
        let order: Vec<String> = self
            .state
            .scheduler
            .order(entries, now)
            .into_iter()
            .map(|e| e.key)
            .collect();

        // Allocate in order
        let mut allocator = PowerAllocator::new(&budget, &self.stations, pv.cap_w);
        let mut allocations: HashMap<String, Allocation> = HashMap::new();
        for key in &order {
            let Some(p) = prepared.iter().find(|p| &p.spec.key == key) else {
                continue;
            };
            let mode = modes
                .get(key.as_str())
                .copied()
                .unwrap_or(EffectiveMode::Normal);
            let req = AllocationRequest {
                spec: &p.spec,
                mode,
                user_limit_w: p.input.and_then(|i| i.user_limit_w),
                goal_cap_w: plans.get(key.as_str()).map(|g| g.desired_cap_w),
                previous_w: self.state.sessions.last_commanded_w(key),
            };
            let allocation = allocator.allocate(&req);
            allocations.insert(key.clone(), allocation);
        }
        let remaining_w = allocator.pools().total_w;
        let exhausted = allocator.budget_exhausted();

        // Outcomes in configuration order
        let mut connectors = Vec::with_capacity(prepared.len());
        let mut used_w = 0.0;
        for p in prepared {
            let key = p.spec.key.as_str();
            let Some(allocation) = allocations.remove(key) else {
                let reason = if !p.enabled {
                    Reason::Disabled
                } else if !p.online {
                    Reason::Offline
                } else {
                    Reason::NoSetpoint
                };
                connectors.push(self.inactive_outcome(p, reason));
                continue;
            };

            let mode = modes.get(key).copied();
            used_w += allocation.target_power_w;
            self.state.sessions.record_command(
                key,
                allocation.target_power_w,
                allocation.target_current_a,
                mode,
            );
            let enable = self.state.disabled_by_user.remove(key).then_some(true);
            let log = self.logger.for_connector(key);
            log.debug(&format!(
                "{} -> {:.0} W / {:.2} A ({})",
                mode.map_or("-", |m| m.as_str()),
                allocation.target_power_w,
                allocation.target_current_a,
                allocation.reason
            ));
            connectors.push(ConnectorOutcome {
                key: key.to_string(),
                setpoint: Some(Setpoint {
                    target_power_w: allocation.target_power_w,
                    target_current_a: allocation.target_current_a,
                    control_basis: p.spec.capability.control_basis,
                    enable,
                }),
                allocation,
                mode,
                requested_mode: p.requested,
                enabled: p.enabled,
                online: p.online,
                measured_power_w: p.power_fresh,
                session: p.session,
                goal: plans.get(key).copied(),
                mapping: p.input.map(|i| i.mapping).unwrap_or_default(),
            });
        }

        let budget_mode = budget.mode();
        let status = match peak_status {
            Some(s) => s.to_string(),
            None if exhausted && budget.total_w.is_some() => {
                let binding: Vec<&str> = budget
                    .components
                    .iter()
                    .filter(|c| c.binding)
                    .map(|c| c.source.as_str())
                    .collect();
                if binding.is_empty() {
                    "limited_budget".to_string()
                } else {
                    format!("limited_{}", binding.join("+"))
                }
            }
            None => STATUS_OK.to_string(),
        };

        CycleOutcome {
            cycle: self.state.cycle,
            timestamp: now,
            status,
            failsafe: false,
            budget_mode,
            used_w,
            remaining_w: remaining_w.map(|r| if r < EPSILON_W { 0.0 } else { r }),
            pv,
            tariff_grid_charge_allowed: true,
            tariff_discharge_allowed: true,
            storage_gate_open: false,
            order,
            connectors,
            budget,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectorConfig, StationConfig};
    use crate::inputs::{PlantInput, Reading};
    use crate::model::ControlBasis;
    use chrono::Duration;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn connector(key: &str) -> ConnectorConfig {
        ConnectorConfig {
            key: key.to_string(),
            control_basis: ControlBasis::Power,
            min_power_w: Some(4140.0),
            max_power_w: Some(11000.0),
            ..Default::default()
        }
    }

    fn plant(grid_w: f64) -> PlantInput {
        PlantInput {
            grid_power_w: Some(Reading::new(grid_w, Duration::zero())),
            ..Default::default()
        }
    }

    fn inputs(grid_w: f64, connectors: Vec<ConnectorInput>) -> CycleInputs {
        CycleInputs {
            plant: plant(grid_w),
            connectors,
        }
    }

    fn charging(key: &str, power: f64) -> ConnectorInput {
        ConnectorInput {
            power_w: Some(Reading::new(power, Duration::zero())),
            ..ConnectorInput::new(key)
        }
    }

    #[test]
    fn stale_grid_meter_fails_safe() {
        let config = Config {
            connectors: vec![connector("a")],
            ..Default::default()
        };
        let mut engine = AllocationEngine::new(&config).unwrap();
        let mut inp = inputs(1000.0, vec![charging("a", 5000.0)]);
        inp.plant.grid_power_w = Some(Reading::new(1000.0, Duration::seconds(60)));
        let out = engine.step(&inp, t(0));
        assert!(out.failsafe);
        assert_eq!(out.status, STATUS_FAILSAFE);
        let a = out.connector("a").unwrap();
        assert_eq!(a.allocation.target_power_w, 0.0);
        assert_eq!(a.allocation.reason, Reason::StaleMeter);
        assert!(a.setpoint.is_some());
        // PV is not updated in failsafe
        assert_eq!(engine.state().pv.sample_count(), 0);
    }

    #[test]
    fn missing_phase_currents_fail_safe_only_when_capped() {
        let mut config = Config {
            connectors: vec![connector("a")],
            ..Default::default()
        };
        let mut engine = AllocationEngine::new(&config).unwrap();
        assert!(!engine.step(&inputs(0.0, vec![]), t(0)).failsafe);

        config.safety.phase_current_limit_a = Some(32.0);
        config.safety.phase_current_dps = vec!["l1".into(), "l2".into(), "l3".into()];
        let mut engine = AllocationEngine::new(&config).unwrap();
        assert!(engine.step(&inputs(0.0, vec![]), t(0)).failsafe);
    }

    #[test]
    fn station_boost_scenario() {
        let mut a = connector("a");
        a.station = Some("st".into());
        let mut b = connector("b");
        b.station = Some("st".into());
        let config = Config {
            connectors: vec![a, b],
            stations: vec![StationConfig {
                key: "st".into(),
                max_power_w: 11000.0,
            }],
            ..Default::default()
        };
        let mut engine = AllocationEngine::new(&config).unwrap();
        let mut ia = charging("a", 6000.0);
        ia.mode = Some(UserMode::Boost);
        let ib = charging("b", 5000.0);
        let out = engine.step(&inputs(11000.0, vec![ia, ib]), t(0));

        assert_eq!(out.order, vec!["a", "b"]);
        let a = out.connector("a").unwrap();
        let b = out.connector("b").unwrap();
        assert_eq!(a.allocation.target_power_w, 11000.0);
        assert_eq!(a.allocation.reason, Reason::Allocated);
        assert_eq!(a.mode, Some(EffectiveMode::Boost));
        assert_eq!(b.allocation.target_power_w, 0.0);
        assert_eq!(b.allocation.reason, Reason::LimitedByStationCap);
    }

    #[test]
    fn boost_bypasses_tariff_but_not_grid_import_cap() {
        let mut config = Config {
            connectors: vec![connector("a")],
            ..Default::default()
        };
        config.tariff.max_power_w = Some(5000.0);
        config.safety.grid_import_limit_w = Some(16000.0);
        let mut engine = AllocationEngine::new(&config).unwrap();

        let normal = engine.step(&inputs(8000.0, vec![charging("a", 0.0)]), t(0));
        assert_eq!(normal.connector("a").unwrap().allocation.target_power_w, 5000.0);

        let mut boost = charging("a", 5000.0);
        boost.mode = Some(UserMode::Boost);
        // base load 10000 -> grid headroom 6000
        let out = engine.step(&inputs(15000.0, vec![boost]), t(1));
        let a = out.connector("a").unwrap();
        assert_eq!(a.allocation.target_power_w, 6000.0);
        assert_eq!(a.allocation.reason, Reason::LimitedByGridImport);
        assert!(out.budget.component(crate::budget::BudgetSource::Tariff).is_none());
    }

    #[test]
    fn user_disable_sends_explicit_disable_once_and_reenables() {
        let config = Config {
            connectors: vec![connector("a")],
            ..Default::default()
        };
        let mut engine = AllocationEngine::new(&config).unwrap();
        let mut off = ConnectorInput::new("a");
        off.user_enabled = Some(false);
        let out = engine.step(&inputs(0.0, vec![off]), t(0));
        let a = out.connector("a").unwrap();
        assert_eq!(a.allocation.reason, Reason::Disabled);
        assert_eq!(a.setpoint.unwrap().enable, Some(false));

        let out = engine.step(&inputs(0.0, vec![ConnectorInput::new("a")]), t(1));
        assert_eq!(out.connector("a").unwrap().setpoint.unwrap().enable, Some(true));
        let out = engine.step(&inputs(0.0, vec![ConnectorInput::new("a")]), t(2));
        assert_eq!(out.connector("a").unwrap().setpoint.unwrap().enable, None);
    }

    #[test]
    fn reenable_overrides_own_disable_read_back() {
        let config = Config {
            connectors: vec![connector("a")],
            ..Default::default()
        };
        let mut engine = AllocationEngine::new(&config).unwrap();
        let mut off = ConnectorInput::new("a");
        off.user_enabled = Some(false);
        engine.step(&inputs(0.0, vec![off]), t(0));

        // Device still reports the disable we wrote
        let mut echo = ConnectorInput::new("a");
        echo.device_enabled = Some(false);
        let out = engine.step(&inputs(0.0, vec![echo.clone()]), t(1));
        let a = out.connector("a").unwrap();
        assert_ne!(a.allocation.reason, Reason::Disabled);
        assert_eq!(a.setpoint.unwrap().enable, Some(true));
        assert!(a.allocation.target_power_w > 0.0);

        // Afterwards the device flag is authoritative again
        let out = engine.step(&inputs(0.0, vec![echo]), t(2));
        let a = out.connector("a").unwrap();
        assert_eq!(a.allocation.reason, Reason::Disabled);
        assert_eq!(a.setpoint.unwrap().enable, None);
    }

    #[test]
    fn reenable_is_sent_even_while_failsafe() {
        let config = Config {
            connectors: vec![connector("a")],
            ..Default::default()
        };
        let mut engine = AllocationEngine::new(&config).unwrap();
        let mut off = ConnectorInput::new("a");
        off.user_enabled = Some(false);
        engine.step(&inputs(0.0, vec![off]), t(0));

        let mut stale = inputs(0.0, vec![ConnectorInput::new("a")]);
        stale.plant.grid_power_w = None;
        let out = engine.step(&stale, t(1));
        assert!(out.failsafe);
        let a = out.connector("a").unwrap();
        assert_eq!(a.allocation.reason, Reason::StaleMeter);
        assert_eq!(a.setpoint.unwrap().enable, Some(true));
    }

    #[test]
    fn offline_and_no_setpoint_connectors() {
        let mut n = connector("n");
        n.control_basis = ControlBasis::None;
        let config = Config {
            connectors: vec![connector("a"), n],
            ..Default::default()
        };
        let mut engine = AllocationEngine::new(&config).unwrap();
        let mut a = ConnectorInput::new("a");
        a.status = Some(crate::inputs::ConnectorStatus::Offline);
        let out = engine.step(&inputs(0.0, vec![a, ConnectorInput::new("n")]), t(0));
        assert_eq!(out.connector("a").unwrap().allocation.reason, Reason::Offline);
        let n = out.connector("n").unwrap();
        assert_eq!(n.allocation.reason, Reason::NoSetpoint);
        assert!(n.setpoint.is_none());
    }

    #[test]
    fn peak_shaving_statuses() {
        let mut config = Config {
            connectors: vec![connector("a")],
            ..Default::default()
        };
        let mut engine = AllocationEngine::new(&config).unwrap();
        let mut inp = inputs(0.0, vec![charging("a", 0.0)]);
        inp.plant.peak_shaving_active = Some(true);
        let out = engine.step(&inp, t(0));
        assert_eq!(out.status, STATUS_PEAK_ZERO);
        assert_eq!(out.connector("a").unwrap().allocation.reason, Reason::NoBudget);

        config.budget.peak_shaving.follow_peak_budget = true;
        let mut engine = AllocationEngine::new(&config).unwrap();
        // No peak budget and no grid-side cap to fall back on
        let out = engine.step(&inp, t(0));
        assert_eq!(out.status, STATUS_PEAK_ZERO);
        assert_eq!(out.connector("a").unwrap().allocation.target_power_w, 0.0);
        inp.plant.peak_budget_w = Some(Reading::new(7000.0, Duration::zero()));
        let out = engine.step(&inp, t(1));
        assert_eq!(out.status, STATUS_PEAK_BUDGET);
        assert_eq!(out.connector("a").unwrap().allocation.target_power_w, 7000.0);

        config.safety.grid_import_limit_w = Some(10000.0);
        let mut engine = AllocationEngine::new(&config).unwrap();
        inp.plant.peak_budget_w = None;
        let out = engine.step(&inp, t(0));
        assert_eq!(out.status, STATUS_PEAK_HARD_CAP);
        let a = out.connector("a").unwrap();
        assert_eq!(a.allocation.target_power_w, 10000.0);
        assert_eq!(a.allocation.reason, Reason::LimitedByGridImport);
    }

    #[test]
    fn tariff_forces_auto_to_pv_only() {
        let config = Config {
            connectors: vec![connector("a")],
            ..Default::default()
        };
        let mut engine = AllocationEngine::new(&config).unwrap();
        let mut inp = inputs(0.0, vec![charging("a", 0.0)]);
        inp.plant.grid_charge_allowed = Some(false);
        let out = engine.step(&inp, t(0));
        let a = out.connector("a").unwrap();
        assert_eq!(a.mode, Some(EffectiveMode::PvOnly));
        assert_eq!(a.allocation.reason, Reason::NoPvSurplus);
    }

    #[test]
    fn exhausted_budget_reports_limited_status() {
        let mut config = Config {
            connectors: vec![connector("a"), connector("b")],
            ..Default::default()
        };
        config.budget.static_max_w = Some(11000.0);
        let mut engine = AllocationEngine::new(&config).unwrap();
        let out = engine.step(&inputs(0.0, vec![charging("a", 0.0), charging("b", 0.0)]), t(0));
        assert_eq!(out.status, "limited_static");
        assert_eq!(out.used_w, 11000.0);
        assert_eq!(out.remaining_w, Some(0.0));
    }
}
