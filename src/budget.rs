//! Budget resolution
//!
//! Combines independently-sourced ceilings into one effective total budget.
//! The total is the minimum of all present components (never a sum); with no
//! component present the budget is unbounded. Hard safety caps resolve after
//! the soft sources from live metering and can only tighten the result, with
//! the single exception of storage discharge assist, which may give back up
//! to the amount a grid-side cap is binding.

use serde::Serialize;
use std::fmt;

/// Components within this many watts of the total are binding
pub const BINDING_EPSILON_W: f64 = 1.0;

/// Where a ceiling comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BudgetSource {
    Static,
    ExternalSignal,
    PeakShaving,
    Tariff,
    PvSurplus,
    GridImport,
    PhaseCurrent,
    RegulatoryCap,
    StorageAssist,
}

impl BudgetSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetSource::Static => "static",
            BudgetSource::ExternalSignal => "external-signal",
            BudgetSource::PeakShaving => "peak-shaving",
            BudgetSource::Tariff => "tariff",
            BudgetSource::PvSurplus => "pv-surplus",
            BudgetSource::GridImport => "grid-import",
            BudgetSource::PhaseCurrent => "phase-current",
            BudgetSource::RegulatoryCap => "regulatory-cap",
            BudgetSource::StorageAssist => "storage-assist",
        }
    }

    /// Hard caps that storage discharge can relieve
    fn is_assistable(&self) -> bool {
        matches!(self, BudgetSource::GridImport | BudgetSource::PhaseCurrent)
    }
}

impl fmt::Display for BudgetSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ceiling of this cycle
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BudgetComponent {
    pub source: BudgetSource,
    pub watts: f64,
    pub binding: bool,
}

/// Soft sources, already filtered by freshness and policy
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftBudgetInputs {
    pub static_w: Option<f64>,
    pub external_w: Option<f64>,
    pub peak_shaving_w: Option<f64>,
    /// Omitted by the caller while any connector boosts
    pub tariff_w: Option<f64>,
    /// Only present while the plant runs PV-only
    pub pv_surplus_w: Option<f64>,
}

/// Live metering for the hard caps
#[derive(Debug, Clone, Copy, Default)]
pub struct HardCapInputs {
    /// Signed grid power, import positive
    pub grid_power_w: f64,
    /// EV draw contained in `grid_power_w`
    pub modeled_ev_load_w: f64,
    pub grid_import_limit_w: Option<f64>,
    pub phase_currents_a: Option<[f64; 3]>,
    /// EV share of each grid phase current
    pub ev_phase_currents_a: [f64; 3],
    pub phase_limit_a: Option<f64>,
    pub voltage_v: f64,
    pub regulatory_cap_w: Option<f64>,
}

/// Storage discharge assist availability
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageAssist {
    pub allowed: bool,
    pub max_discharge_w: f64,
}

/// Outcome of budget resolution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetResolution {
    /// `None` means unbounded
    pub total_w: Option<f64>,
    pub soft_total_w: Option<f64>,
    pub components: Vec<BudgetComponent>,
    pub assist_w: f64,
    /// Remaining current per grid phase (A) when a phase cap applies
    pub phase_headroom_a: Option<[f64; 3]>,
}

impl BudgetResolution {
    pub fn component(&self, source: BudgetSource) -> Option<&BudgetComponent> {
        self.components.iter().find(|c| c.source == source)
    }

    pub fn is_binding(&self, source: BudgetSource) -> bool {
        self.component(source).is_some_and(|c| c.binding)
    }

    /// Binding component names joined with `+`, or `unlimited`
    pub fn mode(&self) -> String {
        if self.total_w.is_none() {
            return "unlimited".to_string();
        }
        let names: Vec<&str> = self
            .components
            .iter()
            .filter(|c| c.binding)
            .map(|c| c.source.as_str())
            .collect();
        if names.is_empty() {
            "unlimited".to_string()
        } else {
            names.join("+")
        }
    }

    /// A budget with no components at all
    pub fn unbounded() -> Self {
        Self {
            total_w: None,
            soft_total_w: None,
            components: Vec::new(),
            assist_w: 0.0,
            phase_headroom_a: None,
        }
    }
}

fn sanitize(w: Option<f64>) -> Option<f64> {
    w.filter(|v| v.is_finite()).map(|v| v.max(0.0))
}

fn min_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

/// Grid-import headroom: limit minus the non-EV base load
pub fn grid_import_headroom(limit_w: f64, grid_power_w: f64, ev_load_w: f64) -> f64 {
    let base_load = grid_power_w - ev_load_w;
    (limit_w - base_load).max(0.0)
}

/// Current left on each phase once the non-EV base load is accounted for
pub fn phase_headroom_a(limit_a: f64, phases_a: [f64; 3], ev_a: [f64; 3]) -> [f64; 3] {
    std::array::from_fn(|i| (limit_a - (phases_a[i] - ev_a[i])).max(0.0))
}

/// Plant-wide phase headroom in watts for a balanced three-phase EV load.
/// Connectors on fewer phases are bounded per phase by the allocator.
pub fn phase_headroom_w(headroom_a: [f64; 3], voltage_v: f64) -> f64 {
    let worst = headroom_a.iter().copied().fold(f64::INFINITY, f64::min);
    (worst * voltage_v * 3.0).max(0.0)
}

/// Resolve the effective total budget for this cycle
pub fn resolve_budget(
    soft: &SoftBudgetInputs,
    hard: &HardCapInputs,
    assist: &StorageAssist,
) -> BudgetResolution {
    let mut components: Vec<BudgetComponent> = [
        (BudgetSource::Static, soft.static_w),
        (BudgetSource::ExternalSignal, soft.external_w),
        (BudgetSource::PeakShaving, soft.peak_shaving_w),
        (BudgetSource::Tariff, soft.tariff_w),
        (BudgetSource::PvSurplus, soft.pv_surplus_w),
    ]
    .into_iter()
    .filter_map(|(source, w)| {
        sanitize(w).map(|watts| BudgetComponent {
            source,
            watts,
            binding: false,
        })
    })
    .collect();

    let soft_total_w = components.iter().map(|c| Some(c.watts)).fold(None, min_opt);

    // Hard safety caps from live metering
    let grid_power = if hard.grid_power_w.is_finite() {
        hard.grid_power_w
    } else {
        0.0
    };
    if let Some(limit) = sanitize(hard.grid_import_limit_w) {
        components.push(BudgetComponent {
            source: BudgetSource::GridImport,
            watts: grid_import_headroom(limit, grid_power, hard.modeled_ev_load_w),
            binding: false,
        });
    }
    let mut phase_headroom = None;
    if let (Some(limit), Some(phases)) = (sanitize(hard.phase_limit_a), hard.phase_currents_a) {
        let headroom = phase_headroom_a(limit, phases, hard.ev_phase_currents_a);
        components.push(BudgetComponent {
            source: BudgetSource::PhaseCurrent,
            watts: phase_headroom_w(headroom, hard.voltage_v),
            binding: false,
        });
        phase_headroom = Some(headroom);
    }
    if let Some(cap) = sanitize(hard.regulatory_cap_w) {
        components.push(BudgetComponent {
            source: BudgetSource::RegulatoryCap,
            watts: cap,
            binding: false,
        });
    }

    let assistable_cap = components
        .iter()
        .filter(|c| c.source.is_assistable())
        .map(|c| Some(c.watts))
        .fold(None, min_opt);
    let regulatory = components
        .iter()
        .find(|c| c.source == BudgetSource::RegulatoryCap)
        .map(|c| c.watts);

    // Storage may widen a binding grid-side cap, never past the soft total
    let mut assist_w = 0.0;
    if assist.allowed
        && assist.max_discharge_w > 0.0
        && let Some(cap) = assistable_cap
    {
        let deficit = soft_total_w.map_or(f64::INFINITY, |s| s - cap);
        if deficit > 0.0 {
            assist_w = deficit.min(assist.max_discharge_w);
        }
    }

    let widened = assistable_cap.map(|c| c + assist_w);
    let total_w = min_opt(min_opt(soft_total_w, widened), regulatory);

    if let Some(total) = total_w {
        for c in &mut components {
            let ceiling = if c.source.is_assistable() {
                c.watts + assist_w
            } else {
                c.watts
            };
            c.binding = (ceiling - total).abs() <= BINDING_EPSILON_W;
        }
        if assist_w > 0.0 {
            let grid_side_binding = components
                .iter()
                .any(|c| c.source.is_assistable() && c.binding);
            components.push(BudgetComponent {
                source: BudgetSource::StorageAssist,
                watts: assist_w,
                binding: grid_side_binding,
            });
        }
    }

    // Discharge relieves every phase evenly
    let phase_headroom_a = phase_headroom.map(|h| {
        let relief = if hard.voltage_v > 0.0 {
            assist_w / (hard.voltage_v * 3.0)
        } else {
            0.0
        };
        h.map(|a| a + relief)
    });

    BudgetResolution {
        total_w,
        soft_total_w,
        components,
        assist_w,
        phase_headroom_a,
    }
}

/// SoC hysteresis band gating storage discharge assist
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageGate {
    open: bool,
}

impl StorageGate {
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Opens at `min + hysteresis`, closes at `min`. Unknown SoC closes.
    pub fn update(&mut self, soc_pct: Option<f64>, min_soc_pct: f64, hysteresis_pct: f64) -> bool {
        self.open = match soc_pct.filter(|s| s.is_finite()) {
            None => false,
            Some(soc) if self.open => soc > min_soc_pct,
            Some(soc) => soc >= min_soc_pct + hysteresis_pct.max(0.0),
        };
        self.open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_components_is_unbounded() {
        let r = resolve_budget(
            &SoftBudgetInputs::default(),
            &HardCapInputs::default(),
            &StorageAssist::default(),
        );
        assert_eq!(r.total_w, None);
        assert_eq!(r.mode(), "unlimited");
    }

    #[test]
    fn total_is_minimum_not_sum() {
        let soft = SoftBudgetInputs {
            static_w: Some(11000.0),
            external_w: Some(8000.0),
            tariff_w: Some(8000.5),
            ..Default::default()
        };
        let r = resolve_budget(&soft, &HardCapInputs::default(), &StorageAssist::default());
        assert_eq!(r.total_w, Some(8000.0));
        assert!(r.is_binding(BudgetSource::ExternalSignal));
        assert!(r.is_binding(BudgetSource::Tariff));
        assert!(!r.is_binding(BudgetSource::Static));
        assert_eq!(r.mode(), "external-signal+tariff");
    }

    #[test]
    fn grid_import_cap_uses_base_load() {
        // 16 kW limit, 12 kW import of which 7 kW is EV -> base 5 kW -> 11 kW headroom
        let hard = HardCapInputs {
            grid_power_w: 12000.0,
            modeled_ev_load_w: 7000.0,
            grid_import_limit_w: Some(16000.0),
            ..Default::default()
        };
        let soft = SoftBudgetInputs {
            static_w: Some(20000.0),
            ..Default::default()
        };
        let r = resolve_budget(&soft, &hard, &StorageAssist::default());
        assert_eq!(r.total_w, Some(11000.0));
        assert!(r.is_binding(BudgetSource::GridImport));
        assert_eq!(r.mode(), "grid-import");
    }

    #[test]
    fn hard_caps_apply_without_soft_components() {
        let hard = HardCapInputs {
            regulatory_cap_w: Some(4200.0),
            ..Default::default()
        };
        let r = resolve_budget(&SoftBudgetInputs::default(), &hard, &StorageAssist::default());
        assert_eq!(r.total_w, Some(4200.0));
        assert!(r.is_binding(BudgetSource::RegulatoryCap));
    }

    #[test]
    fn phase_cap_uses_worst_phase() {
        let headroom = phase_headroom_a(25.0, [20.0, 10.0, 12.0], [8.0, 8.0, 8.0]);
        assert_eq!(headroom, [13.0, 23.0, 21.0]);
        // worst base phase 12 A -> 13 A headroom on three phases
        assert!((phase_headroom_w(headroom, 230.0) - 13.0 * 230.0 * 3.0).abs() < 1e-6);
        let overloaded = phase_headroom_a(10.0, [30.0, 0.0, 0.0], [0.0; 3]);
        assert_eq!(phase_headroom_w(overloaded, 230.0), 0.0);
    }

    #[test]
    fn per_phase_headroom_is_published_and_widened_by_assist() {
        let soft = SoftBudgetInputs {
            static_w: Some(20000.0),
            ..Default::default()
        };
        let hard = HardCapInputs {
            phase_currents_a: Some([15.0, 5.0, 5.0]),
            phase_limit_a: Some(25.0),
            voltage_v: 230.0,
            ..Default::default()
        };
        let r = resolve_budget(&soft, &hard, &StorageAssist::default());
        assert_eq!(r.phase_headroom_a, Some([10.0, 20.0, 20.0]));

        let assist = StorageAssist {
            allowed: true,
            max_discharge_w: 690.0,
        };
        let r = resolve_budget(&soft, &hard, &assist);
        assert_eq!(r.assist_w, 690.0);
        let h = r.phase_headroom_a.unwrap();
        assert!((h[0] - 11.0).abs() < 1e-9);

        let r = resolve_budget(&soft, &HardCapInputs::default(), &StorageAssist::default());
        assert!(r.phase_headroom_a.is_none());
    }

    #[test]
    fn storage_assist_widens_only_up_to_soft_total() {
        let soft = SoftBudgetInputs {
            static_w: Some(11000.0),
            ..Default::default()
        };
        let hard = HardCapInputs {
            grid_power_w: 10000.0,
            grid_import_limit_w: Some(16000.0),
            ..Default::default()
        };
        let assist = StorageAssist {
            allowed: true,
            max_discharge_w: 10000.0,
        };
        let r = resolve_budget(&soft, &hard, &assist);
        // headroom 6000, deficit to soft 5000
        assert_eq!(r.assist_w, 5000.0);
        assert_eq!(r.total_w, Some(11000.0));

        let small = StorageAssist {
            allowed: true,
            max_discharge_w: 2000.0,
        };
        let r = resolve_budget(&soft, &hard, &small);
        assert_eq!(r.total_w, Some(8000.0));
        assert!(r.is_binding(BudgetSource::GridImport));
        assert!(r.is_binding(BudgetSource::StorageAssist));
    }

    #[test]
    fn storage_assist_never_passes_regulatory_cap() {
        let hard = HardCapInputs {
            grid_power_w: 15000.0,
            grid_import_limit_w: Some(16000.0),
            regulatory_cap_w: Some(4200.0),
            ..Default::default()
        };
        let assist = StorageAssist {
            allowed: true,
            max_discharge_w: 5000.0,
        };
        let r = resolve_budget(&SoftBudgetInputs::default(), &hard, &assist);
        assert_eq!(r.total_w, Some(4200.0));
        assert!(r.is_binding(BudgetSource::RegulatoryCap));
    }

    #[test]
    fn storage_gate_hysteresis() {
        let mut gate = StorageGate::default();
        assert!(!gate.update(Some(32.0), 30.0, 5.0));
        assert!(gate.update(Some(35.0), 30.0, 5.0));
        assert!(gate.update(Some(31.0), 30.0, 5.0));
        assert!(!gate.update(Some(30.0), 30.0, 5.0));
        assert!(!gate.update(Some(34.0), 30.0, 5.0));
        gate.update(Some(50.0), 30.0, 5.0);
        assert!(!gate.update(None, 30.0, 5.0));
    }

    #[test]
    fn no_assist_when_not_allowed_or_not_binding() {
        let soft = SoftBudgetInputs {
            static_w: Some(3000.0),
            ..Default::default()
        };
        let hard = HardCapInputs {
            grid_power_w: 0.0,
            grid_import_limit_w: Some(16000.0),
            ..Default::default()
        };
        let assist = StorageAssist {
            allowed: true,
            max_discharge_w: 5000.0,
        };
        let r = resolve_budget(&soft, &hard, &assist);
        assert_eq!(r.assist_w, 0.0);
        assert_eq!(r.total_w, Some(3000.0));
    }
}
