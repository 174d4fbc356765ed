//! Validated connector and station model
//!
//! Configuration is parsed once into these types at the edge; the allocation
//! core only ever sees already-validated values. All power is expressed in
//! watts and all currents in amperes.

use crate::config::{ConnectorConfig, StationConfig};
use crate::error::{GridshareError, Result};
use serde::{Deserialize, Serialize};

/// Physical charger flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "lowercase")]
pub enum ChargerKind {
    #[default]
    Ac,
    Dc,
}

/// Native unit in which the charger accepts setpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "lowercase")]
pub enum ControlBasis {
    #[default]
    Current,
    Power,
    None,
}

/// Mode requested by the user for a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "kebab-case")]
pub enum UserMode {
    #[default]
    Auto,
    PvOnly,
    MinPlusPv,
    Boost,
}

impl UserMode {
    /// Parse the loosely-typed registry representation of a mode
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().replace('_', "-").as_str() {
            "auto" | "normal" | "0" => Some(UserMode::Auto),
            "pv-only" | "pv" | "pvonly" | "1" => Some(UserMode::PvOnly),
            "min-plus-pv" | "minpv" | "min+pv" | "2" => Some(UserMode::MinPlusPv),
            "boost" | "3" => Some(UserMode::Boost),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UserMode::Auto => "auto",
            UserMode::PvOnly => "pv-only",
            UserMode::MinPlusPv => "min-plus-pv",
            UserMode::Boost => "boost",
        }
    }
}

/// Electrical capability of a connector
#[derive(Debug, Clone, PartialEq)]
pub struct Capability {
    pub kind: ChargerKind,
    pub phases: u8,
    pub voltage_v: f64,
    pub min_current_a: f64,
    pub max_current_a: f64,
    pub min_power_w: f64,
    pub max_power_w: f64,
    pub control_basis: ControlBasis,
}

impl Capability {
    /// Watts delivered per ampere of setpoint
    pub fn watts_per_amp(&self) -> f64 {
        self.voltage_v * f64::from(self.phases.max(1))
    }

    pub fn amps_for(&self, power_w: f64) -> f64 {
        let wpa = self.watts_per_amp();
        if wpa > 0.0 { power_w / wpa } else { 0.0 }
    }

    pub fn watts_for(&self, current_a: f64) -> f64 {
        current_a * self.watts_per_amp()
    }

    pub fn has_setpoint(&self) -> bool {
        self.control_basis != ControlBasis::None
    }
}

/// Validated connector definition
#[derive(Debug, Clone)]
pub struct ConnectorSpec {
    pub key: String,
    pub name: String,
    pub capability: Capability,
    /// 1 (highest) ..= 999 (lowest)
    pub priority: u16,
    pub allow_boost: bool,
    pub installer_enabled: bool,
    pub station: Option<String>,
    /// 1-based grid phase of the first conductor, if known
    pub grid_phase: Option<u8>,
    pub connector_no: Option<u16>,
    /// Setpoint step in native units (A or W)
    pub step: Option<f64>,
    pub max_delta_w: Option<f64>,
    pub boost_timeout_s: Option<u64>,
    /// Position in configuration, used as a late tie-breaker
    pub config_order: usize,
}

impl ConnectorSpec {
    /// Grid phases (0-based) the connector draws from, when known.
    /// Three-phase connectors always use all of them.
    pub fn wired_phases(&self) -> Option<Vec<usize>> {
        let n = usize::from(self.capability.phases.clamp(1, 3));
        if n == 3 {
            return Some(vec![0, 1, 2]);
        }
        self.grid_phase.map(|first| {
            let first = usize::from(first.clamp(1, 3)) - 1;
            (0..n).map(|i| (first + i) % 3).collect()
        })
    }

    pub fn from_config(cfg: &ConnectorConfig, order: usize) -> Result<Self> {
        let field = |name: &str| format!("connectors[{}].{}", cfg.key, name);

        if cfg.key.trim().is_empty() {
            return Err(GridshareError::validation(
                format!("connectors[{}].key", order),
                "Key cannot be empty",
            ));
        }
        if !(1..=3).contains(&cfg.phases) {
            return Err(GridshareError::validation(field("phases"), "Must be 1, 2 or 3"));
        }
        if let Some(phase) = cfg.grid_phase
            && !(1..=3).contains(&phase)
        {
            return Err(GridshareError::validation(field("grid_phase"), "Must be 1, 2 or 3"));
        }
        if !(cfg.voltage_v.is_finite() && cfg.voltage_v > 0.0) {
            return Err(GridshareError::validation(field("voltage_v"), "Must be positive"));
        }
        if !(1..=999).contains(&cfg.priority) {
            return Err(GridshareError::validation(
                field("priority"),
                "Must be between 1 and 999",
            ));
        }

        let wpa = cfg.voltage_v * f64::from(cfg.phases);
        let (min_power_w, max_power_w) = match cfg.control_basis {
            ControlBasis::Current => {
                let min_a = cfg.min_current_a.unwrap_or(6.0);
                let max_a = cfg.max_current_a.ok_or_else(|| {
                    GridshareError::validation(
                        field("max_current_a"),
                        "Required for current-controlled connectors",
                    )
                })?;
                let max_w = cfg.max_power_w.map_or(max_a * wpa, |p| p.min(max_a * wpa));
                (cfg.min_power_w.unwrap_or(min_a * wpa).max(min_a * wpa), max_w)
            }
            ControlBasis::Power | ControlBasis::None => {
                let max_w = match (cfg.max_power_w, cfg.max_current_a) {
                    (Some(p), _) => p,
                    (None, Some(a)) => a * wpa,
                    (None, None) => {
                        return Err(GridshareError::validation(
                            field("max_power_w"),
                            "Required when max_current_a is not set",
                        ));
                    }
                };
                let min_w = match (cfg.min_power_w, cfg.min_current_a) {
                    (Some(p), _) => p,
                    (None, Some(a)) => a * wpa,
                    (None, None) => 0.0,
                };
                (min_w, max_w)
            }
        };

        if !(min_power_w.is_finite() && min_power_w >= 0.0) {
            return Err(GridshareError::validation(field("min_power_w"), "Must be non-negative"));
        }
        if !(max_power_w.is_finite() && max_power_w > 0.0) {
            return Err(GridshareError::validation(field("max_power_w"), "Must be positive"));
        }
        if min_power_w > max_power_w {
            return Err(GridshareError::validation(
                field("min_power_w"),
                "Minimum exceeds maximum",
            ));
        }
        if let Some(step) = cfg.step
            && !(step.is_finite() && step > 0.0)
        {
            return Err(GridshareError::validation(field("step"), "Must be positive"));
        }
        if let Some(delta) = cfg.max_delta_w
            && !(delta.is_finite() && delta >= min_power_w && delta > 0.0)
        {
            return Err(GridshareError::validation(
                field("max_delta_w"),
                "Must be positive and at least the minimum charging power",
            ));
        }

        Ok(Self {
            key: cfg.key.clone(),
            name: cfg.name.clone().unwrap_or_else(|| cfg.key.clone()),
            capability: Capability {
                kind: cfg.kind,
                phases: cfg.phases,
                voltage_v: cfg.voltage_v,
                min_current_a: min_power_w / wpa,
                max_current_a: max_power_w / wpa,
                min_power_w,
                max_power_w,
                control_basis: cfg.control_basis,
            },
            priority: cfg.priority,
            allow_boost: cfg.allow_boost,
            installer_enabled: cfg.enabled,
            station: cfg.station.clone(),
            grid_phase: cfg.grid_phase,
            connector_no: cfg.connector_no,
            step: cfg.step,
            max_delta_w: cfg.max_delta_w,
            boost_timeout_s: cfg.boost_timeout_s,
            config_order: order,
        })
    }
}

/// Validated station group
#[derive(Debug, Clone)]
pub struct StationSpec {
    pub key: String,
    pub max_power_w: f64,
    pub members: Vec<String>,
}

impl StationSpec {
    pub fn from_config(cfg: &StationConfig, connectors: &[ConnectorSpec]) -> Result<Self> {
        if !(cfg.max_power_w.is_finite() && cfg.max_power_w >= 0.0) {
            return Err(GridshareError::validation(
                format!("stations[{}].max_power_w", cfg.key),
                "Must be non-negative",
            ));
        }
        let members = connectors
            .iter()
            .filter(|c| c.station.as_deref() == Some(cfg.key.as_str()))
            .map(|c| c.key.clone())
            .collect();
        Ok(Self {
            key: cfg.key.clone(),
            max_power_w: cfg.max_power_w,
            members,
        })
    }
}
