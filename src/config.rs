//! Configuration management for Gridshare
//!
//! This module handles loading, validation, and management of the allocator
//! configuration from YAML files. Connector and station entries are turned
//! into validated [`ConnectorSpec`]/[`StationSpec`] values here so the core
//! never deals with loosely-typed input.

use crate::error::{GridshareError, Result};
use crate::model::{ChargerKind, ConnectorSpec, ControlBasis, StationSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

mod defaults;

fn default_true() -> bool {
    true
}

/// Upper bound for every `*_s` setting (one year)
pub const MAX_DURATION_S: u64 = 366 * 24 * 3600;

/// Convert a configured number of seconds, saturating at [`MAX_DURATION_S`]
pub fn duration_s(seconds: u64) -> chrono::Duration {
    let bounded = i64::try_from(seconds.min(MAX_DURATION_S)).unwrap_or(0);
    chrono::Duration::try_seconds(bounded).unwrap_or_else(chrono::Duration::zero)
}

fn check_duration(field: &str, seconds: u64) -> Result<()> {
    if seconds > MAX_DURATION_S {
        return Err(GridshareError::validation(
            field,
            format!("Must not exceed {} seconds", MAX_DURATION_S),
        ));
    }
    Ok(())
}

fn check_phase_ids(field: &str, ids: &[String]) -> Result<()> {
    if !(ids.is_empty() || ids.len() == 3) {
        return Err(GridshareError::validation(
            field,
            format!("Expected 3 phase datapoints (L1, L2, L3), got {}", ids.len()),
        ));
    }
    Ok(())
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct Config {
    /// Control cycle period in milliseconds
    pub cycle_interval_ms: u64,

    /// Charging connectors under control
    pub connectors: Vec<ConnectorConfig>,

    /// Station groups sharing a power ceiling
    pub stations: Vec<StationConfig>,

    /// Soft budget sources
    pub budget: BudgetConfig,

    /// PV surplus estimation
    pub pv: PvConfig,

    /// Hard safety caps and metering
    pub safety: SafetyConfig,

    /// Tariff permissions and contract ceiling
    pub tariff: TariffConfig,

    /// Home battery discharge assist
    pub storage: StorageConfig,

    /// Session and boost timing
    pub session: SessionConfig,

    /// Deadline charging tuning
    pub goal: GoalConfig,

    /// Allocation order tuning
    pub scheduler: SchedulerConfig,

    /// Datapoint registry access
    pub registry: RegistryConfig,

    /// Outgoing command queue
    pub write_queue: WriteQueueConfig,

    /// Diagnostics publication
    pub diagnostics: DiagnosticsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// One charging connector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct ConnectorConfig {
    /// Stable key
    pub key: String,
    /// Display name (defaults to key)
    pub name: Option<String>,
    pub kind: ChargerKind,
    pub phases: u8,
    /// Grid phase (1-3) of the first conductor for 1- and 2-phase chargers
    pub grid_phase: Option<u8>,
    pub voltage_v: f64,
    pub min_current_a: Option<f64>,
    pub max_current_a: Option<f64>,
    pub min_power_w: Option<f64>,
    pub max_power_w: Option<f64>,
    pub control_basis: ControlBasis,
    /// 1 (highest) ..= 999 (lowest)
    pub priority: u16,
    pub allow_boost: bool,
    /// Installer-level enable
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub station: Option<String>,
    pub connector_no: Option<u16>,
    /// Setpoint step in native units (A for current, W for power)
    pub step: Option<f64>,
    /// Maximum setpoint increase per cycle in watts
    pub max_delta_w: Option<f64>,
    /// Boost timeout override in seconds
    pub boost_timeout_s: Option<u64>,
    pub datapoints: ConnectorDatapoints,
}

/// Registry ids read and written for a connector
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct ConnectorDatapoints {
    /// Measured charging power (W)
    pub power: Option<String>,
    /// Measured per-phase currents (A), L1..L3
    pub phase_currents: Vec<String>,
    /// Charger status text
    pub status: Option<String>,
    /// External enable signal
    pub enable: Option<String>,
    /// Setpoint target in amperes
    pub setpoint_current: Option<String>,
    /// Setpoint target in watts
    pub setpoint_power: Option<String>,
    /// Enable/disable command target
    pub enable_write: Option<String>,
    /// User runtime enable
    pub user_enabled: Option<String>,
    /// User requested mode
    pub mode: Option<String>,
    /// User power limit (W)
    pub user_limit_w: Option<String>,
    /// Deadline charging switch
    pub goal_enabled: Option<String>,
    pub goal_target_soc: Option<String>,
    pub goal_soc: Option<String>,
    /// Deadline as epoch seconds or RFC 3339
    pub goal_deadline: Option<String>,
    pub goal_battery_kwh: Option<String>,
    /// "plain" or "smart"
    pub goal_strategy: Option<String>,
    /// Last known session start, restored after restart
    pub charging_since: Option<String>,
    /// Last known boost start, restored after restart
    pub boost_since: Option<String>,
}

/// Connectors sharing one hard ceiling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct StationConfig {
    pub key: String,
    pub max_power_w: f64,
}

/// Soft budget sources
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct BudgetConfig {
    /// Fixed installation budget (W)
    pub static_max_w: Option<f64>,
    /// Use the external budget signal
    pub use_external: bool,
    /// External budget signal (W)
    pub external_dp: Option<String>,
    pub peak_shaving: PeakShavingConfig,
}

/// Peak-shaving coordination
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct PeakShavingConfig {
    /// Peak shaving active flag
    pub active_dp: Option<String>,
    /// Dynamic budget published by peak shaving (W)
    pub budget_dp: Option<String>,
    /// Follow the dynamic budget instead of pausing
    pub follow_peak_budget: bool,
}

/// PV surplus estimation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct PvConfig {
    pub start_threshold_w: f64,
    pub stop_threshold_w: f64,
    pub start_delay_s: u64,
    pub stop_delay_s: u64,
    /// Grid import above this drops availability immediately
    pub abort_import_w: Option<f64>,
    /// Rolling mean window in seconds
    pub window_s: u64,
    /// External surplus signal replacing the grid-derived value
    pub surplus_dp: Option<String>,
    /// Plant-wide PV-only switch
    pub global_pv_only_dp: Option<String>,
}

/// Hard safety caps and metering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct SafetyConfig {
    /// Grid power, import positive (W)
    pub grid_power_dp: String,
    pub grid_import_limit_w: Option<f64>,
    /// Grid phase currents L1..L3 (A)
    pub phase_current_dps: Vec<String>,
    pub phase_current_limit_a: Option<f64>,
    /// Fixed regulatory EV cap (W)
    pub regulatory_cap_w: Option<f64>,
    /// Regulatory cap signal (W)
    pub regulatory_cap_dp: Option<String>,
    /// Age after which a safety input is stale
    pub stale_timeout_s: u64,
    pub nominal_voltage_v: f64,
}

/// Tariff permissions and contract ceiling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct TariffConfig {
    pub grid_charge_allowed_dp: Option<String>,
    pub discharge_allowed_dp: Option<String>,
    /// Contract ceiling while tariff applies (W)
    pub max_power_w: Option<f64>,
    /// How long `true` must hold before it applies
    pub hold_s: u64,
}

/// Home battery discharge assist
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct StorageConfig {
    pub enabled: bool,
    pub soc_dp: Option<String>,
    pub discharge_allowed_dp: Option<String>,
    pub paused_dp: Option<String>,
    pub min_soc_pct: f64,
    pub soc_hysteresis_pct: f64,
    pub max_discharge_w: f64,
}

/// Session and boost timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct SessionConfig {
    /// Minimum |power| that counts as charging
    pub activity_threshold_w: f64,
    /// How long a dip may last before the session ends
    pub keep_s: u64,
    /// How long a connector may be offline before the session ends
    pub offline_grace_s: u64,
    /// Idle time after which session state is dropped
    pub idle_clear_s: u64,
    pub boost_timeout_s: u64,
    /// Measurement age after which power falls back to last command
    pub meter_stale_s: u64,
}

/// Deadline charging tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct GoalConfig {
    /// Lift tariff-forced PV this close to the deadline
    pub lift_window_s: u64,
    /// Lift tariff-forced PV at or above this urgency
    pub lift_urgency: f64,
    /// Cap scale factor when the price is below average
    pub smart_price_factor: f64,
    pub price_now_dp: Option<String>,
    pub price_avg_dp: Option<String>,
}

/// Allocation order tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct SchedulerConfig {
    pub rotation_interval_s: u64,
}

/// Datapoint registry access
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct RegistryConfig {
    /// Bound for async fetches on cache miss
    pub fetch_timeout_ms: u64,
}

/// Outgoing command queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct WriteQueueConfig {
    /// Minimum time between two writes to the same target
    pub min_interval_ms: u64,
    /// Re-send unchanged values after this long
    pub refresh_interval_ms: u64,
    pub deadband_w: f64,
    pub deadband_a: f64,
    pub max_concurrency: usize,
}

/// Diagnostics publication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Mirror diagnostics into the registry
    pub publish_to_registry: bool,
    /// Registry id prefix for mirrored diagnostics
    pub prefix: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Optional console-specific level
    pub console_level: Option<String>,

    /// Optional file-specific level
    pub file_level: Option<String>,

    /// Path to log file (or directory)
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the first default location that exists
    pub fn load() -> Result<Self> {
        let default_paths = [
            "gridshare.yaml",
            "/data/gridshare.yaml",
            "/etc/gridshare/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Ok(Config::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validated connector definitions, in configuration order
    pub fn connector_specs(&self) -> Result<Vec<ConnectorSpec>> {
        let mut seen = HashSet::new();
        let mut specs = Vec::with_capacity(self.connectors.len());
        for (idx, c) in self.connectors.iter().enumerate() {
            if !seen.insert(c.key.as_str()) {
                return Err(GridshareError::validation(
                    format!("connectors[{}].key", c.key),
                    "Duplicate connector key",
                ));
            }
            let spec = ConnectorSpec::from_config(c, idx)?;
            if let Some(station) = &spec.station
                && !self.stations.iter().any(|s| &s.key == station)
            {
                return Err(GridshareError::validation(
                    format!("connectors[{}].station", c.key),
                    format!("Unknown station '{}'", station),
                ));
            }
            specs.push(spec);
        }
        Ok(specs)
    }

    /// Validated station groups
    pub fn station_specs(&self, connectors: &[ConnectorSpec]) -> Result<Vec<StationSpec>> {
        self.stations
            .iter()
            .map(|s| StationSpec::from_config(s, connectors))
            .collect()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.cycle_interval_ms == 0 {
            return Err(GridshareError::validation(
                "cycle_interval_ms",
                "Must be greater than 0",
            ));
        }

        if self.safety.grid_power_dp.trim().is_empty() {
            return Err(GridshareError::validation(
                "safety.grid_power_dp",
                "Grid power datapoint is required",
            ));
        }

        if self.safety.stale_timeout_s == 0 {
            return Err(GridshareError::validation(
                "safety.stale_timeout_s",
                "Must be greater than 0",
            ));
        }

        if !(self.safety.nominal_voltage_v.is_finite() && self.safety.nominal_voltage_v > 0.0) {
            return Err(GridshareError::validation(
                "safety.nominal_voltage_v",
                "Must be positive",
            ));
        }

        if self.safety.phase_current_limit_a.is_some() && self.safety.phase_current_dps.is_empty()
        {
            return Err(GridshareError::validation(
                "safety.phase_current_dps",
                "Phase current cap needs phase current datapoints",
            ));
        }
        check_phase_ids("safety.phase_current_dps", &self.safety.phase_current_dps)?;
        for c in &self.connectors {
            check_phase_ids(
                &format!("connectors[{}].datapoints.phase_currents", c.key),
                &c.datapoints.phase_currents,
            )?;
        }

        for (field, seconds) in [
            ("safety.stale_timeout_s", self.safety.stale_timeout_s),
            ("pv.start_delay_s", self.pv.start_delay_s),
            ("pv.stop_delay_s", self.pv.stop_delay_s),
            ("pv.window_s", self.pv.window_s),
            ("tariff.hold_s", self.tariff.hold_s),
            ("session.keep_s", self.session.keep_s),
            ("session.offline_grace_s", self.session.offline_grace_s),
            ("session.idle_clear_s", self.session.idle_clear_s),
            ("session.boost_timeout_s", self.session.boost_timeout_s),
            ("session.meter_stale_s", self.session.meter_stale_s),
            ("goal.lift_window_s", self.goal.lift_window_s),
            ("scheduler.rotation_interval_s", self.scheduler.rotation_interval_s),
        ] {
            check_duration(field, seconds)?;
        }
        for c in &self.connectors {
            if let Some(timeout) = c.boost_timeout_s {
                check_duration(&format!("connectors[{}].boost_timeout_s", c.key), timeout)?;
            }
        }

        if self.budget.use_external && self.budget.external_dp.is_none() {
            return Err(GridshareError::validation(
                "budget.external_dp",
                "External budget selected without a datapoint",
            ));
        }

        if self.pv.stop_threshold_w > self.pv.start_threshold_w {
            return Err(GridshareError::validation(
                "pv.stop_threshold_w",
                "Stop threshold must not exceed start threshold",
            ));
        }

        if self.pv.window_s == 0 {
            return Err(GridshareError::validation("pv.window_s", "Must be greater than 0"));
        }

        if self.storage.enabled && self.storage.soc_dp.is_none() {
            return Err(GridshareError::validation(
                "storage.soc_dp",
                "Storage assist needs a SoC datapoint",
            ));
        }

        if self.write_queue.max_concurrency == 0 {
            return Err(GridshareError::validation(
                "write_queue.max_concurrency",
                "Must be greater than 0",
            ));
        }

        let mut station_keys = HashSet::new();
        for s in &self.stations {
            if !station_keys.insert(s.key.as_str()) {
                return Err(GridshareError::validation(
                    format!("stations[{}].key", s.key),
                    "Duplicate station key",
                ));
            }
        }

        let connectors = self.connector_specs()?;
        self.station_specs(&connectors)?;

        Ok(())
    }
}
