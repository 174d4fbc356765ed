//! Input edge
//!
//! Reads every configured datapoint once per cycle, coerces the loosely-typed
//! registry values into typed readings and tags each with its age. Freshness
//! policy is left to the engine; this module never decides staleness.

use crate::config::{Config, ConnectorConfig};
use crate::goal::{GoalRequest, GoalStrategy, PriceSignal};
use crate::logging::get_logger;
use crate::model::UserMode;
use crate::registry::{Datapoint, DatapointRegistry, DatapointValue};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// A value together with how old it is
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading<T> {
    pub value: T,
    pub age: Duration,
}

impl<T: Copy> Reading<T> {
    pub fn new(value: T, age: Duration) -> Self {
        Self { value, age }
    }

    /// Value if not older than `max_age`
    pub fn fresh(&self, max_age: Duration) -> Option<T> {
        (self.age <= max_age).then_some(self.value)
    }
}

/// Charger status as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorStatus {
    Available,
    Connected,
    Charging,
    Finished,
    Offline,
    Faulted,
    Unknown,
}

impl ConnectorStatus {
    /// Text labels and numeric codes 0..=5 in declaration order
    pub fn parse(value: &DatapointValue) -> Self {
        match value {
            DatapointValue::Bool(true) => ConnectorStatus::Available,
            DatapointValue::Bool(false) => ConnectorStatus::Offline,
            DatapointValue::Number(n) => match *n as i64 {
                0 => ConnectorStatus::Available,
                1 => ConnectorStatus::Connected,
                2 => ConnectorStatus::Charging,
                3 => ConnectorStatus::Finished,
                4 => ConnectorStatus::Offline,
                5 => ConnectorStatus::Faulted,
                _ => ConnectorStatus::Unknown,
            },
            DatapointValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "available" | "idle" | "disconnected" => ConnectorStatus::Available,
                "connected" | "preparing" | "suspended" | "suspendedev" | "suspendedevse" => {
                    ConnectorStatus::Connected
                }
                "charging" => ConnectorStatus::Charging,
                "finished" | "charged" | "complete" => ConnectorStatus::Finished,
                "offline" | "unavailable" => ConnectorStatus::Offline,
                "faulted" | "fault" | "error" => ConnectorStatus::Faulted,
                _ => ConnectorStatus::Unknown,
            },
        }
    }

    pub fn is_online(&self) -> bool {
        !matches!(self, ConnectorStatus::Offline | ConnectorStatus::Faulted)
    }
}

/// Which configured datapoints could actually be read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MappingHealth {
    pub power: bool,
    pub status: bool,
    pub setpoint: bool,
}

/// Live and runtime inputs of one connector
#[derive(Debug, Clone, Default)]
pub struct ConnectorInput {
    pub key: String,
    pub power_w: Option<Reading<f64>>,
    pub phase_currents_a: Option<Reading<[f64; 3]>>,
    pub status: Option<ConnectorStatus>,
    /// Device-side enable signal
    pub device_enabled: Option<bool>,
    pub user_enabled: Option<bool>,
    pub mode: Option<UserMode>,
    pub user_limit_w: Option<f64>,
    pub goal: Option<GoalRequest>,
    pub restored_charging_since: Option<DateTime<Utc>>,
    pub restored_boost_since: Option<DateTime<Utc>>,
    pub mapping: MappingHealth,
}

impl ConnectorInput {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            ..Default::default()
        }
    }

    /// Missing status counts as online
    pub fn online(&self) -> bool {
        self.status.is_none_or(|s| s.is_online())
    }
}

/// Plant-wide inputs
#[derive(Debug, Clone, Default)]
pub struct PlantInput {
    pub grid_power_w: Option<Reading<f64>>,
    pub phase_currents_a: Option<Reading<[f64; 3]>>,
    pub external_budget_w: Option<Reading<f64>>,
    pub pv_surplus_w: Option<Reading<f64>>,
    pub peak_shaving_active: Option<bool>,
    pub peak_budget_w: Option<Reading<f64>>,
    pub grid_charge_allowed: Option<bool>,
    pub discharge_allowed: Option<bool>,
    pub regulatory_cap_w: Option<f64>,
    pub storage_soc_pct: Option<f64>,
    pub storage_discharge_allowed: Option<bool>,
    pub storage_paused: Option<bool>,
    pub global_pv_only: Option<bool>,
    pub price: Option<PriceSignal>,
}

/// Everything one engine step consumes
#[derive(Debug, Clone, Default)]
pub struct CycleInputs {
    pub plant: PlantInput,
    pub connectors: Vec<ConnectorInput>,
}

impl CycleInputs {
    pub fn connector(&self, key: &str) -> Option<&ConnectorInput> {
        self.connectors.iter().find(|c| c.key == key)
    }
}

/// Parse a timestamp given as epoch seconds, epoch milliseconds or RFC 3339
pub fn parse_timestamp(value: &DatapointValue) -> Option<DateTime<Utc>> {
    match value {
        DatapointValue::Number(n) if n.is_finite() && *n > 0.0 => {
            // Anything past year 5138 in seconds is treated as milliseconds
            let secs = if *n > 1e11 { *n / 1000.0 } else { *n };
            DateTime::from_timestamp(secs as i64, 0)
        }
        DatapointValue::Text(s) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<f64>() {
                return parse_timestamp(&DatapointValue::Number(n));
            }
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }
        _ => None,
    }
}

/// Reads one cycle's inputs from a registry
pub struct InputReader<'a> {
    registry: &'a dyn DatapointRegistry,
    fetch_timeout: std::time::Duration,
    now: DateTime<Utc>,
    logger: crate::logging::StructuredLogger,
}

impl<'a> InputReader<'a> {
    pub fn new(registry: &'a dyn DatapointRegistry, fetch_timeout_ms: u64, now: DateTime<Utc>) -> Self {
        Self {
            registry,
            fetch_timeout: std::time::Duration::from_millis(fetch_timeout_ms),
            now,
            logger: get_logger("inputs"),
        }
    }

    /// Cache first, then a bounded fetch. Failures read as missing.
    pub async fn datapoint(&self, id: &str) -> Option<Datapoint> {
        if let Some(dp) = self.registry.cached(id) {
            return Some(dp);
        }
        match tokio::time::timeout(self.fetch_timeout, self.registry.fetch(id)).await {
            Ok(Ok(dp)) => dp,
            Ok(Err(e)) => {
                self.logger.debug(&format!("Fetch of {} failed: {}", id, e));
                None
            }
            Err(_) => {
                self.logger.debug(&format!("Fetch of {} timed out", id));
                None
            }
        }
    }

    async fn raw(&self, id: Option<&str>) -> Option<Datapoint> {
        match id {
            Some(id) if !id.is_empty() => self.datapoint(id).await,
            _ => None,
        }
    }

    pub async fn number(&self, id: Option<&str>) -> Option<Reading<f64>> {
        let dp = self.raw(id).await?;
        let value = dp.value.as_f64()?;
        Some(Reading::new(value, dp.age(self.now)))
    }

    pub async fn flag(&self, id: Option<&str>) -> Option<bool> {
        self.raw(id).await?.value.as_bool()
    }

    async fn value(&self, id: Option<&str>) -> Option<f64> {
        self.number(id).await.map(|r| r.value)
    }

    async fn text(&self, id: Option<&str>) -> Option<String> {
        self.raw(id).await.map(|dp| dp.value.as_text())
    }

    async fn timestamp(&self, id: Option<&str>) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.raw(id).await?.value)
    }

    /// Three phase currents; the oldest age wins. Partial sets read as missing.
    pub async fn phases(&self, ids: &[String]) -> Option<Reading<[f64; 3]>> {
        if ids.len() != 3 {
            return None;
        }
        let mut values = [0.0; 3];
        let mut age = Duration::zero();
        for (i, id) in ids.iter().enumerate() {
            let r = self.number(Some(id.as_str())).await?;
            values[i] = r.value;
            age = age.max(r.age);
        }
        Some(Reading::new(values, age))
    }

    pub async fn read_plant(&self, config: &Config) -> PlantInput {
        let price = match (
            self.value(config.goal.price_now_dp.as_deref()).await,
            self.value(config.goal.price_avg_dp.as_deref()).await,
        ) {
            (Some(now), Some(average)) => Some(PriceSignal { now, average }),
            _ => None,
        };
        let regulatory_signal = self.value(config.safety.regulatory_cap_dp.as_deref()).await;

        PlantInput {
            grid_power_w: self.number(Some(config.safety.grid_power_dp.as_str())).await,
            phase_currents_a: self.phases(&config.safety.phase_current_dps).await,
            external_budget_w: self.number(config.budget.external_dp.as_deref()).await,
            pv_surplus_w: self.number(config.pv.surplus_dp.as_deref()).await,
            peak_shaving_active: self.flag(config.budget.peak_shaving.active_dp.as_deref()).await,
            peak_budget_w: self.number(config.budget.peak_shaving.budget_dp.as_deref()).await,
            grid_charge_allowed: self.flag(config.tariff.grid_charge_allowed_dp.as_deref()).await,
            discharge_allowed: self.flag(config.tariff.discharge_allowed_dp.as_deref()).await,
            regulatory_cap_w: regulatory_signal.or(config.safety.regulatory_cap_w),
            storage_soc_pct: self.value(config.storage.soc_dp.as_deref()).await,
            storage_discharge_allowed: self
                .flag(config.storage.discharge_allowed_dp.as_deref())
                .await,
            storage_paused: self.flag(config.storage.paused_dp.as_deref()).await,
            global_pv_only: self.flag(config.pv.global_pv_only_dp.as_deref()).await,
            price,
        }
    }

    pub async fn read_connector(&self, cfg: &ConnectorConfig) -> ConnectorInput {
        let dps = &cfg.datapoints;
        let power_w = self.number(dps.power.as_deref()).await;
        let status_raw = self.raw(dps.status.as_deref()).await;
        let status = status_raw.as_ref().map(|dp| ConnectorStatus::parse(&dp.value));
        let mode = match self.text(dps.mode.as_deref()).await {
            Some(raw) => {
                let parsed = UserMode::parse(&raw);
                if parsed.is_none() {
                    self.logger
                        .for_connector(&cfg.key)
                        .warn(&format!("Unknown mode '{}', using auto", raw));
                }
                parsed
            }
            None => None,
        };

        let setpoint = match cfg.control_basis {
            crate::model::ControlBasis::Current => dps.setpoint_current.is_some(),
            crate::model::ControlBasis::Power => dps.setpoint_power.is_some(),
            crate::model::ControlBasis::None => false,
        };

        ConnectorInput {
            key: cfg.key.clone(),
            power_w,
            phase_currents_a: self.phases(&dps.phase_currents).await,
            status,
            device_enabled: self.flag(dps.enable.as_deref()).await,
            user_enabled: self.flag(dps.user_enabled.as_deref()).await,
            mode,
            user_limit_w: self
                .value(dps.user_limit_w.as_deref())
                .await
                .filter(|l| *l > 0.0),
            goal: self.read_goal(cfg).await,
            restored_charging_since: self.timestamp(dps.charging_since.as_deref()).await,
            restored_boost_since: self.timestamp(dps.boost_since.as_deref()).await,
            mapping: MappingHealth {
                power: power_w.is_some(),
                status: status_raw.is_some(),
                setpoint,
            },
        }
    }

    async fn read_goal(&self, cfg: &ConnectorConfig) -> Option<GoalRequest> {
        let dps = &cfg.datapoints;
        if !self.flag(dps.goal_enabled.as_deref()).await.unwrap_or(false) {
            return None;
        }
        let request = GoalRequest {
            battery_kwh: self.value(dps.goal_battery_kwh.as_deref()).await?,
            soc_pct: self.value(dps.goal_soc.as_deref()).await?,
            target_soc_pct: self.value(dps.goal_target_soc.as_deref()).await?,
            deadline: self.timestamp(dps.goal_deadline.as_deref()).await?,
            strategy: self
                .text(dps.goal_strategy.as_deref())
                .await
                .map_or(GoalStrategy::Plain, |s| GoalStrategy::parse(&s)),
        };
        Some(request)
    }

    pub async fn read_cycle(&self, config: &Config) -> CycleInputs {
        let plant = self.read_plant(config).await;
        let mut connectors = Vec::with_capacity(config.connectors.len());
        for cfg in &config.connectors {
            connectors.push(self.read_connector(cfg).await);
        }
        CycleInputs { plant, connectors }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectorDatapoints;
    use crate::registry::MemoryRegistry;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn status_parsing() {
        assert!(!ConnectorStatus::parse(&"Faulted".into()).is_online());
        assert!(!ConnectorStatus::parse(&DatapointValue::Number(4.0)).is_online());
        assert_eq!(ConnectorStatus::parse(&"charging".into()), ConnectorStatus::Charging);
        assert!(ConnectorStatus::parse(&"whatever".into()).is_online());
        assert!(ConnectorInput::new("a").online());
    }

    #[test]
    fn timestamps_accept_seconds_millis_and_rfc3339() {
        let expect = now();
        assert_eq!(parse_timestamp(&DatapointValue::Number(1_700_000_000.0)), Some(expect));
        assert_eq!(
            parse_timestamp(&DatapointValue::Number(1_700_000_000_000.0)),
            Some(expect)
        );
        assert_eq!(parse_timestamp(&"2023-11-14T22:13:20Z".into()), Some(expect));
        assert_eq!(parse_timestamp(&"soon".into()), None);
    }

    #[tokio::test]
    async fn readings_carry_age_and_fall_back_to_fetch() {
        let reg = MemoryRegistry::new();
        reg.set("grid.power", 1500.0, now() - Duration::seconds(4));
        reg.set_uncached("grid.l1", 10.0, now());
        reg.set_uncached("grid.l2", 11.0, now() - Duration::seconds(2));
        reg.set("grid.l3", 9.0, now());
        let reader = InputReader::new(&reg, 250, now());

        let grid = reader.number(Some("grid.power")).await.unwrap();
        assert_eq!(grid.value, 1500.0);
        assert_eq!(grid.age, Duration::seconds(4));
        assert_eq!(grid.fresh(Duration::seconds(3)), None);

        let ids: Vec<String> = ["grid.l1", "grid.l2", "grid.l3"].iter().map(|s| s.to_string()).collect();
        let phases = reader.phases(&ids).await.unwrap();
        assert_eq!(phases.value, [10.0, 11.0, 9.0]);
        assert_eq!(phases.age, Duration::seconds(2));

        assert!(reader.phases(&ids[..2]).await.is_none());
        assert!(reader.number(Some("missing")).await.is_none());
    }

    #[tokio::test]
    async fn connector_goal_requires_all_parameters() {
        let reg = MemoryRegistry::new();
        reg.set("a.goal", true, now());
        reg.set("a.soc", 40.0, now());
        reg.set("a.target", 80.0, now());
        reg.set("a.kwh", 60.0, now());
        reg.set("a.mode", "pv_only", now());
        let mut cfg = ConnectorConfig {
            key: "a".into(),
            datapoints: ConnectorDatapoints {
                goal_enabled: Some("a.goal".into()),
                goal_soc: Some("a.soc".into()),
                goal_target_soc: Some("a.target".into()),
                goal_battery_kwh: Some("a.kwh".into()),
                goal_deadline: Some("a.deadline".into()),
                mode: Some("a.mode".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let reader = InputReader::new(&reg, 50, now());
        let input = reader.read_connector(&cfg).await;
        assert!(input.goal.is_none());
        assert_eq!(input.mode, Some(UserMode::PvOnly));

        reg.set("a.deadline", "2023-11-15T00:13:20Z", now());
        cfg.datapoints.goal_strategy = None;
        let input = reader.read_connector(&cfg).await;
        let goal = input.goal.unwrap();
        assert_eq!(goal.strategy, GoalStrategy::Plain);
        assert_eq!(goal.deadline, now() + Duration::hours(2));
    }
}
