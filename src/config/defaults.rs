use super::*;

impl Default for Config {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 1000,
            connectors: Vec::new(),
            stations: Vec::new(),
            budget: BudgetConfig::default(),
            pv: PvConfig::default(),
            safety: SafetyConfig::default(),
            tariff: TariffConfig::default(),
            storage: StorageConfig::default(),
            session: SessionConfig::default(),
            goal: GoalConfig::default(),
            scheduler: SchedulerConfig::default(),
            registry: RegistryConfig::default(),
            write_queue: WriteQueueConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            name: None,
            kind: ChargerKind::Ac,
            phases: 3,
            grid_phase: None,
            voltage_v: 230.0,
            min_current_a: None,
            max_current_a: None,
            min_power_w: None,
            max_power_w: None,
            control_basis: ControlBasis::Current,
            priority: 100,
            allow_boost: true,
            enabled: true,
            station: None,
            connector_no: None,
            step: None,
            max_delta_w: None,
            boost_timeout_s: None,
            datapoints: ConnectorDatapoints::default(),
        }
    }
}

impl Default for PvConfig {
    fn default() -> Self {
        Self {
            start_threshold_w: 1400.0,
            stop_threshold_w: 800.0,
            start_delay_s: 60,
            stop_delay_s: 120,
            abort_import_w: Some(2000.0),
            window_s: 300,
            surplus_dp: None,
            global_pv_only_dp: None,
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            grid_power_dp: "grid.power".to_string(),
            grid_import_limit_w: None,
            phase_current_dps: Vec::new(),
            phase_current_limit_a: None,
            regulatory_cap_w: None,
            regulatory_cap_dp: None,
            stale_timeout_s: 10,
            nominal_voltage_v: 230.0,
        }
    }
}

impl Default for TariffConfig {
    fn default() -> Self {
        Self {
            grid_charge_allowed_dp: None,
            discharge_allowed_dp: None,
            max_power_w: None,
            hold_s: 300,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            soc_dp: None,
            discharge_allowed_dp: None,
            paused_dp: None,
            min_soc_pct: 30.0,
            soc_hysteresis_pct: 5.0,
            max_discharge_w: 3000.0,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            activity_threshold_w: 200.0,
            keep_s: 120,
            offline_grace_s: 60,
            idle_clear_s: 3600,
            boost_timeout_s: 4 * 3600,
            meter_stale_s: 15,
        }
    }
}

impl Default for GoalConfig {
    fn default() -> Self {
        Self {
            lift_window_s: 3600,
            lift_urgency: 0.8,
            smart_price_factor: 1.5,
            price_now_dp: None,
            price_avg_dp: None,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rotation_interval_s: 10,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 250,
        }
    }
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 1000,
            refresh_interval_ms: 30_000,
            deadband_w: 50.0,
            deadband_a: 0.1,
            max_concurrency: 4,
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            publish_to_registry: false,
            prefix: "gridshare".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/tmp/gridshare.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}
