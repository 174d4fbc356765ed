//! Debounced tariff permissions
//!
//! A revoked permission applies immediately; a granted one must hold
//! continuously for the configured hold time before it takes effect.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// One debounced boolean permission
#[derive(Debug, Clone, Default, Serialize)]
pub struct DebouncedFlag {
    value: Option<bool>,
    true_since: Option<DateTime<Utc>>,
}

impl DebouncedFlag {
    /// Feed the raw signal. `None` means "no fresh observation" and keeps
    /// the current value.
    pub fn update(&mut self, raw: Option<bool>, now: DateTime<Utc>, hold: Duration) -> bool {
        match (raw, self.value) {
            (None, _) => {}
            // First observation applies as-is
            (Some(v), None) => {
                self.value = Some(v);
                self.true_since = None;
            }
            (Some(false), Some(_)) => {
                self.value = Some(false);
                self.true_since = None;
            }
            (Some(true), Some(true)) => {
                self.true_since = None;
            }
            (Some(true), Some(false)) => {
                let since = *self.true_since.get_or_insert(now);
                if now - since >= hold {
                    self.value = Some(true);
                    self.true_since = None;
                }
            }
        }
        self.value.unwrap_or(true)
    }

    /// Current value; an unobserved permission counts as granted
    pub fn value(&self) -> bool {
        self.value.unwrap_or(true)
    }
}

/// Both tariff permissions tracked across cycles
#[derive(Debug, Clone, Default, Serialize)]
pub struct TariffPermissions {
    pub grid_charge: DebouncedFlag,
    pub discharge: DebouncedFlag,
}

impl TariffPermissions {
    pub fn update(
        &mut self,
        grid_charge_raw: Option<bool>,
        discharge_raw: Option<bool>,
        now: DateTime<Utc>,
        hold: Duration,
    ) -> (bool, bool) {
        (
            self.grid_charge.update(grid_charge_raw, now, hold),
            self.discharge.update(discharge_raw, now, hold),
        )
    }

    /// Whether the tariff forces grid-free (PV-only) charging for `auto`
    pub fn forces_pv(&self) -> bool {
        !self.grid_charge.value()
    }
}
