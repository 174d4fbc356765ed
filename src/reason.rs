//! Closed vocabulary of per-connector allocation outcomes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a connector received the setpoint it did this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    /// Received what it asked for (or what the soft budget allowed)
    Allocated,
    /// Ceiling left something below the technical minimum
    BelowMin,
    /// Total budget exhausted
    NoBudget,
    /// PV-sourced mode without enough surplus
    NoPvSurplus,
    /// Shared station ceiling was the limiting factor
    LimitedByStationCap,
    /// Grid-import safety cap was the limiting factor
    LimitedByGridImport,
    /// Phase-current safety cap was the limiting factor
    LimitedByPhaseCap,
    /// Regulatory curtailment (§14a EnWG) was the limiting factor
    #[serde(rename = "LIMITED_BY_14A")]
    LimitedBy14a,
    /// User-configured connector limit was the limiting factor
    LimitedByUserLimit,
    /// No ceiling applied at all; connector runs at its own maximum
    Unlimited,
    /// No usable control basis, nothing can be commanded
    NoSetpoint,
    /// Safety-relevant input stale, whole cycle failed safe
    StaleMeter,
    /// Disabled by user or installer
    Disabled,
    /// Connector reported offline or faulted
    Offline,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Allocated => "ALLOCATED",
            Reason::BelowMin => "BELOW_MIN",
            Reason::NoBudget => "NO_BUDGET",
            Reason::NoPvSurplus => "NO_PV_SURPLUS",
            Reason::LimitedByStationCap => "LIMITED_BY_STATION_CAP",
            Reason::LimitedByGridImport => "LIMITED_BY_GRID_IMPORT",
            Reason::LimitedByPhaseCap => "LIMITED_BY_PHASE_CAP",
            Reason::LimitedBy14a => "LIMITED_BY_14A",
            Reason::LimitedByUserLimit => "LIMITED_BY_USER_LIMIT",
            Reason::Unlimited => "UNLIMITED",
            Reason::NoSetpoint => "NO_SETPOINT",
            Reason::StaleMeter => "STALE_METER",
            Reason::Disabled => "DISABLED",
            Reason::Offline => "OFFLINE",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_names_match_display() {
        for r in [
            Reason::Allocated,
            Reason::LimitedBy14a,
            Reason::NoPvSurplus,
            Reason::StaleMeter,
        ] {
            let json = serde_json::to_string(&r).unwrap();
            assert_eq!(json, format!("\"{}\"", r.as_str()));
        }
    }
}
