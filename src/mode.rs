//! Effective charging mode resolution

use crate::model::UserMode;
use serde::Serialize;

/// Mode the allocator actually applies this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EffectiveMode {
    /// Grid + PV, bounded by budget
    Normal,
    /// PV surplus only
    PvOnly,
    /// Technical minimum from the grid, excess from PV
    MinPlusPv,
    /// Prioritised, exempt from tariff restrictions
    Boost,
}

impl EffectiveMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectiveMode::Normal => "normal",
            EffectiveMode::PvOnly => "pv-only",
            EffectiveMode::MinPlusPv => "min-plus-pv",
            EffectiveMode::Boost => "boost",
        }
    }

    pub fn uses_pv_pool(&self) -> bool {
        matches!(self, EffectiveMode::PvOnly | EffectiveMode::MinPlusPv)
    }
}

/// Inputs that can override a requested mode
#[derive(Debug, Clone, Copy, Default)]
pub struct ModeContext {
    pub allow_boost: bool,
    pub boost_expired: bool,
    pub global_pv_only: bool,
    /// Tariff forbids grid charging (after any goal lift)
    pub tariff_forced_pv: bool,
}

/// Resolve the requested mode against permissions and plant-wide flags.
///
/// Order: global PV-only wins over everything; boost falls back to `auto`
/// when not permitted or timed out; the tariff only ever converts `auto`.
pub fn resolve_mode(requested: UserMode, ctx: &ModeContext) -> EffectiveMode {
    if ctx.global_pv_only {
        return EffectiveMode::PvOnly;
    }
    let requested = match requested {
        UserMode::Boost if !ctx.allow_boost || ctx.boost_expired => UserMode::Auto,
        other => other,
    };
    match requested {
        UserMode::Boost => EffectiveMode::Boost,
        UserMode::PvOnly => EffectiveMode::PvOnly,
        UserMode::MinPlusPv => EffectiveMode::MinPlusPv,
        UserMode::Auto if ctx.tariff_forced_pv => EffectiveMode::PvOnly,
        UserMode::Auto => EffectiveMode::Normal,
    }
}
