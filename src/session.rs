//! Charging session tracking
//!
//! Tracks per-connector charging activity across cycles: when a session
//! started, when the connector was last seen drawing power, boost timers and
//! the last command sent. Sessions are sticky across short dips and brief
//! offline periods.

use crate::config::{SessionConfig, duration_s};
use crate::logging::get_logger;
use crate::mode::EffectiveMode;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Cross-cycle state of one connector
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionState {
    /// Unique session ID while a session is running
    pub id: Option<String>,
    pub charging_since: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
    pub boost_since: Option<DateTime<Utc>>,
    pub boost_expired: bool,
    pub offline_since: Option<DateTime<Utc>>,
    pub last_commanded_w: f64,
    pub last_commanded_a: f64,
    pub last_mode: Option<EffectiveMode>,
}

/// What the tracker needs to know about a connector this cycle
#[derive(Debug, Clone, Default)]
pub struct SessionObservation {
    pub enabled: bool,
    pub online: bool,
    /// Fresh measured power; `None` when the meter is stale or missing
    pub power_w: Option<f64>,
    /// Boost requested and permitted
    pub boost_requested: bool,
    pub boost_timeout: Duration,
    /// Externally persisted timers, adopted on first encounter
    pub restored_charging_since: Option<DateTime<Utc>>,
    pub restored_boost_since: Option<DateTime<Utc>>,
}

/// Per-cycle summary handed to the scheduler and allocator
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SessionView {
    pub charging_now: bool,
    pub in_session: bool,
    pub session_start: Option<DateTime<Utc>>,
    pub boost_since: Option<DateTime<Utc>>,
    pub boost_expired: bool,
    pub boost_remaining_s: Option<i64>,
    pub last_commanded_w: f64,
}

/// Session manager for all connectors
#[derive(Debug, Clone)]
pub struct SessionTracker {
    config: SessionConfig,
    sessions: HashMap<String, SessionState>,
    logger: crate::logging::StructuredLogger,
}

impl SessionTracker {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
            logger: get_logger("session"),
        }
    }

    pub fn get(&self, key: &str) -> Option<&SessionState> {
        self.sessions.get(key)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Last commanded power, zero for unknown connectors
    pub fn last_commanded_w(&self, key: &str) -> f64 {
        self.sessions.get(key).map_or(0.0, |s| s.last_commanded_w)
    }

    /// Charging detection: |power| over the activity threshold, falling back
    /// to the last command when the meter is stale.
    pub fn is_charging(&self, key: &str, obs: &SessionObservation) -> bool {
        if !(obs.enabled && obs.online) {
            return false;
        }
        let power = obs
            .power_w
            .map_or_else(|| self.last_commanded_w(key), f64::abs);
        power >= self.config.activity_threshold_w
    }

    /// Advance one connector's session by one cycle
    pub fn observe(&mut self, key: &str, obs: &SessionObservation, now: DateTime<Utc>) -> SessionView {
        if !obs.enabled {
            if let Some(state) = self.sessions.remove(key)
                && let Some(id) = state.id
            {
                self.logger
                    .for_connector(key)
                    .info(&format!("Ended charging session {} (disabled)", id));
            }
            return SessionView::default();
        }

        let charging_now = self.is_charging(key, obs);
        let first_encounter = !self.sessions.contains_key(key);
        let has_restored =
            obs.restored_charging_since.is_some() || obs.restored_boost_since.is_some();
        if first_encounter && !(charging_now || has_restored) {
            return SessionView::default();
        }

        let keep = duration_s(self.config.keep_s);
        let offline_grace = duration_s(self.config.offline_grace_s);
        let logger = self.logger.for_connector(key);
        let state = self.sessions.entry(key.to_string()).or_default();

        if first_encounter && obs.restored_charging_since.is_some() {
            state.charging_since = obs.restored_charging_since;
            state.last_active = Some(now);
            state.id = Some(uuid::Uuid::new_v4().to_string());
        }

        // Offline grace
        if obs.online {
            state.offline_since = None;
        } else {
            let since = *state.offline_since.get_or_insert(now);
            if state.charging_since.is_some() && now - since > offline_grace {
                end_session(state, &logger, "offline");
            }
        }

        if charging_now {
            state.last_active = Some(now);
            if state.charging_since.is_none() {
                let id = uuid::Uuid::new_v4().to_string();
                logger.info(&format!("Started charging session {}", id));
                state.charging_since = Some(now);
                state.id = Some(id);
            }
        } else if state.charging_since.is_some()
            && state.last_active.is_none_or(|last| now - last > keep)
        {
            end_session(state, &logger, "inactive");
        }

        // Boost timer: starts with first activity, expires after the timeout
        if obs.boost_requested {
            if state.boost_since.is_none() {
                if first_encounter && obs.restored_boost_since.is_some() {
                    state.boost_since = obs.restored_boost_since;
                } else if charging_now {
                    state.boost_since = Some(now);
                }
            }
            if let Some(since) = state.boost_since
                && !state.boost_expired
                && now - since >= obs.boost_timeout
            {
                state.boost_expired = true;
                logger.info("Boost timed out; reverting to auto");
            }
        } else {
            state.boost_since = None;
            state.boost_expired = false;
        }

        let boost_remaining_s = match (obs.boost_requested, state.boost_since) {
            (true, Some(since)) if !state.boost_expired => {
                Some((obs.boost_timeout - (now - since)).num_seconds().max(0))
            }
            _ => None,
        };

        SessionView {
            charging_now,
            in_session: state.charging_since.is_some(),
            session_start: state.charging_since,
            boost_since: state.boost_since,
            boost_expired: state.boost_expired,
            boost_remaining_s,
            last_commanded_w: state.last_commanded_w,
        }
    }

    /// Remember the final command for ramping and stale-meter fallback
    pub fn record_command(&mut self, key: &str, power_w: f64, current_a: f64, mode: Option<EffectiveMode>) {
        if power_w <= 0.0 && !self.sessions.contains_key(key) {
            return;
        }
        let state = self.sessions.entry(key.to_string()).or_default();
        state.last_commanded_w = power_w.max(0.0);
        state.last_commanded_a = current_a.max(0.0);
        if mode.is_some() {
            state.last_mode = mode;
        }
    }

    /// Drop idle state and connectors no longer configured
    pub fn prune(&mut self, configured: &HashSet<&str>, now: DateTime<Utc>) {
        let idle = duration_s(self.config.idle_clear_s);
        let before = self.sessions.len();
        self.sessions.retain(|key, s| {
            if !configured.contains(key.as_str()) {
                return false;
            }
            let busy = s.charging_since.is_some()
                || s.boost_since.is_some()
                || s.last_commanded_w > 0.0;
            busy || s.last_active.is_some_and(|last| now - last <= idle)
        });
        let dropped = before - self.sessions.len();
        if dropped > 0 {
            self.logger
                .debug(&format!("Dropped {} idle session state(s)", dropped));
        }
    }
}

fn end_session(state: &mut SessionState, logger: &crate::logging::StructuredLogger, why: &str) {
    if let Some(id) = state.id.take() {
        logger.info(&format!("Ended charging session {} ({})", id, why));
    }
    state.charging_since = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn obs(power: Option<f64>) -> SessionObservation {
        SessionObservation {
            enabled: true,
            online: true,
            power_w: power,
            boost_timeout: Duration::seconds(600),
            ..Default::default()
        }
    }

    fn tracker() -> SessionTracker {
        SessionTracker::new(SessionConfig {
            activity_threshold_w: 200.0,
            keep_s: 30,
            offline_grace_s: 20,
            idle_clear_s: 100,
            ..Default::default()
        })
    }

    #[test]
    fn brief_dip_keeps_session() {
        let mut tr = tracker();
        let v = tr.observe("a", &obs(Some(3000.0)), t(0));
        assert!(v.in_session);
        assert_eq!(v.session_start, Some(t(0)));
        let v = tr.observe("a", &obs(Some(0.0)), t(20));
        assert!(v.in_session);
        assert!(!v.charging_now);
        let v = tr.observe("a", &obs(Some(0.0)), t(31));
        assert!(!v.in_session);
    }

    #[test]
    fn stale_meter_falls_back_to_last_command() {
        let mut tr = tracker();
        tr.record_command("a", 4000.0, 5.8, Some(EffectiveMode::Normal));
        assert!(tr.is_charging("a", &obs(None)));
        tr.record_command("a", 0.0, 0.0, None);
        assert!(!tr.is_charging("a", &obs(None)));
    }

    #[test]
    fn offline_grace_ends_session() {
        let mut tr = tracker();
        tr.observe("a", &obs(Some(3000.0)), t(0));
        let mut off = obs(Some(0.0));
        off.online = false;
        assert!(tr.observe("a", &off, t(1)).in_session);
        assert!(tr.observe("a", &off, t(21)).in_session);
        assert!(!tr.observe("a", &off, t(22)).in_session);
    }

    #[test]
    fn boost_timer_starts_on_activity_and_expires() {
        let mut tr = tracker();
        let mut o = obs(Some(0.0));
        o.boost_requested = true;
        let v = tr.observe("a", &o, t(0));
        assert!(v.boost_since.is_none());

        o.power_w = Some(5000.0);
        let v = tr.observe("a", &o, t(10));
        assert_eq!(v.boost_since, Some(t(10)));
        assert_eq!(v.boost_remaining_s, Some(600));

        let v = tr.observe("a", &o, t(610));
        assert!(v.boost_expired);

        o.boost_requested = false;
        let v = tr.observe("a", &o, t(611));
        assert!(!v.boost_expired);
        assert!(v.boost_since.is_none());
    }

    #[test]
    fn restored_timers_are_adopted_on_first_encounter() {
        let mut tr = tracker();
        let mut o = obs(Some(3000.0));
        o.boost_requested = true;
        o.restored_charging_since = Some(t(-500));
        o.restored_boost_since = Some(t(-300));
        let v = tr.observe("a", &o, t(0));
        assert_eq!(v.session_start, Some(t(-500)));
        assert_eq!(v.boost_since, Some(t(-300)));
        assert_eq!(v.boost_remaining_s, Some(300));
    }

    #[test]
    fn disable_clears_and_prune_drops_idle() {
        let mut tr = tracker();
        tr.observe("a", &obs(Some(3000.0)), t(0));
        let mut off = obs(Some(3000.0));
        off.enabled = false;
        tr.observe("a", &off, t(1));
        assert!(tr.get("a").is_none());

        tr.observe("b", &obs(Some(3000.0)), t(0));
        tr.observe("b", &obs(Some(0.0)), t(40));
        let configured: HashSet<&str> = ["b"].into_iter().collect();
        tr.prune(&configured, t(50));
        assert!(tr.get("b").is_some());
        tr.prune(&configured, t(200));
        assert!(tr.get("b").is_none());
    }
}
