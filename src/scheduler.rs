//! Deterministic allocation order
//!
//! Connectors are sorted with a fixed comparator chain, then non-boost,
//! non-goal members of each station take turns at the front of their
//! station's slots so one car cannot starve its neighbour indefinitely.
//!
//! Rotation runs over a fixed member order (priority, config order, key).
//! Charging state and session start change as a direct result of the
//! previous allocation, so they only decide which slots the station holds,
//! never which member fills them.

use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Deadline ranking of a goal-active connector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GoalRank {
    pub deadline: DateTime<Utc>,
    pub urgency: f64,
}

/// Everything the comparator looks at for one connector
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    pub key: String,
    pub station: Option<String>,
    pub boost: bool,
    pub goal: Option<GoalRank>,
    pub charging: bool,
    pub session_start: Option<DateTime<Utc>>,
    pub priority: u16,
    pub config_order: usize,
}

impl ScheduleEntry {
    fn rotatable(&self) -> bool {
        !self.boost && self.goal.is_none()
    }

    /// Member order inside a station's rotation
    fn rotation_key(&self) -> (u16, usize, &str) {
        (self.priority, self.config_order, self.key.as_str())
    }
}

/// Comparator chain; the first mismatch decides
pub fn compare_entries(a: &ScheduleEntry, b: &ScheduleEntry) -> Ordering {
    // Boost first
    b.boost
        .cmp(&a.boost)
        // Goal-active first, earlier deadline, then higher urgency
        .then_with(|| match (&a.goal, &b.goal) {
            (Some(ga), Some(gb)) => ga.deadline.cmp(&gb.deadline).then_with(|| {
                gb.urgency
                    .partial_cmp(&ga.urgency)
                    .unwrap_or(Ordering::Equal)
            }),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        // Currently charging first
        .then_with(|| b.charging.cmp(&a.charging))
        // Earlier session start first; connectors without a session last
        .then_with(|| match (a.session_start, b.session_start) {
            (Some(sa), Some(sb)) => sa.cmp(&sb),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.priority.cmp(&b.priority))
        .then_with(|| a.config_order.cmp(&b.config_order))
        .then_with(|| a.key.cmp(&b.key))
}

#[derive(Debug, Clone, Default)]
struct RotationSlot {
    offset: usize,
    last_rotated: Option<DateTime<Utc>>,
}

/// Orders connectors each cycle and owns the station rotation state
#[derive(Debug, Clone)]
pub struct PriorityScheduler {
    interval: Duration,
    rotation: HashMap<String, RotationSlot>,
}

impl PriorityScheduler {
    pub fn new(rotation_interval: Duration) -> Self {
        Self {
            interval: rotation_interval,
            rotation: HashMap::new(),
        }
    }

    pub fn order(&mut self, mut entries: Vec<ScheduleEntry>, now: DateTime<Utc>) -> Vec<ScheduleEntry> {
        entries.sort_by(compare_entries);

        let mut stations: Vec<String> = entries
            .iter()
            .filter_map(|e| e.station.clone())
            .collect();
        stations.sort();
        stations.dedup();

        for station in stations {
            let slots: Vec<usize> = entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.station.as_deref() == Some(station.as_str()) && e.rotatable())
                .map(|(i, _)| i)
                .collect();
            if slots.len() < 2 {
                continue;
            }

            let slot = self.rotation.entry(station).or_default();
            match slot.last_rotated {
                None => slot.last_rotated = Some(now),
                Some(last) if now - last >= self.interval => {
                    slot.offset = slot.offset.wrapping_add(1);
                    slot.last_rotated = Some(now);
                }
                Some(_) => {}
            }

            let offset = slot.offset % slots.len();
            let mut members: Vec<ScheduleEntry> = slots.iter().map(|&i| entries[i].clone()).collect();
            members.sort_by(|a, b| a.rotation_key().cmp(&b.rotation_key()));
            for (j, &i) in slots.iter().enumerate() {
                entries[i] = members[(j + offset) % members.len()].clone();
            }
        }

        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn entry(key: &str, order: usize) -> ScheduleEntry {
        ScheduleEntry {
            key: key.to_string(),
            station: None,
            boost: false,
            goal: None,
            charging: false,
            session_start: None,
            priority: 100,
            config_order: order,
        }
    }

    fn keys(entries: &[ScheduleEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.key.as_str()).collect()
    }

    #[test]
    fn comparator_chain_precedence() {
        let mut sched = PriorityScheduler::new(Duration::seconds(10));
        let boost = ScheduleEntry {
            boost: true,
            ..entry("boost", 5)
        };
        let goal_late = ScheduleEntry {
            goal: Some(GoalRank {
                deadline: t(7200),
                urgency: 0.9,
            }),
            ..entry("goal_late", 4)
        };
        let goal_early = ScheduleEntry {
            goal: Some(GoalRank {
                deadline: t(3600),
                urgency: 0.1,
            }),
            ..entry("goal_early", 3)
        };
        let charging = ScheduleEntry {
            charging: true,
            session_start: Some(t(0)),
            ..entry("charging", 2)
        };
        let high_prio = ScheduleEntry {
            priority: 1,
            ..entry("high_prio", 1)
        };
        let plain = entry("plain", 0);

        let ordered = sched.order(
            vec![plain, high_prio, charging, goal_early, goal_late, boost],
            t(0),
        );
        assert_eq!(
            keys(&ordered),
            vec!["boost", "goal_early", "goal_late", "charging", "high_prio", "plain"]
        );
    }

    #[test]
    fn earlier_session_and_config_order_break_ties() {
        let mut sched = PriorityScheduler::new(Duration::seconds(10));
        let a = ScheduleEntry {
            charging: true,
            session_start: Some(t(100)),
            ..entry("a", 0)
        };
        let b = ScheduleEntry {
            charging: true,
            session_start: Some(t(50)),
            ..entry("b", 1)
        };
        let c = entry("c", 3);
        let d = entry("d", 2);
        let ordered = sched.order(vec![a, b, c, d], t(0));
        assert_eq!(keys(&ordered), vec!["b", "a", "d", "c"]);
    }

    #[test]
    fn station_rotation_advances_once_per_interval() {
        let mut sched = PriorityScheduler::new(Duration::seconds(10));
        let mk = |k: &str, o| ScheduleEntry {
            station: Some("st".to_string()),
            ..entry(k, o)
        };
        let input = vec![mk("a", 0), mk("b", 1), mk("c", 2)];

        assert_eq!(keys(&sched.order(input.clone(), t(0))), vec!["a", "b", "c"]);
        assert_eq!(keys(&sched.order(input.clone(), t(5))), vec!["a", "b", "c"]);
        assert_eq!(keys(&sched.order(input.clone(), t(10))), vec!["b", "c", "a"]);
        assert_eq!(keys(&sched.order(input.clone(), t(15))), vec!["b", "c", "a"]);
        assert_eq!(keys(&sched.order(input, t(20))), vec!["c", "a", "b"]);
    }

    #[test]
    fn rotation_ignores_charging_state_within_interval() {
        let mut sched = PriorityScheduler::new(Duration::seconds(10));
        let mk = |k: &str, o, charging| ScheduleEntry {
            station: Some("st".to_string()),
            charging,
            session_start: charging.then(|| t(0)),
            ..entry(k, o)
        };

        // Whoever got power last cycle sorts first; the leader must not follow it
        let mut leaders = String::new();
        let mut leader = "a".to_string();
        for s in 0..30 {
            let input = vec![mk("a", 0, leader == "a"), mk("b", 1, leader == "b")];
            leader = sched.order(input, t(s))[0].key.clone();
            leaders.push_str(&leader);
        }
        assert_eq!(leaders, format!("{}{}{}", "a".repeat(10), "b".repeat(10), "a".repeat(10)));
    }

    #[test]
    fn station_slots_follow_comparator_but_members_rotate() {
        let mut sched = PriorityScheduler::new(Duration::seconds(10));
        let mk = |k: &str, o| ScheduleEntry {
            station: Some("st".to_string()),
            ..entry(k, o)
        };
        let free = ScheduleEntry {
            charging: true,
            ..entry("free", 5)
        };
        let charging_b = ScheduleEntry {
            charging: true,
            ..mk("b", 1)
        };
        let input = vec![mk("a", 0), charging_b, free];
        // Station holds slots 0 and 2; a fills the first one until rotation
        assert_eq!(keys(&sched.order(input.clone(), t(0))), vec!["a", "free", "b"]);
        assert_eq!(keys(&sched.order(input, t(10))), vec!["b", "free", "a"]);
    }

    #[test]
    fn rotation_never_moves_boost_members() {
        let mut sched = PriorityScheduler::new(Duration::seconds(10));
        let mk = |k: &str, o| ScheduleEntry {
            station: Some("st".to_string()),
            ..entry(k, o)
        };
        let boosted = ScheduleEntry {
            boost: true,
            ..mk("z", 9)
        };
        let input = vec![mk("a", 0), mk("b", 1), boosted];
        sched.order(input.clone(), t(0));
        let ordered = sched.order(input, t(10));
        assert_eq!(keys(&ordered), vec!["z", "b", "a"]);
    }
}
