//! Event rules
//!
//! A rule is a trigger, a set of condition patterns and an ordered list
//! of action invocations. Matching is pure; dispatch lives in the
//! manager.

use super::{EventContext, EventKind};
use crate::util;
use globset::Glob;
use serde::{Deserialize, Serialize};
use wharf_common::{Error, Result};

/// What fires a rule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum EventTrigger {
    FsEvent = 1,
    ProviderEvent = 2,
    Schedule = 3,
    IpBlocked = 4,
    Certificate = 5,
}

/// A literal or glob pattern with an optional inverse flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConditionPattern {
    pub pattern: String,
    #[serde(default)]
    pub inverse_match: bool,
}

impl ConditionPattern {
    fn matches(&self, value: &str) -> bool {
        let hit = Glob::new(&self.pattern)
            .map(|g| g.compile_matcher().is_match(value))
            .unwrap_or(self.pattern == value);
        hit != self.inverse_match
    }
}

/// One in-list/OR, across-field/AND pattern set.
fn patterns_match(patterns: &[ConditionPattern], value: &str) -> bool {
    if patterns.is_empty() {
        return true;
    }
    patterns.iter().any(|p| p.matches(value))
}

/// A cron quintuple, matched against UTC.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schedule {
    pub minute: String,
    pub hour: String,
    pub day_of_month: String,
    pub month: String,
    pub day_of_week: String,
}

impl Schedule {
    /// The equivalent cron expression with a zeroed seconds field.
    pub fn cron_spec(&self) -> String {
        format!(
            "0 {} {} {} {} {}",
            self.minute, self.hour, self.day_of_month, self.month, self.day_of_week
        )
    }

    pub fn validate(&self) -> Result<()> {
        self.cron_spec()
            .parse::<cron::Schedule>()
            .map(|_| ())
            .map_err(|e| Error::Validation(format!("invalid schedule: {}", e)))
    }

    /// True when the quintuple matches the given UTC minute.
    pub fn matches_minute(&self, at: chrono::DateTime<chrono::Utc>) -> bool {
        let Ok(schedule) = self.cron_spec().parse::<cron::Schedule>() else {
            return false;
        };
        let minute_start = at
            .with_time(
                chrono::NaiveTime::from_hms_opt(
                    chrono::Timelike::hour(&at),
                    chrono::Timelike::minute(&at),
                    0,
                )
                .unwrap(),
            )
            .unwrap();
        schedule
            .after(&(minute_start - chrono::Duration::seconds(1)))
            .next()
            .map(|next| next == minute_start)
            .unwrap_or(false)
    }
}

/// Extra constraints for filesystem events.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConditionOptions {
    /// Username patterns.
    #[serde(default)]
    pub names: Vec<ConditionPattern>,
    /// Role name patterns.
    #[serde(default)]
    pub role_names: Vec<ConditionPattern>,
    /// Virtual path patterns, fs events only.
    #[serde(default)]
    pub fs_paths: Vec<ConditionPattern>,
    /// Protocol allow-list, fs events only.
    #[serde(default)]
    pub protocols: Vec<String>,
    /// Bytes; 0 disables.
    #[serde(default)]
    pub min_file_size: i64,
    #[serde(default)]
    pub max_file_size: i64,
}

/// Trigger-specific predicates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventConditions {
    /// Filesystem event kinds, e.g. "upload".
    #[serde(default)]
    pub fs_events: Vec<String>,
    /// Provider event kinds: "add", "update", "delete".
    #[serde(default)]
    pub provider_events: Vec<String>,
    /// Object types for provider events, e.g. "user".
    #[serde(default)]
    pub provider_objects: Vec<String>,
    #[serde(default)]
    pub schedules: Vec<Schedule>,
    #[serde(default)]
    pub options: ConditionOptions,
}

/// An action invocation inside a rule chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuleActionOptions {
    #[serde(default)]
    pub is_failure_action: bool,
    #[serde(default)]
    pub stop_on_failure: bool,
    #[serde(default)]
    pub execute_sync: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuleAction {
    /// Name of the referenced event action.
    pub name: String,
    #[serde(default)]
    pub order: i32,
    #[serde(flatten)]
    pub options: RuleActionOptions,
}

/// A named rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRule {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// 1 enabled, 0 disabled.
    #[serde(default = "default_status")]
    pub status: i32,
    pub trigger: EventTrigger,
    #[serde(default)]
    pub conditions: EventConditions,
    #[serde(default)]
    pub actions: Vec<RuleAction>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

fn default_status() -> i32 {
    1
}

impl EventRule {
    pub fn validate(&mut self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation("field \"name\" is required".to_string()));
        }
        if self.actions.is_empty() {
            return Err(Error::Validation(
                "at least one action is required".to_string(),
            ));
        }
        match self.trigger {
            EventTrigger::FsEvent if self.conditions.fs_events.is_empty() => {
                return Err(Error::Validation(
                    "at least one filesystem event is required".to_string(),
                ));
            }
            EventTrigger::ProviderEvent if self.conditions.provider_events.is_empty() => {
                return Err(Error::Validation(
                    "at least one provider event is required".to_string(),
                ));
            }
            EventTrigger::Schedule => {
                if self.conditions.schedules.is_empty() {
                    return Err(Error::Validation(
                        "at least one schedule is required".to_string(),
                    ));
                }
                for schedule in &self.conditions.schedules {
                    schedule.validate()?;
                }
            }
            _ => {}
        }
        for action in &self.actions {
            if action.options.execute_sync && self.trigger != EventTrigger::FsEvent {
                return Err(Error::Validation(
                    "synchronous actions require a filesystem trigger".to_string(),
                ));
            }
        }
        self.actions.sort_by_key(|a| a.order);
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.status == 1
    }

    /// Actions in execution order.
    pub fn ordered_actions(&self) -> Vec<RuleAction> {
        let mut actions = self.actions.clone();
        actions.sort_by_key(|a| a.order);
        actions
    }

    /// Does any action require the triggering operation to block?
    pub fn has_sync_actions(&self) -> bool {
        self.actions.iter().any(|a| a.options.execute_sync)
    }

    /// Trigger and condition check against a concrete event.
    pub fn matches(&self, event: &EventContext) -> bool {
        if !self.is_enabled() {
            return false;
        }
        match (&self.trigger, &event.kind) {
            (EventTrigger::FsEvent, EventKind::Fs { event: fs_event }) => {
                if !self.conditions.fs_events.iter().any(|e| e == fs_event) {
                    return false;
                }
                let opts = &self.conditions.options;
                if !patterns_match(&opts.names, &event.username) {
                    return false;
                }
                if !patterns_match(&opts.role_names, &event.role) {
                    return false;
                }
                if !opts.fs_paths.is_empty() {
                    let path = util::clean_path(&event.virtual_path);
                    if !opts.fs_paths.iter().any(|p| p.matches(&path)) {
                        return false;
                    }
                }
                if !opts.protocols.is_empty()
                    && !opts.protocols.iter().any(|p| p == &event.protocol)
                {
                    return false;
                }
                if opts.min_file_size > 0 && event.file_size < opts.min_file_size {
                    return false;
                }
                if opts.max_file_size > 0 && event.file_size > opts.max_file_size {
                    return false;
                }
                true
            }
            (
                EventTrigger::ProviderEvent,
                EventKind::Provider {
                    action,
                    object_type,
                },
            ) => {
                if !self.conditions.provider_events.iter().any(|e| e == action) {
                    return false;
                }
                if !self.conditions.provider_objects.is_empty()
                    && !self
                        .conditions
                        .provider_objects
                        .iter()
                        .any(|o| o == object_type)
                {
                    return false;
                }
                patterns_match(&self.conditions.options.names, &event.object_name)
            }
            (EventTrigger::IpBlocked, EventKind::IpBlocked) => true,
            (EventTrigger::Certificate, EventKind::CertificateRenewal) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn upload_event(path: &str, size: i64) -> EventContext {
        EventContext {
            kind: EventKind::Fs {
                event: "upload".to_string(),
            },
            username: "alice".to_string(),
            role: String::new(),
            virtual_path: path.to_string(),
            virtual_target_path: String::new(),
            fs_path: String::new(),
            object_name: String::new(),
            object_data: String::new(),
            file_size: size,
            protocol: "SSH".to_string(),
            ip: "10.0.0.1".to_string(),
            status: 1,
            timestamp: 0,
        }
    }

    fn fs_rule(events: &[&str]) -> EventRule {
        EventRule {
            id: 1,
            name: "r".to_string(),
            description: String::new(),
            status: 1,
            trigger: EventTrigger::FsEvent,
            conditions: EventConditions {
                fs_events: events.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            actions: vec![RuleAction {
                name: "a".to_string(),
                ..Default::default()
            }],
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn fs_event_kind_must_match() {
        let rule = fs_rule(&["upload"]);
        assert!(rule.matches(&upload_event("/f", 10)));
        let mut download = upload_event("/f", 10);
        download.kind = EventKind::Fs {
            event: "download".to_string(),
        };
        assert!(!rule.matches(&download));
    }

    #[test]
    fn size_window_and_path_globs() {
        let mut rule = fs_rule(&["upload"]);
        rule.conditions.options.min_file_size = 1024 * 1024;
        assert!(!rule.matches(&upload_event("/f", 512)));
        assert!(rule.matches(&upload_event("/f", 2 * 1024 * 1024)));

        rule.conditions.options.fs_paths = vec![ConditionPattern {
            pattern: "/in/*.zip".to_string(),
            inverse_match: false,
        }];
        assert!(rule.matches(&upload_event("/in/a.zip", 2 * 1024 * 1024)));
        assert!(!rule.matches(&upload_event("/out/a.zip", 2 * 1024 * 1024)));
    }

    #[test]
    fn inverse_patterns_and_name_conditions() {
        let mut rule = fs_rule(&["upload"]);
        rule.conditions.options.names = vec![ConditionPattern {
            pattern: "admin*".to_string(),
            inverse_match: true,
        }];
        assert!(rule.matches(&upload_event("/f", 1)));
        let mut event = upload_event("/f", 1);
        event.username = "admin7".to_string();
        assert!(!rule.matches(&event));
    }

    #[test]
    fn disabled_rule_never_matches() {
        let mut rule = fs_rule(&["upload"]);
        rule.status = 0;
        assert!(!rule.matches(&upload_event("/f", 1)));
    }

    #[test]
    fn provider_event_matching() {
        let rule = EventRule {
            id: 1,
            name: "p".to_string(),
            description: String::new(),
            status: 1,
            trigger: EventTrigger::ProviderEvent,
            conditions: EventConditions {
                provider_events: vec!["add".to_string()],
                provider_objects: vec!["user".to_string()],
                ..Default::default()
            },
            actions: vec![RuleAction {
                name: "a".to_string(),
                ..Default::default()
            }],
            created_at: 0,
            updated_at: 0,
        };
        let mut event = upload_event("", 0);
        event.kind = EventKind::Provider {
            action: "add".to_string(),
            object_type: "user".to_string(),
        };
        event.object_name = "bob".to_string();
        assert!(rule.matches(&event));
        event.kind = EventKind::Provider {
            action: "delete".to_string(),
            object_type: "user".to_string(),
        };
        assert!(!rule.matches(&event));
    }

    #[test]
    fn schedule_minute_matching() {
        let schedule = Schedule {
            minute: "30".to_string(),
            hour: "2".to_string(),
            day_of_month: "*".to_string(),
            month: "*".to_string(),
            day_of_week: "*".to_string(),
        };
        schedule.validate().unwrap();
        let hit = chrono::Utc.with_ymd_and_hms(2026, 3, 4, 2, 30, 0).unwrap();
        let miss = chrono::Utc.with_ymd_and_hms(2026, 3, 4, 2, 31, 0).unwrap();
        assert!(schedule.matches_minute(hit));
        assert!(!schedule.matches_minute(miss));
    }

    #[test]
    fn sync_actions_require_fs_trigger() {
        let mut rule = fs_rule(&["upload"]);
        rule.trigger = EventTrigger::Schedule;
        rule.conditions.schedules = vec![Schedule {
            minute: "0".to_string(),
            hour: "*".to_string(),
            day_of_month: "*".to_string(),
            month: "*".to_string(),
            day_of_week: "*".to_string(),
        }];
        rule.actions[0].options.execute_sync = true;
        assert!(rule.validate().is_err());
    }

    #[test]
    fn actions_sorted_by_order() {
        let mut rule = fs_rule(&["upload"]);
        rule.actions = vec![
            RuleAction {
                name: "second".to_string(),
                order: 2,
                ..Default::default()
            },
            RuleAction {
                name: "first".to_string(),
                order: 1,
                ..Default::default()
            },
        ];
        let ordered = rule.ordered_actions();
        assert_eq!(ordered[0].name, "first");
        assert_eq!(ordered[1].name, "second");
    }
}
