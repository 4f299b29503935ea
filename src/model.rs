// File: ./src/model.rs
//! Alarm configuration, runtime snapshots, and input validation.
//!
//! `Alarm` is the persisted configuration of a single alarm; `RuntimeState`
//! is the persisted snapshot of its live state. Both carry a flattened
//! `extra` map so fields written by newer versions survive a round-trip
//! through this one.

use chrono::{DateTime, Local, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use strum::EnumIter;

/// Hard cap on alarm names, applied after sanitization.
pub const MAX_NAME_LENGTH: usize = 50;

fn default_true() -> bool {
    true
}
fn default_snooze_duration() -> u32 {
    9
} // minutes
fn default_max_snooze_count() -> u32 {
    3
}
fn default_auto_dismiss_timeout() -> u32 {
    60
} // minutes
fn default_pre_alarm_duration() -> u32 {
    5
} // minutes
fn default_script_timeout() -> u32 {
    30
} // seconds
fn default_script_retry_count() -> u32 {
    3
}
fn default_days() -> Vec<DayOfWeek> {
    vec![
        DayOfWeek::Monday,
        DayOfWeek::Tuesday,
        DayOfWeek::Wednesday,
        DayOfWeek::Thursday,
        DayOfWeek::Friday,
    ]
}
fn default_watchdog_timeout() -> u64 {
    60
} // seconds
fn default_missed_grace_period() -> u32 {
    5
} // minutes

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum DayOfWeek {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl DayOfWeek {
    pub fn to_chrono(self) -> Weekday {
        match self {
            DayOfWeek::Monday => Weekday::Mon,
            DayOfWeek::Tuesday => Weekday::Tue,
            DayOfWeek::Wednesday => Weekday::Wed,
            DayOfWeek::Thursday => Weekday::Thu,
            DayOfWeek::Friday => Weekday::Fri,
            DayOfWeek::Saturday => Weekday::Sat,
            DayOfWeek::Sunday => Weekday::Sun,
        }
    }

    pub fn from_chrono(day: Weekday) -> Self {
        match day {
            Weekday::Mon => DayOfWeek::Monday,
            Weekday::Tue => DayOfWeek::Tuesday,
            Weekday::Wed => DayOfWeek::Wednesday,
            Weekday::Thu => DayOfWeek::Thursday,
            Weekday::Fri => DayOfWeek::Friday,
            Weekday::Sat => DayOfWeek::Saturday,
            Weekday::Sun => DayOfWeek::Sunday,
        }
    }
}

impl fmt::Display for DayOfWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DayOfWeek::Monday => "monday",
            DayOfWeek::Tuesday => "tuesday",
            DayOfWeek::Wednesday => "wednesday",
            DayOfWeek::Thursday => "thursday",
            DayOfWeek::Friday => "friday",
            DayOfWeek::Saturday => "saturday",
            DayOfWeek::Sunday => "sunday",
        };
        write!(f, "{}", name)
    }
}

/// The eight lifecycle states of an alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, EnumIter)]
#[serde(rename_all = "snake_case")]
pub enum AlarmState {
    #[default]
    Disabled,
    Armed,
    PreAlarm,
    Ringing,
    Snoozed,
    Dismissed,
    AutoDismissed,
    Missed,
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlarmState::Disabled => "disabled",
            AlarmState::Armed => "armed",
            AlarmState::PreAlarm => "pre_alarm",
            AlarmState::Ringing => "ringing",
            AlarmState::Snoozed => "snoozed",
            AlarmState::Dismissed => "dismissed",
            AlarmState::AutoDismissed => "auto_dismissed",
            AlarmState::Missed => "missed",
        };
        write!(f, "{}", name)
    }
}

/// What caused a transition into `Ringing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Scheduled,
    ManualTest,
    MissedRecovery,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerKind::Scheduled => "scheduled",
            TriggerKind::ManualTest => "manual_test",
            TriggerKind::MissedRecovery => "missed_recovery",
        };
        write!(f, "{}", name)
    }
}

/// The nine hook points an alarm can attach an external routine to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter)]
#[serde(rename_all = "snake_case")]
pub enum ScriptSlot {
    PreAlarm,
    Alarm,
    PostAlarm,
    OnSnooze,
    OnDismiss,
    OnArm,
    OnCancel,
    OnSkip,
    Fallback,
}

impl ScriptSlot {
    pub fn key(self) -> &'static str {
        match self {
            ScriptSlot::PreAlarm => "pre_alarm",
            ScriptSlot::Alarm => "alarm",
            ScriptSlot::PostAlarm => "post_alarm",
            ScriptSlot::OnSnooze => "on_snooze",
            ScriptSlot::OnDismiss => "on_dismiss",
            ScriptSlot::OnArm => "on_arm",
            ScriptSlot::OnCancel => "on_cancel",
            ScriptSlot::OnSkip => "on_skip",
            ScriptSlot::Fallback => "fallback",
        }
    }
}

impl fmt::Display for ScriptSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Persisted configuration of a single alarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alarm {
    pub id: String,
    pub name: String,
    /// Local time of day, "HH:MM", 24-hour.
    pub time: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_days")]
    pub days: Vec<DayOfWeek>,
    #[serde(default)]
    pub one_time: bool,
    #[serde(default)]
    pub skip_next: bool,
    #[serde(default = "default_snooze_duration")]
    pub snooze_duration_min: u32,
    #[serde(default = "default_max_snooze_count")]
    pub max_snooze_count: u32,
    #[serde(default = "default_auto_dismiss_timeout")]
    pub auto_dismiss_timeout_min: u32,
    #[serde(default = "default_pre_alarm_duration")]
    pub pre_alarm_duration_min: u32,
    #[serde(default = "default_true")]
    pub use_device_defaults: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_pre_alarm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_alarm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_post_alarm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_on_snooze: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_on_dismiss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_on_arm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_on_cancel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_on_skip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_fallback: Option<String>,

    #[serde(default = "default_script_timeout")]
    pub script_timeout_s: u32,
    #[serde(default = "default_script_retry_count")]
    pub script_retry_count: u32,

    /// Unknown keys from newer store versions, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Alarm {
    /// Create an alarm with default timings, enabled, Mon-Fri.
    pub fn new(id: impl Into<String>, name: impl Into<String>, time: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            time: time.into(),
            enabled: true,
            days: default_days(),
            one_time: false,
            skip_next: false,
            snooze_duration_min: default_snooze_duration(),
            max_snooze_count: default_max_snooze_count(),
            auto_dismiss_timeout_min: default_auto_dismiss_timeout(),
            pre_alarm_duration_min: default_pre_alarm_duration(),
            use_device_defaults: true,
            script_pre_alarm: None,
            script_alarm: None,
            script_post_alarm: None,
            script_on_snooze: None,
            script_on_dismiss: None,
            script_on_arm: None,
            script_on_cancel: None,
            script_on_skip: None,
            script_fallback: None,
            script_timeout_s: default_script_timeout(),
            script_retry_count: default_script_retry_count(),
            extra: Map::new(),
        }
    }

    pub fn script(&self, slot: ScriptSlot) -> Option<&str> {
        let field = match slot {
            ScriptSlot::PreAlarm => &self.script_pre_alarm,
            ScriptSlot::Alarm => &self.script_alarm,
            ScriptSlot::PostAlarm => &self.script_post_alarm,
            ScriptSlot::OnSnooze => &self.script_on_snooze,
            ScriptSlot::OnDismiss => &self.script_on_dismiss,
            ScriptSlot::OnArm => &self.script_on_arm,
            ScriptSlot::OnCancel => &self.script_on_cancel,
            ScriptSlot::OnSkip => &self.script_on_skip,
            ScriptSlot::Fallback => &self.script_fallback,
        };
        field.as_deref()
    }

    pub fn set_script(&mut self, slot: ScriptSlot, routine: Option<String>) {
        let field = match slot {
            ScriptSlot::PreAlarm => &mut self.script_pre_alarm,
            ScriptSlot::Alarm => &mut self.script_alarm,
            ScriptSlot::PostAlarm => &mut self.script_post_alarm,
            ScriptSlot::OnSnooze => &mut self.script_on_snooze,
            ScriptSlot::OnDismiss => &mut self.script_on_dismiss,
            ScriptSlot::OnArm => &mut self.script_on_arm,
            ScriptSlot::OnCancel => &mut self.script_on_cancel,
            ScriptSlot::OnSkip => &mut self.script_on_skip,
            ScriptSlot::Fallback => &mut self.script_fallback,
        };
        *field = routine;
    }

    /// Validate the configuration. Returns one message per problem; an empty
    /// vector means the alarm is well-formed.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.id.trim().is_empty() {
            errors.push("alarm id cannot be empty".to_string());
        }
        if self.name.trim().is_empty() {
            errors.push("alarm name cannot be empty".to_string());
        }
        if self.name.chars().count() > MAX_NAME_LENGTH {
            errors.push(format!("alarm name exceeds {} characters", MAX_NAME_LENGTH));
        }
        if let Err(err) = parse_alarm_time(&self.time) {
            errors.push(err);
        }

        let mut seen = std::collections::HashSet::new();
        for day in &self.days {
            if !seen.insert(*day) {
                errors.push(format!("duplicate day in schedule: {}", day));
            }
        }
        if self.days.is_empty() && !self.one_time {
            errors.push("a recurring alarm needs at least one weekday".to_string());
        }

        if !(1..=60).contains(&self.snooze_duration_min) {
            errors.push("snooze_duration_min must be between 1 and 60".to_string());
        }
        if self.max_snooze_count > 10 {
            errors.push("max_snooze_count must be between 0 and 10".to_string());
        }
        if !(1..=180).contains(&self.auto_dismiss_timeout_min) {
            errors.push("auto_dismiss_timeout_min must be between 1 and 180".to_string());
        }
        if self.pre_alarm_duration_min > 60 {
            errors.push("pre_alarm_duration_min must be between 0 and 60".to_string());
        }
        if !(1..=300).contains(&self.script_timeout_s) {
            errors.push("script_timeout_s must be between 1 and 300".to_string());
        }
        if self.script_retry_count > 10 {
            errors.push("script_retry_count must be between 0 and 10".to_string());
        }

        errors
    }
}

/// Parse "HH:MM" into a `NaiveTime` at second zero.
pub fn parse_alarm_time(time: &str) -> Result<NaiveTime, String> {
    let mut parts = time.split(':');
    let (Some(hours), Some(minutes), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("invalid time format: {}", time));
    };
    let (Ok(hours), Ok(minutes)) = (hours.parse::<u32>(), minutes.parse::<u32>()) else {
        return Err(format!("invalid time format: {}", time));
    };
    NaiveTime::from_hms_opt(hours, minutes, 0).ok_or_else(|| format!("time out of range: {}", time))
}

/// Sanitize a user-supplied alarm name.
///
/// Trims whitespace, strips control characters, replaces anything outside
/// word characters / whitespace / hyphens with a space, and truncates to
/// `MAX_NAME_LENGTH`. Returns an error only when nothing usable remains.
pub fn sanitize_name(raw: &str) -> Result<String, String> {
    let mut name: String = raw
        .trim()
        .chars()
        .filter(|c| *c as u32 >= 32)
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();

    if name.chars().count() > MAX_NAME_LENGTH {
        log::warn!(
            "Alarm name too long ({} chars), truncating to {}",
            name.chars().count(),
            MAX_NAME_LENGTH
        );
        name = name.chars().take(MAX_NAME_LENGTH).collect();
    }

    let name = name.trim().to_string();
    if name.is_empty() {
        return Err("alarm name cannot be empty".to_string());
    }
    Ok(name)
}

/// Persisted snapshot of an alarm's live state, rebuilt on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeState {
    #[serde(default)]
    pub state: AlarmState,
    #[serde(default)]
    pub snooze_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered: Option<DateTime<Local>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_state_change: Option<DateTime<Local>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snooze_end_at: Option<DateTime<Local>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ringing_started_at: Option<DateTime<Local>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_alarm_started_at: Option<DateTime<Local>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_trigger_kind: Option<TriggerKind>,
    /// Derived; persisted for diagnostics only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_trigger_at: Option<DateTime<Local>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            state: AlarmState::Disabled,
            snooze_count: 0,
            last_triggered: None,
            last_state_change: None,
            snooze_end_at: None,
            ringing_started_at: None,
            pre_alarm_started_at: None,
            current_trigger_kind: None,
            next_trigger_at: None,
            extra: Map::new(),
        }
    }
}

/// Device-level fallback scripts and timings, supplied by the host.
/// Read-only to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_pre_alarm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_alarm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_post_alarm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_on_snooze: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_on_dismiss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_on_arm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_on_cancel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_on_skip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_fallback: Option<String>,
    #[serde(default = "default_script_timeout")]
    pub script_timeout_s: u32,
    #[serde(default = "default_script_retry_count")]
    pub script_retry_count: u32,
}

impl Default for DeviceDefaults {
    fn default() -> Self {
        Self {
            script_pre_alarm: None,
            script_alarm: None,
            script_post_alarm: None,
            script_on_snooze: None,
            script_on_dismiss: None,
            script_on_arm: None,
            script_on_cancel: None,
            script_on_skip: None,
            script_fallback: None,
            script_timeout_s: default_script_timeout(),
            script_retry_count: default_script_retry_count(),
        }
    }
}

impl DeviceDefaults {
    pub fn script(&self, slot: ScriptSlot) -> Option<&str> {
        let field = match slot {
            ScriptSlot::PreAlarm => &self.script_pre_alarm,
            ScriptSlot::Alarm => &self.script_alarm,
            ScriptSlot::PostAlarm => &self.script_post_alarm,
            ScriptSlot::OnSnooze => &self.script_on_snooze,
            ScriptSlot::OnDismiss => &self.script_on_dismiss,
            ScriptSlot::OnArm => &self.script_on_arm,
            ScriptSlot::OnCancel => &self.script_on_cancel,
            ScriptSlot::OnSkip => &self.script_on_skip,
            ScriptSlot::Fallback => &self.script_fallback,
        };
        field.as_deref()
    }
}

/// Engine-wide settings persisted with the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default = "default_watchdog_timeout")]
    pub watchdog_timeout_s: u64,
    #[serde(default = "default_missed_grace_period")]
    pub missed_alarm_grace_period_min: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            watchdog_timeout_s: default_watchdog_timeout(),
            missed_alarm_grace_period_min: default_missed_grace_period(),
            extra: Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_times() {
        assert_eq!(
            parse_alarm_time("07:00").unwrap(),
            NaiveTime::from_hms_opt(7, 0, 0).unwrap()
        );
        assert_eq!(
            parse_alarm_time("23:59").unwrap(),
            NaiveTime::from_hms_opt(23, 59, 0).unwrap()
        );
        assert_eq!(
            parse_alarm_time("0:5").unwrap(),
            NaiveTime::from_hms_opt(0, 5, 0).unwrap()
        );
    }

    #[test]
    fn rejects_invalid_times() {
        assert!(parse_alarm_time("24:00").is_err());
        assert!(parse_alarm_time("07:60").is_err());
        assert!(parse_alarm_time("0700").is_err());
        assert!(parse_alarm_time("07:00:00").is_err());
        assert!(parse_alarm_time("seven").is_err());
        assert!(parse_alarm_time("").is_err());
    }

    #[test]
    fn sanitize_strips_control_chars_and_specials() {
        assert_eq!(sanitize_name("  Wake up  ").unwrap(), "Wake up");
        assert_eq!(sanitize_name("Work\x07day").unwrap(), "Workday");
        assert_eq!(sanitize_name("gym @ 6!").unwrap(), "gym   6");
        assert!(sanitize_name("   ").is_err());
        assert!(sanitize_name("\x01\x02").is_err());
    }

    #[test]
    fn sanitize_truncates_long_names() {
        let long = "x".repeat(80);
        let name = sanitize_name(&long).unwrap();
        assert_eq!(name.chars().count(), MAX_NAME_LENGTH);
    }

    #[test]
    fn validate_accepts_defaults() {
        let alarm = Alarm::new("a1", "Morning", "06:30");
        assert!(alarm.validate().is_empty());
    }

    #[test]
    fn validate_flags_bad_ranges() {
        let mut alarm = Alarm::new("a1", "Morning", "06:30");
        alarm.snooze_duration_min = 0;
        alarm.max_snooze_count = 11;
        alarm.auto_dismiss_timeout_min = 999;
        alarm.script_timeout_s = 0;
        let errors = alarm.validate();
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn validate_rejects_empty_days_for_recurring() {
        let mut alarm = Alarm::new("a1", "Morning", "06:30");
        alarm.days.clear();
        assert!(!alarm.validate().is_empty());

        // A one-time alarm may have empty days; it simply idles.
        alarm.one_time = true;
        assert!(alarm.validate().is_empty());
    }

    #[test]
    fn validate_rejects_duplicate_days() {
        let mut alarm = Alarm::new("a1", "Morning", "06:30");
        alarm.days = vec![DayOfWeek::Monday, DayOfWeek::Monday];
        assert!(!alarm.validate().is_empty());
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let json = r#"{
            "id": "a1",
            "name": "Morning",
            "time": "06:30",
            "hologram_mode": true
        }"#;
        let alarm: Alarm = serde_json::from_str(json).expect("valid alarm");
        assert_eq!(alarm.extra.get("hologram_mode"), Some(&Value::Bool(true)));
        let out = serde_json::to_string(&alarm).unwrap();
        assert!(out.contains("hologram_mode"));
    }

    #[test]
    fn script_slot_round_trip() {
        let mut alarm = Alarm::new("a1", "Morning", "06:30");
        alarm.set_script(ScriptSlot::OnSnooze, Some("soft_light".to_string()));
        assert_eq!(alarm.script(ScriptSlot::OnSnooze), Some("soft_light"));
        assert_eq!(alarm.script(ScriptSlot::Alarm), None);
    }
}
