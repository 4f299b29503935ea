// File: ./src/health.rs
//! Health monitor status record.
//!
//! The periodic check itself runs inside the coordinator (it needs the
//! timers and state machines); this module owns the status surface the host
//! reads back.

use chrono::{DateTime, Local};
use serde::Serialize;

/// Result of the most recent watchdog pass.
#[derive(Debug, Clone, Serialize, Default)]
pub struct HealthStatus {
    pub healthy: bool,
    pub last_check: Option<DateTime<Local>>,
    pub issues: Vec<String>,
    pub alarm_count: usize,
    /// Alarms currently ringing or snoozed.
    pub active_alarms: usize,
}

impl HealthStatus {
    pub fn new_pass(
        now: DateTime<Local>,
        issues: Vec<String>,
        alarm_count: usize,
        active_alarms: usize,
    ) -> Self {
        Self {
            healthy: issues.is_empty(),
            last_check: Some(now),
            issues,
            alarm_count,
            active_alarms,
        }
    }
}
