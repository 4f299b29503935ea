// File: ./src/events.rs
//! Lifecycle events emitted to the host.
//!
//! Emission is fire-and-forget: subscribers that fell behind or went away
//! never block the engine.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::model::{AlarmState, ScriptSlot, TriggerKind};

/// Base payload carried by every alarm-scoped event.
#[derive(Debug, Clone, Serialize)]
pub struct AlarmSnapshot {
    pub alarm_id: String,
    pub alarm_name: String,
    pub alarm_time: String,
    pub alarm_state: AlarmState,
    pub snooze_count: u32,
    pub is_one_time: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_kind: Option<TriggerKind>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Armed,
    Disarmed,
    PreAlarm,
    Triggered,
    Snoozed { duration_min: u32 },
    Dismissed,
    AutoDismissed,
    Missed { missed_by_seconds: i64 },
    Skipped,
    ScriptFailed {
        slot: ScriptSlot,
        routine: String,
        error: String,
    },
    HealthWarning { issues: Vec<String> },
    TimeChanged { old_time: String },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Armed => "armed",
            EventKind::Disarmed => "disarmed",
            EventKind::PreAlarm => "pre_alarm",
            EventKind::Triggered => "triggered",
            EventKind::Snoozed { .. } => "snoozed",
            EventKind::Dismissed => "dismissed",
            EventKind::AutoDismissed => "auto_dismissed",
            EventKind::Missed { .. } => "missed",
            EventKind::Skipped => "skipped",
            EventKind::ScriptFailed { .. } => "script_failed",
            EventKind::HealthWarning { .. } => "health_warning",
            EventKind::TimeChanged { .. } => "time_changed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineEvent {
    pub timestamp: DateTime<Local>,
    /// Absent only for engine-wide events (health warnings).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alarm: Option<AlarmSnapshot>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Fan-out of engine events to host subscribers.
///
/// The subscriber list is touched only under a short-lived lock; emission
/// sends to a snapshot of the list so a subscriber added or dropped
/// mid-emission never observes a half-delivered event.
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<EngineEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn emit(&self, event: EngineEvent) {
        log::debug!("Event {}: alarm={:?}", event.kind.name(), event.alarm.as_ref().map(|a| &a.alarm_id));
        let targets: Vec<_> = self.subscribers.lock().unwrap().clone();
        let mut any_closed = false;
        for tx in &targets {
            if tx.send(event.clone()).is_err() {
                any_closed = true;
            }
        }
        if any_closed {
            self.subscribers
                .lock()
                .unwrap()
                .retain(|tx| !tx.is_closed());
        }
    }

    /// Drop every subscriber. Part of the shutdown sequence.
    pub fn clear(&self) {
        self.subscribers.lock().unwrap().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
