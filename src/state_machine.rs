// File: ./src/state_machine.rs
//! Per-alarm state machine with guarded transitions and runtime counters.
//!
//! The machine itself is a plain value; serialization of transitions for a
//! given alarm is provided by the per-alarm mutex in the coordinator, which
//! is the only owner of these machines.

use chrono::{DateTime, Local};

use crate::events::AlarmSnapshot;
use crate::model::{Alarm, AlarmState, RuntimeState, TriggerKind};
use crate::runner::ScriptContext;

/// Rejected transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// The transition table does not allow `from -> to`.
    Invalid { from: AlarmState, to: AlarmState },
    /// Snooze refused at cap: `snooze_count` already equals `max`.
    SnoozeLimit { count: u32, max: u32 },
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionError::Invalid { from, to } => {
                write!(f, "invalid state transition from {} to {}", from, to)
            }
            TransitionError::SnoozeLimit { count, max } => {
                write!(f, "snooze limit reached ({}/{})", count, max)
            }
        }
    }
}

impl std::error::Error for TransitionError {}

/// Static transition table. Everything not listed here is an error unless
/// the caller passes `force`, which is reserved for recovery and
/// command-mediated exits.
pub fn transition_allowed(from: AlarmState, to: AlarmState) -> bool {
    use AlarmState::*;
    matches!(
        (from, to),
        (Disabled, Armed)
            | (Armed, Disabled)
            | (Armed, PreAlarm)
            | (Armed, Ringing)
            | (Armed, Missed)
            | (PreAlarm, Ringing)
            | (PreAlarm, Disabled)
            | (PreAlarm, Missed)
            | (Ringing, Snoozed)
            | (Ringing, Dismissed)
            | (Ringing, AutoDismissed)
            | (Ringing, Disabled)
            | (Snoozed, Ringing)
            | (Snoozed, Dismissed)
            | (Snoozed, Disabled)
            | (Dismissed, Armed)
            | (Dismissed, Disabled)
            | (AutoDismissed, Armed)
            | (AutoDismissed, Disabled)
            | (Missed, Armed)
            | (Missed, Disabled)
    )
}

/// Called with `(alarm_id, old, new)` after every successful transition.
pub type TransitionHook = Box<dyn Fn(&str, AlarmState, AlarmState) + Send + Sync>;

pub struct StateMachine {
    data: Alarm,
    runtime: RuntimeState,
    on_transition: Option<TransitionHook>,
}

impl StateMachine {
    /// Create a machine for `data`, initially `Armed` when enabled.
    pub fn new(data: Alarm, on_transition: Option<TransitionHook>) -> Self {
        let mut runtime = RuntimeState::default();
        runtime.state = if data.enabled {
            AlarmState::Armed
        } else {
            AlarmState::Disabled
        };
        Self {
            data,
            runtime,
            on_transition,
        }
    }

    pub fn state(&self) -> AlarmState {
        self.runtime.state
    }

    pub fn snooze_count(&self) -> u32 {
        self.runtime.snooze_count
    }

    pub fn data(&self) -> &Alarm {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Alarm {
        &mut self.data
    }

    pub fn runtime(&self) -> &RuntimeState {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut RuntimeState {
        &mut self.runtime
    }

    pub fn can_transition_to(&self, target: AlarmState) -> bool {
        transition_allowed(self.runtime.state, target)
    }

    /// Attempt a transition. `trigger_kind` is recorded when entering
    /// `Ringing`. `force` bypasses the table but never the snooze cap.
    pub fn transition_to(
        &mut self,
        target: AlarmState,
        trigger_kind: Option<TriggerKind>,
        force: bool,
        now: DateTime<Local>,
    ) -> Result<(), TransitionError> {
        let old = self.runtime.state;

        if !force && !transition_allowed(old, target) {
            return Err(TransitionError::Invalid { from: old, to: target });
        }
        if target == AlarmState::Snoozed && self.runtime.snooze_count >= self.data.max_snooze_count
        {
            return Err(TransitionError::SnoozeLimit {
                count: self.runtime.snooze_count,
                max: self.data.max_snooze_count,
            });
        }

        self.runtime.state = target;
        self.runtime.last_state_change = Some(now);

        match target {
            AlarmState::Ringing => {
                self.runtime.current_trigger_kind = trigger_kind.or(Some(TriggerKind::Scheduled));
                self.runtime.last_triggered = Some(now);
                self.runtime.ringing_started_at = Some(now);
            }
            AlarmState::Snoozed => {
                self.runtime.snooze_count += 1;
            }
            AlarmState::PreAlarm => {
                self.runtime.pre_alarm_started_at = Some(now);
            }
            AlarmState::Armed
            | AlarmState::Dismissed
            | AlarmState::AutoDismissed
            | AlarmState::Missed => {
                self.runtime.snooze_count = 0;
                self.runtime.current_trigger_kind = None;
                self.runtime.ringing_started_at = None;
                self.runtime.snooze_end_at = None;
                self.runtime.pre_alarm_started_at = None;
            }
            AlarmState::Disabled => {}
        }

        log::debug!("Alarm {} transitioned: {} -> {}", self.data.id, old, target);

        if let Some(hook) = &self.on_transition {
            hook(&self.data.id, old, target);
        }

        Ok(())
    }

    /// Reset runtime state to the initial state for the enabled flag.
    pub fn reset(&mut self) {
        self.runtime = RuntimeState::default();
        self.runtime.state = if self.data.enabled {
            AlarmState::Armed
        } else {
            AlarmState::Disabled
        };
    }

    /// Snapshot of the runtime state for persistence.
    pub fn snapshot(&self) -> RuntimeState {
        self.runtime.clone()
    }

    /// Restore a persisted snapshot, sanitizing non-durable states.
    ///
    /// Only `Armed`, `Disabled` and `Snoozed` survive a restart; anything
    /// else downgrades to `Armed`/`Disabled` per the enabled flag. The state
    /// is also reconciled with the enabled flag so a disabled alarm never
    /// restores as armed.
    pub fn restore(&mut self, snapshot: RuntimeState) {
        let wanted = snapshot.state;
        self.runtime = snapshot;

        let durable = matches!(
            wanted,
            AlarmState::Armed | AlarmState::Disabled | AlarmState::Snoozed
        );
        if !durable {
            log::warn!(
                "Alarm {} restored from non-durable state {}, downgrading",
                self.data.id,
                wanted
            );
        }

        let fallback = if self.data.enabled {
            AlarmState::Armed
        } else {
            AlarmState::Disabled
        };

        self.runtime.state = match wanted {
            AlarmState::Snoozed if self.data.enabled => AlarmState::Snoozed,
            AlarmState::Armed if self.data.enabled => AlarmState::Armed,
            AlarmState::Disabled if !self.data.enabled => AlarmState::Disabled,
            _ => fallback,
        };
        if self.runtime.state != AlarmState::Snoozed {
            self.runtime.snooze_count = 0;
            self.runtime.snooze_end_at = None;
        }
        self.runtime.current_trigger_kind = None;
        self.runtime.ringing_started_at = None;
        self.runtime.pre_alarm_started_at = None;
        self.runtime.next_trigger_at = None;
    }

    /// Event payload base for the current state.
    pub fn event_snapshot(&self) -> AlarmSnapshot {
        AlarmSnapshot {
            alarm_id: self.data.id.clone(),
            alarm_name: self.data.name.clone(),
            alarm_time: self.data.time.clone(),
            alarm_state: self.runtime.state,
            snooze_count: self.runtime.snooze_count,
            is_one_time: self.data.one_time,
            trigger_kind: self.runtime.current_trigger_kind,
        }
    }

    /// Context payload handed to every invoked routine.
    pub fn script_context(&self) -> ScriptContext {
        ScriptContext {
            alarm_id: self.data.id.clone(),
            alarm_name: self.data.name.clone(),
            alarm_time: self.data.time.clone(),
            trigger_type: self.runtime.current_trigger_kind,
            snooze_count: self.runtime.snooze_count,
            is_one_time: self.data.one_time,
            days: self.data.days.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Alarm;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use strum::IntoEnumIterator;

    fn machine() -> StateMachine {
        StateMachine::new(Alarm::new("a1", "Test", "07:00"), None)
    }

    fn now() -> DateTime<Local> {
        Local::now()
    }

    #[test]
    fn enabled_alarm_starts_armed() {
        assert_eq!(machine().state(), AlarmState::Armed);

        let mut disabled = Alarm::new("a2", "Off", "07:00");
        disabled.enabled = false;
        assert_eq!(
            StateMachine::new(disabled, None).state(),
            AlarmState::Disabled
        );
    }

    #[test]
    fn full_ring_snooze_dismiss_cycle() {
        let mut sm = machine();
        sm.transition_to(AlarmState::Ringing, Some(TriggerKind::Scheduled), false, now())
            .unwrap();
        assert!(sm.runtime().last_triggered.is_some());
        assert!(sm.runtime().ringing_started_at.is_some());

        sm.transition_to(AlarmState::Snoozed, None, false, now()).unwrap();
        assert_eq!(sm.snooze_count(), 1);

        sm.transition_to(AlarmState::Ringing, None, false, now()).unwrap();
        sm.transition_to(AlarmState::Dismissed, None, false, now()).unwrap();
        assert_eq!(sm.snooze_count(), 0);
        assert!(sm.runtime().ringing_started_at.is_none());
        assert!(sm.runtime().current_trigger_kind.is_none());

        sm.transition_to(AlarmState::Armed, None, false, now()).unwrap();
        assert_eq!(sm.state(), AlarmState::Armed);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let mut sm = machine();
        let err = sm
            .transition_to(AlarmState::Snoozed, None, false, now())
            .unwrap_err();
        assert!(matches!(err, TransitionError::Invalid { .. }));
        assert_eq!(sm.state(), AlarmState::Armed);

        // Disabled only allows Armed.
        let mut off = Alarm::new("a2", "Off", "07:00");
        off.enabled = false;
        let mut sm = StateMachine::new(off, None);
        assert!(
            sm.transition_to(AlarmState::Ringing, None, false, now())
                .is_err()
        );
        assert!(sm.transition_to(AlarmState::Armed, None, false, now()).is_ok());
    }

    #[test]
    fn force_bypasses_the_table() {
        let mut sm = machine();
        sm.transition_to(AlarmState::Disabled, None, true, now()).unwrap();
        assert_eq!(sm.state(), AlarmState::Disabled);
        sm.transition_to(AlarmState::Ringing, None, true, now()).unwrap();
        assert_eq!(sm.state(), AlarmState::Ringing);
    }

    #[test]
    fn snooze_refused_at_cap_even_with_force() {
        let mut data = Alarm::new("a1", "Test", "07:00");
        data.max_snooze_count = 2;
        let mut sm = StateMachine::new(data, None);

        for _ in 0..2 {
            sm.transition_to(AlarmState::Ringing, None, false, now()).unwrap();
            sm.transition_to(AlarmState::Snoozed, None, false, now()).unwrap();
        }
        sm.transition_to(AlarmState::Ringing, None, false, now()).unwrap();
        let err = sm
            .transition_to(AlarmState::Snoozed, None, true, now())
            .unwrap_err();
        assert_eq!(err, TransitionError::SnoozeLimit { count: 2, max: 2 });
        assert_eq!(sm.state(), AlarmState::Ringing);
        assert_eq!(sm.snooze_count(), 2);
    }

    #[test]
    fn zero_max_snooze_refuses_first_snooze() {
        let mut data = Alarm::new("a1", "Test", "07:00");
        data.max_snooze_count = 0;
        let mut sm = StateMachine::new(data, None);
        sm.transition_to(AlarmState::Ringing, None, false, now()).unwrap();
        assert!(
            sm.transition_to(AlarmState::Snoozed, None, false, now())
                .is_err()
        );
    }

    #[test]
    fn hook_fires_on_every_successful_transition() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let hook: TransitionHook = Box::new(move |_id, _old, _new| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let mut sm = StateMachine::new(Alarm::new("a1", "Test", "07:00"), Some(hook));

        sm.transition_to(AlarmState::Ringing, None, false, now()).unwrap();
        sm.transition_to(AlarmState::Dismissed, None, false, now()).unwrap();
        let _ = sm.transition_to(AlarmState::Ringing, None, false, now());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn restore_downgrades_non_durable_states() {
        let mut sm = machine();
        for state in AlarmState::iter() {
            let mut snapshot = RuntimeState::default();
            snapshot.state = state;
            sm.restore(snapshot);
            match state {
                AlarmState::Snoozed => assert_eq!(sm.state(), AlarmState::Snoozed),
                AlarmState::Armed => assert_eq!(sm.state(), AlarmState::Armed),
                // Enabled alarm: everything else falls back to Armed.
                _ => assert_eq!(sm.state(), AlarmState::Armed),
            }
        }
    }

    #[test]
    fn restore_reconciles_with_enabled_flag() {
        let mut off = Alarm::new("a2", "Off", "07:00");
        off.enabled = false;
        let mut sm = StateMachine::new(off, None);

        let mut snapshot = RuntimeState::default();
        snapshot.state = AlarmState::Armed;
        sm.restore(snapshot);
        assert_eq!(sm.state(), AlarmState::Disabled);

        let mut snapshot = RuntimeState::default();
        snapshot.state = AlarmState::Snoozed;
        snapshot.snooze_count = 2;
        sm.restore(snapshot);
        assert_eq!(sm.state(), AlarmState::Disabled);
        assert_eq!(sm.snooze_count(), 0);
    }

    #[test]
    fn reachable_state_snooze_pairs_stay_within_bounds() {
        // Pseudo-random walk over the transition table; snooze_count must
        // never exceed max_snooze_count whatever path is taken.
        let mut data = Alarm::new("a1", "Test", "07:00");
        data.max_snooze_count = 3;
        let mut sm = StateMachine::new(data, None);

        let states: Vec<AlarmState> = AlarmState::iter().collect();
        let mut seed: u64 = 0x5eed;
        for _ in 0..500 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let target = states[(seed >> 33) as usize % states.len()];
            let _ = sm.transition_to(target, None, false, now());
            assert!(sm.snooze_count() <= sm.data().max_snooze_count);
            if sm.state() == AlarmState::Snoozed {
                assert!(sm.snooze_count() >= 1);
            }
        }
    }
}
