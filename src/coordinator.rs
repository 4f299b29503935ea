// File: ./src/coordinator.rs
//! Central coordinator for all alarms.
//!
//! This is the single source of truth for alarm lifecycle logic. The
//! coordinator uniquely owns every state machine and timer handle; hosts
//! interact through the command methods and receive read-only snapshots.
//! All work runs as tasks on one runtime, and per-alarm mutual exclusion is
//! an async mutex: the `(cancel timers, persist, re-arm)` sequence always
//! happens with that mutex held, so a command arriving mid-sequence waits.

use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use strum::IntoEnumIterator;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::clock::{CancelHandle, Clock, Timer};
use crate::context::AppContext;
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus, EventKind};
use crate::health::HealthStatus;
use crate::model::{
    Alarm, AlarmState, DayOfWeek, DeviceDefaults, GlobalSettings, RuntimeState, ScriptSlot,
    TriggerKind, sanitize_name,
};
use crate::pipeline::ExecutionPipeline;
use crate::runner::ScriptRunner;
use crate::schedule;
use crate::state_machine::{StateMachine, TransitionError, TransitionHook};
use crate::store::EngineStore;

/// Budget for the host's platform setup call: `start` must return within
/// this window or the host is expected to stop the engine.
pub const PLATFORM_SETUP_TIMEOUT_S: u64 = 30;

/// Main-timer fires landing closer than this to the previous trigger are
/// dropped as duplicates. Manual tests are exempt.
const DUPLICATE_FIRE_WINDOW_S: i64 = 60;

#[derive(Default)]
struct TimerSlots {
    main: Option<CancelHandle>,
    pre_alarm: Option<CancelHandle>,
    snooze_end: Option<CancelHandle>,
    auto_dismiss: Option<CancelHandle>,
}

impl TimerSlots {
    fn cancel_main(&mut self) {
        if let Some(handle) = self.main.take() {
            handle.cancel();
        }
    }
    fn cancel_pre_alarm(&mut self) {
        if let Some(handle) = self.pre_alarm.take() {
            handle.cancel();
        }
    }
    fn cancel_snooze_end(&mut self) {
        if let Some(handle) = self.snooze_end.take() {
            handle.cancel();
        }
    }
    fn cancel_auto_dismiss(&mut self) {
        if let Some(handle) = self.auto_dismiss.take() {
            handle.cancel();
        }
    }
    fn cancel_all(&mut self) {
        self.cancel_main();
        self.cancel_pre_alarm();
        self.cancel_snooze_end();
        self.cancel_auto_dismiss();
    }
    fn has(slot: &Option<CancelHandle>) -> bool {
        slot.as_ref().is_some_and(|h| !h.is_cancelled())
    }
}

struct AlarmEntry {
    /// Per-alarm mutex. Transitions and the cancel/persist/arm critical
    /// section are totally ordered by this lock.
    sm: Mutex<StateMachine>,
    timers: StdMutex<TimerSlots>,
}

pub struct Coordinator {
    /// Weak self-handle so timer callbacks can reach back into the
    /// coordinator without keeping it alive.
    me: Weak<Coordinator>,
    clock: Arc<dyn Clock>,
    timer: Arc<dyn Timer>,
    pipeline: ExecutionPipeline,
    bus: Arc<EventBus>,
    defaults: DeviceDefaults,
    store: StdMutex<EngineStore>,
    alarms: StdMutex<HashMap<String, Arc<AlarmEntry>>>,
    running: AtomicBool,
    accepting: AtomicBool,
    health: StdMutex<HealthStatus>,
    health_timer: StdMutex<Option<CancelHandle>>,
    update_subscribers: StdMutex<Vec<mpsc::UnboundedSender<()>>>,
    remove_hooks: StdMutex<Vec<Box<dyn Fn(&str) + Send + Sync>>>,
}

impl Coordinator {
    /// Build a coordinator. This loads the store (tolerating corruption)
    /// but arms nothing; call [`Coordinator::start`] to bring alarms up.
    pub fn new(
        ctx: Arc<dyn AppContext>,
        clock: Arc<dyn Clock>,
        timer: Arc<dyn Timer>,
        runner: Arc<dyn ScriptRunner>,
        defaults: DeviceDefaults,
    ) -> Arc<Self> {
        let bus = Arc::new(EventBus::new());
        let store = EngineStore::load(ctx);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            clock,
            timer,
            pipeline: ExecutionPipeline::new(runner, Arc::clone(&bus)),
            bus,
            defaults,
            store: StdMutex::new(store),
            alarms: StdMutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            accepting: AtomicBool::new(false),
            health: StdMutex::new(HealthStatus::default()),
            health_timer: StdMutex::new(None),
            update_subscribers: StdMutex::new(Vec::new()),
            remove_hooks: StdMutex::new(Vec::new()),
        })
    }

    // --- Observation surface ---

    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        self.bus.subscribe()
    }

    /// Coarse "something changed" notifications, complementing the event
    /// bus for hosts that mirror alarm state into their own entities.
    pub fn subscribe_updates(&self) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.update_subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Called with the alarm id after a removal, so the host can drop its
    /// own registrations for that alarm.
    pub fn register_remove_hook(&self, hook: Box<dyn Fn(&str) + Send + Sync>) {
        self.remove_hooks.lock().unwrap().push(hook);
    }

    pub fn health_status(&self) -> HealthStatus {
        self.health.lock().unwrap().clone()
    }

    pub fn settings(&self) -> GlobalSettings {
        self.store.lock().unwrap().settings().clone()
    }

    pub fn set_global_settings(&self, settings: GlobalSettings) -> Result<(), EngineError> {
        self.store
            .lock()
            .unwrap()
            .update_settings(settings)
            .map_err(EngineError::Persistence)
    }

    pub fn alarm_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.alarms.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn alarm_snapshot(&self, alarm_id: &str) -> Option<(Alarm, RuntimeState)> {
        let entry = self.entry(alarm_id)?;
        let sm = entry.sm.lock().await;
        Some((sm.data().clone(), sm.snapshot()))
    }

    pub async fn state_of(&self, alarm_id: &str) -> Option<AlarmState> {
        let entry = self.entry(alarm_id)?;
        let sm = entry.sm.lock().await;
        Some(sm.state())
    }

    /// Redacted snapshot for the host's diagnostics surface. Script
    /// routines are reported as presence flags, never by name.
    pub async fn diagnostics(&self) -> serde_json::Value {
        let mut alarms = Vec::new();
        for id in self.alarm_ids() {
            let Some(entry) = self.entry(&id) else { continue };
            let sm = entry.sm.lock().await;
            let data = sm.data();
            let scripts: Vec<String> = ScriptSlot::iter()
                .filter(|slot| data.script(*slot).is_some())
                .map(|slot| slot.key().to_string())
                .collect();
            alarms.push(serde_json::json!({
                "id": data.id,
                "name": data.name,
                "time": data.time,
                "enabled": data.enabled,
                "one_time": data.one_time,
                "skip_next": data.skip_next,
                "state": sm.state(),
                "snooze_count": sm.snooze_count(),
                "next_trigger_at": sm.runtime().next_trigger_at,
                "last_triggered": sm.runtime().last_triggered,
                "configured_scripts": scripts,
            }));
        }
        serde_json::json!({
            "store_version": self.store.lock().unwrap().version(),
            "alarm_count": alarms.len(),
            "alarms": alarms,
            "health": self.health_status(),
        })
    }

    // --- Lifecycle ---

    /// Bring the engine up: build machines from the store, restore runtime
    /// snapshots, re-arm or fire restored snoozes, recover missed alarms
    /// within the grace period, and start the health monitor.
    pub async fn start(&self) -> Result<(), EngineError> {
        log::info!("Starting alarm coordinator");
        self.running.store(true, Ordering::SeqCst);
        self.accepting.store(true, Ordering::SeqCst);

        let alarms_to_load = self.store.lock().unwrap().all_alarms();
        log::debug!("Loading {} alarms from storage", alarms_to_load.len());

        for mut alarm_data in alarms_to_load {
            let errors = alarm_data.validate();
            if !errors.is_empty() {
                // Quarantine rather than drop: the configuration stays
                // visible to the host, but nothing will fire.
                log::error!(
                    "Invalid stored alarm {}: {}. Disabling it.",
                    alarm_data.id,
                    errors.join("; ")
                );
                alarm_data.enabled = false;
                if let Err(err) = self.store.lock().unwrap().update_alarm(alarm_data.clone()) {
                    log::error!("Failed to persist quarantined alarm: {:#}", err);
                }
                self.bus.emit(EngineEvent {
                    timestamp: self.clock.now(),
                    alarm: None,
                    kind: EventKind::HealthWarning {
                        issues: vec![format!(
                            "Alarm {} disabled due to invalid data: {}",
                            alarm_data.id,
                            errors.join("; ")
                        )],
                    },
                });
            }

            let entry = Arc::new(AlarmEntry {
                sm: Mutex::new(StateMachine::new(
                    alarm_data.clone(),
                    Some(Self::transition_hook()),
                )),
                timers: StdMutex::new(TimerSlots::default()),
            });
            let saved = self
                .store
                .lock()
                .unwrap()
                .get_runtime_state(&alarm_data.id)
                .cloned();
            if let Some(saved) = saved {
                entry.sm.lock().await.restore(saved);
            }
            self.alarms
                .lock()
                .unwrap()
                .insert(alarm_data.id.clone(), entry);
        }

        // Restored snoozes: re-arm future ends, fire expired ones.
        for id in self.alarm_ids() {
            let Some(entry) = self.entry(&id) else { continue };
            let mut fire_now = false;
            {
                let mut sm = entry.sm.lock().await;
                if sm.state() != AlarmState::Snoozed {
                    continue;
                }
                let now = self.clock.now();
                match sm.runtime().snooze_end_at {
                    Some(end) if end > now => {
                        let handle = self.arm_snooze_end(&id, end);
                        let mut timers = entry.timers.lock().unwrap();
                        timers.cancel_snooze_end();
                        timers.snooze_end = Some(handle);
                        log::debug!("Re-armed restored snooze for alarm {} at {}", id, end);
                    }
                    _ => {
                        // Snooze expired while we were down.
                        sm.runtime_mut().snooze_end_at = None;
                        fire_now = true;
                    }
                }
            }
            if fire_now {
                self.trigger_alarm(&id, TriggerKind::Scheduled, false).await;
            }
        }

        // Missed-alarm detection, then normal scheduling.
        let grace_min = self
            .store
            .lock()
            .unwrap()
            .settings()
            .missed_alarm_grace_period_min;
        let grace = chrono::Duration::minutes(grace_min as i64);
        for id in self.alarm_ids() {
            let Some(entry) = self.entry(&id) else { continue };
            let mut missed_by: Option<chrono::Duration> = None;
            {
                let mut sm = entry.sm.lock().await;
                if sm.state() != AlarmState::Armed || !sm.data().enabled {
                    continue;
                }
                let now = self.clock.now();
                if let Some(prev) = schedule::previous_occurrence_in_tz(sm.data(), &now, &Local)
                    && sm.runtime().last_triggered.is_none_or(|t| t < prev)
                {
                    let by = now - prev;
                    if by <= grace {
                        missed_by = Some(by);
                    }
                }
                if missed_by.is_none() {
                    self.schedule_locked(&id, &entry, &mut sm, None);
                }
            }
            if let Some(by) = missed_by {
                log::warn!("Detected missed alarm {} (was due {}s ago)", id, by.num_seconds());
                {
                    let sm = entry.sm.lock().await;
                    self.bus.emit(EngineEvent {
                        timestamp: self.clock.now(),
                        alarm: Some(sm.event_snapshot()),
                        kind: EventKind::Missed {
                            missed_by_seconds: by.num_seconds(),
                        },
                    });
                }
                self.trigger_alarm(&id, TriggerKind::MissedRecovery, false)
                    .await;
            }
        }

        self.schedule_health_check();
        log::info!(
            "Alarm coordinator started with {} alarms",
            self.alarms.lock().unwrap().len()
        );
        Ok(())
    }

    /// Tear the engine down: refuse commands, cancel every timer, persist
    /// all runtime snapshots, abandon pending retries, drop subscribers.
    pub async fn stop(&self) {
        log::debug!("Stopping alarm coordinator");
        self.accepting.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.health_timer.lock().unwrap().take() {
            handle.cancel();
        }

        let entries: Vec<(String, Arc<AlarmEntry>)> = self
            .alarms
            .lock()
            .unwrap()
            .iter()
            .map(|(id, e)| (id.clone(), Arc::clone(e)))
            .collect();

        let mut snapshots = Vec::with_capacity(entries.len());
        for (id, entry) in entries {
            entry.timers.lock().unwrap().cancel_all();
            let sm = entry.sm.lock().await;
            snapshots.push((id, sm.snapshot()));
        }
        if let Err(err) = self.store.lock().unwrap().save_runtime_states(snapshots) {
            log::error!("Failed to persist runtime states at shutdown: {:#}", err);
        }

        self.pipeline.stop();
        self.bus.clear();
        self.update_subscribers.lock().unwrap().clear();
        self.remove_hooks.lock().unwrap().clear();
        log::info!("Alarm coordinator stopped");
    }

    // --- Command surface ---

    /// Add a new alarm. The name is sanitized; an empty id gets a generated
    /// one. Returns the effective alarm id.
    pub async fn add_alarm(&self, mut alarm: Alarm) -> Result<String, EngineError> {
        self.ensure_accepting()?;

        alarm.name = sanitize_name(&alarm.name).map_err(EngineError::Validation)?;
        if alarm.id.trim().is_empty() {
            let suffix: String = uuid::Uuid::new_v4().simple().to_string();
            alarm.id = format!("alarm_{}", &suffix[..8]);
        }
        let errors = alarm.validate();
        if !errors.is_empty() {
            return Err(EngineError::Validation(errors.join("; ")));
        }
        if self.alarms.lock().unwrap().contains_key(&alarm.id) {
            return Err(EngineError::Validation(format!(
                "alarm id already exists: {}",
                alarm.id
            )));
        }

        self.store
            .lock()
            .unwrap()
            .add_alarm(alarm.clone())
            .map_err(EngineError::Persistence)?;

        let entry = Arc::new(AlarmEntry {
            sm: Mutex::new(StateMachine::new(
                alarm.clone(),
                Some(Self::transition_hook()),
            )),
            timers: StdMutex::new(TimerSlots::default()),
        });
        self.alarms
            .lock()
            .unwrap()
            .insert(alarm.id.clone(), Arc::clone(&entry));

        {
            let mut sm = entry.sm.lock().await;
            if sm.state() == AlarmState::Armed {
                self.schedule_locked(&alarm.id, &entry, &mut sm, None);
            }
        }

        log::info!("Added new alarm: {}", alarm.id);
        self.notify_update();
        Ok(alarm.id)
    }

    /// Replace an alarm's configuration. Timers are cancelled, the new
    /// configuration persisted, and the alarm re-armed, all under the
    /// per-alarm critical section. `skip_next` is carried over unchanged.
    pub async fn update_alarm(&self, mut alarm: Alarm) -> Result<(), EngineError> {
        self.ensure_accepting()?;
        let entry = self.require_entry(&alarm.id)?;

        alarm.name = sanitize_name(&alarm.name).map_err(EngineError::Validation)?;
        let errors = alarm.validate();
        if !errors.is_empty() {
            return Err(EngineError::Validation(errors.join("; ")));
        }

        let alarm_id = alarm.id.clone();
        let mut sm = entry.sm.lock().await;
        alarm.skip_next = sm.data().skip_next;

        entry.timers.lock().unwrap().cancel_all();

        self.store
            .lock()
            .unwrap()
            .update_alarm(alarm.clone())
            .map_err(EngineError::Persistence)?;
        *sm.data_mut() = alarm;

        let now = self.clock.now();
        match sm.state() {
            AlarmState::Armed | AlarmState::Disabled => {
                if sm.data().enabled {
                    if sm.state() == AlarmState::Disabled {
                        let _ = sm.transition_to(AlarmState::Armed, None, false, now);
                    }
                    self.schedule_locked(&alarm_id, &entry, &mut sm, None);
                } else if sm.state() == AlarmState::Armed {
                    let _ = sm.transition_to(AlarmState::Disabled, None, false, now);
                }
            }
            AlarmState::Ringing => {
                // Keep the ring going under the new timings.
                let at = now + chrono::Duration::minutes(sm.data().auto_dismiss_timeout_min as i64);
                let handle = self.arm_auto_dismiss(&alarm_id, at);
                entry.timers.lock().unwrap().auto_dismiss = Some(handle);
            }
            AlarmState::Snoozed => {
                if let Some(end) = sm.runtime().snooze_end_at
                    && end > now
                {
                    let handle = self.arm_snooze_end(&alarm_id, end);
                    entry.timers.lock().unwrap().snooze_end = Some(handle);
                }
            }
            _ => {}
        }

        log::debug!("Updated alarm: {}", alarm_id);
        drop(sm);
        self.notify_update();
        Ok(())
    }

    /// Remove an alarm: all four timer kinds unregistered, no trace left in
    /// the store, host removal hooks invoked.
    pub async fn remove_alarm(&self, alarm_id: &str) -> Result<(), EngineError> {
        self.ensure_accepting()?;
        let entry = self.require_entry(alarm_id)?;

        {
            let _sm = entry.sm.lock().await;
            entry.timers.lock().unwrap().cancel_all();
            self.store
                .lock()
                .unwrap()
                .remove_alarm(alarm_id)
                .map_err(EngineError::Persistence)?;
        }
        self.alarms.lock().unwrap().remove(alarm_id);

        let hooks = self.remove_hooks.lock().unwrap();
        for hook in hooks.iter() {
            hook(alarm_id);
        }
        drop(hooks);

        log::info!("Removed alarm {}", alarm_id);
        self.notify_update();
        Ok(())
    }

    /// Enable or disable an alarm, running the `on_arm` / `on_cancel`
    /// routines as appropriate.
    pub async fn set_enabled(
        &self,
        alarm_id: &str,
        enabled: bool,
    ) -> Result<(), EngineError> {
        self.ensure_accepting()?;
        let entry = self.require_entry(alarm_id)?;
        let mut sm = entry.sm.lock().await;

        let mut updated = sm.data().clone();
        updated.enabled = enabled;
        self.store
            .lock()
            .unwrap()
            .update_alarm(updated.clone())
            .map_err(EngineError::Persistence)?;
        *sm.data_mut() = updated;

        let now = self.clock.now();
        if enabled {
            {
                // Force-arming from an active state also ends any ring.
                let mut timers = entry.timers.lock().unwrap();
                timers.cancel_snooze_end();
                timers.cancel_auto_dismiss();
            }
            let _ = sm.transition_to(AlarmState::Armed, None, true, now);
            self.schedule_locked(alarm_id, &entry, &mut sm, None);
            self.emit_alarm_event(&sm, EventKind::Armed);
            let (cfg, ctx, snapshot) = (sm.data().clone(), sm.script_context(), sm.event_snapshot());
            drop(sm);
            self.pipeline
                .run_slot(
                    &cfg,
                    &self.defaults,
                    ScriptSlot::OnArm,
                    &ctx,
                    Some(snapshot),
                    self.clock.now(),
                )
                .await;
        } else {
            let was_active = matches!(
                sm.state(),
                AlarmState::Ringing | AlarmState::Snoozed | AlarmState::PreAlarm
            );
            {
                let mut timers = entry.timers.lock().unwrap();
                timers.cancel_main();
                timers.cancel_pre_alarm();
                if was_active {
                    timers.cancel_snooze_end();
                    timers.cancel_auto_dismiss();
                }
            }
            let _ = sm.transition_to(AlarmState::Disabled, None, true, now);
            sm.runtime_mut().next_trigger_at = None;
            self.persist_runtime(alarm_id, sm.snapshot());
            self.emit_alarm_event(&sm, EventKind::Disarmed);
            let (cfg, ctx, snapshot) = (sm.data().clone(), sm.script_context(), sm.event_snapshot());
            drop(sm);
            if was_active {
                self.pipeline
                    .run_slot(
                        &cfg,
                        &self.defaults,
                        ScriptSlot::OnCancel,
                        &ctx,
                        Some(snapshot),
                        self.clock.now(),
                    )
                    .await;
            }
        }

        self.notify_update();
        Ok(())
    }

    pub async fn set_time(&self, alarm_id: &str, time: &str) -> Result<(), EngineError> {
        self.ensure_accepting()?;
        let entry = self.require_entry(alarm_id)?;
        crate::model::parse_alarm_time(time).map_err(EngineError::Validation)?;

        let mut sm = entry.sm.lock().await;
        let old_time = sm.data().time.clone();
        let mut updated = sm.data().clone();
        updated.time = time.to_string();
        self.store
            .lock()
            .unwrap()
            .update_alarm(updated.clone())
            .map_err(EngineError::Persistence)?;
        *sm.data_mut() = updated;

        if sm.state() == AlarmState::Armed {
            self.schedule_locked(alarm_id, &entry, &mut sm, None);
        }
        self.emit_alarm_event(&sm, EventKind::TimeChanged { old_time });
        drop(sm);
        self.notify_update();
        Ok(())
    }

    pub async fn set_days(
        &self,
        alarm_id: &str,
        days: Vec<DayOfWeek>,
    ) -> Result<(), EngineError> {
        self.ensure_accepting()?;
        let entry = self.require_entry(alarm_id)?;

        let mut seen = std::collections::HashSet::new();
        for day in &days {
            if !seen.insert(*day) {
                return Err(EngineError::Validation(format!(
                    "duplicate day in schedule: {}",
                    day
                )));
            }
        }

        let mut sm = entry.sm.lock().await;
        if days.is_empty() && !sm.data().one_time {
            return Err(EngineError::Validation(
                "a recurring alarm needs at least one weekday".to_string(),
            ));
        }
        let mut updated = sm.data().clone();
        updated.days = days;
        self.store
            .lock()
            .unwrap()
            .update_alarm(updated.clone())
            .map_err(EngineError::Persistence)?;
        *sm.data_mut() = updated;

        if sm.state() == AlarmState::Armed {
            self.schedule_locked(alarm_id, &entry, &mut sm, None);
        }
        drop(sm);
        self.notify_update();
        Ok(())
    }

    /// Partially update script slots and execution parameters. Setting any
    /// individual script opts the alarm out of device defaults.
    pub async fn set_scripts(
        &self,
        alarm_id: &str,
        slots: &[(ScriptSlot, Option<String>)],
        timeout_s: Option<u32>,
        retry_count: Option<u32>,
    ) -> Result<(), EngineError> {
        self.ensure_accepting()?;
        let entry = self.require_entry(alarm_id)?;

        let mut sm = entry.sm.lock().await;
        let mut updated = sm.data().clone();
        updated.use_device_defaults = false;
        for (slot, routine) in slots {
            updated.set_script(*slot, routine.clone());
        }
        if let Some(timeout_s) = timeout_s {
            updated.script_timeout_s = timeout_s;
        }
        if let Some(retry_count) = retry_count {
            updated.script_retry_count = retry_count;
        }
        let errors = updated.validate();
        if !errors.is_empty() {
            return Err(EngineError::Validation(errors.join("; ")));
        }

        self.store
            .lock()
            .unwrap()
            .update_alarm(updated.clone())
            .map_err(EngineError::Persistence)?;
        *sm.data_mut() = updated;
        drop(sm);
        self.notify_update();
        Ok(())
    }

    /// Snooze a ringing alarm. `Ok(false)` means the snooze cap was hit;
    /// snoozing from any state but `Ringing` is a state conflict.
    pub async fn snooze(
        &self,
        alarm_id: &str,
        duration_min: Option<u32>,
    ) -> Result<bool, EngineError> {
        self.ensure_accepting()?;
        let entry = self.require_entry(alarm_id)?;

        if let Some(duration) = duration_min
            && !(1..=60).contains(&duration)
        {
            return Err(EngineError::Validation(
                "snooze duration must be between 1 and 60 minutes".to_string(),
            ));
        }

        let mut sm = entry.sm.lock().await;
        if sm.state() != AlarmState::Ringing {
            return Err(EngineError::state_conflict(sm.state(), "alarm is not ringing"));
        }

        let now = self.clock.now();
        match sm.transition_to(AlarmState::Snoozed, None, false, now) {
            Ok(()) => {}
            Err(TransitionError::SnoozeLimit { count, max }) => {
                log::warn!(
                    "Cannot snooze alarm {} - max snooze count reached ({}/{})",
                    alarm_id,
                    count,
                    max
                );
                return Ok(false);
            }
            Err(err) => {
                return Err(EngineError::state_conflict(sm.state(), err.to_string()));
            }
        }

        let duration = duration_min.unwrap_or(sm.data().snooze_duration_min);
        let snooze_end = now + chrono::Duration::minutes(duration as i64);
        sm.runtime_mut().snooze_end_at = Some(snooze_end);

        entry.timers.lock().unwrap().cancel_auto_dismiss();
        self.persist_runtime(alarm_id, sm.snapshot());
        let handle = self.arm_snooze_end(alarm_id, snooze_end);
        {
            let mut timers = entry.timers.lock().unwrap();
            timers.cancel_snooze_end();
            timers.snooze_end = Some(handle);
        }

        log::info!(
            "Alarm {} snoozed for {} minutes (snooze {}/{})",
            alarm_id,
            duration,
            sm.snooze_count(),
            sm.data().max_snooze_count
        );
        self.emit_alarm_event(&sm, EventKind::Snoozed { duration_min: duration });
        let (cfg, ctx, snapshot) = (sm.data().clone(), sm.script_context(), sm.event_snapshot());
        drop(sm);

        self.pipeline
            .run_slot(
                &cfg,
                &self.defaults,
                ScriptSlot::OnSnooze,
                &ctx,
                Some(snapshot),
                self.clock.now(),
            )
            .await;
        self.notify_update();
        Ok(true)
    }

    /// Dismiss an active alarm (ringing, snoozed, or in pre-alarm). Runs
    /// `on_dismiss` and `post_alarm`, then disables a one-time alarm or
    /// re-arms for the next occurrence.
    pub async fn dismiss(&self, alarm_id: &str) -> Result<(), EngineError> {
        self.ensure_accepting()?;
        let entry = self.require_entry(alarm_id)?;

        let (cfg, ctx, snapshot, floor) = {
            let mut sm = entry.sm.lock().await;
            let state = sm.state();
            if !matches!(
                state,
                AlarmState::Ringing | AlarmState::Snoozed | AlarmState::PreAlarm
            ) {
                return Err(EngineError::state_conflict(state, "alarm is not active"));
            }
            let from_pre_alarm = state == AlarmState::PreAlarm;
            // Dismissing during pre-alarm also swallows the pending ring;
            // the next occurrence is computed past it.
            let floor = if from_pre_alarm {
                sm.runtime()
                    .next_trigger_at
                    .map(|t| t + chrono::Duration::minutes(1))
            } else {
                None
            };

            {
                let mut timers = entry.timers.lock().unwrap();
                timers.cancel_auto_dismiss();
                timers.cancel_snooze_end();
                if from_pre_alarm {
                    timers.cancel_main();
                    timers.cancel_pre_alarm();
                }
            }

            let now = self.clock.now();
            sm.transition_to(AlarmState::Dismissed, None, from_pre_alarm, now)
                .map_err(|err| EngineError::state_conflict(state, err.to_string()))?;
            self.persist_runtime(alarm_id, sm.snapshot());
            self.emit_alarm_event(&sm, EventKind::Dismissed);
            log::info!("Alarm {} dismissed", alarm_id);
            (sm.data().clone(), sm.script_context(), sm.event_snapshot(), floor)
        };

        self.pipeline
            .run_slot(
                &cfg,
                &self.defaults,
                ScriptSlot::OnDismiss,
                &ctx,
                Some(snapshot.clone()),
                self.clock.now(),
            )
            .await;
        self.pipeline
            .run_slot(
                &cfg,
                &self.defaults,
                ScriptSlot::PostAlarm,
                &ctx,
                Some(snapshot),
                self.clock.now(),
            )
            .await;

        self.finish_cycle(alarm_id, &entry, AlarmState::Dismissed, floor)
            .await;
        self.notify_update();
        Ok(())
    }

    /// Suppress the next otherwise-matching occurrence. The flag clears
    /// when the post-skip occurrence actually fires, so `cancel_skip`
    /// remains meaningful until then.
    pub async fn skip_next(&self, alarm_id: &str) -> Result<(), EngineError> {
        self.ensure_accepting()?;
        let entry = self.require_entry(alarm_id)?;

        let (cfg, ctx, snapshot) = {
            let mut sm = entry.sm.lock().await;
            let mut updated = sm.data().clone();
            updated.skip_next = true;
            self.store
                .lock()
                .unwrap()
                .update_alarm(updated.clone())
                .map_err(EngineError::Persistence)?;
            *sm.data_mut() = updated;

            {
                let mut timers = entry.timers.lock().unwrap();
                timers.cancel_main();
                timers.cancel_pre_alarm();
            }
            if sm.state() == AlarmState::Armed {
                self.schedule_locked(alarm_id, &entry, &mut sm, None);
            }
            log::info!("Alarm {} - next occurrence will be skipped", alarm_id);
            self.emit_alarm_event(&sm, EventKind::Skipped);
            (sm.data().clone(), sm.script_context(), sm.event_snapshot())
        };

        self.pipeline
            .run_slot(
                &cfg,
                &self.defaults,
                ScriptSlot::OnSkip,
                &ctx,
                Some(snapshot),
                self.clock.now(),
            )
            .await;
        self.notify_update();
        Ok(())
    }

    pub async fn cancel_skip(&self, alarm_id: &str) -> Result<(), EngineError> {
        self.ensure_accepting()?;
        let entry = self.require_entry(alarm_id)?;

        let mut sm = entry.sm.lock().await;
        let mut updated = sm.data().clone();
        updated.skip_next = false;
        self.store
            .lock()
            .unwrap()
            .update_alarm(updated.clone())
            .map_err(EngineError::Persistence)?;
        *sm.data_mut() = updated;

        if sm.state() == AlarmState::Armed {
            self.schedule_locked(alarm_id, &entry, &mut sm, None);
        }
        drop(sm);
        self.notify_update();
        Ok(())
    }

    /// Ring the alarm now with `trigger_kind = ManualTest`. Refused while
    /// the alarm is already active.
    pub async fn test_alarm(&self, alarm_id: &str) -> Result<(), EngineError> {
        self.ensure_accepting()?;
        let entry = self.require_entry(alarm_id)?;
        {
            let sm = entry.sm.lock().await;
            if matches!(sm.state(), AlarmState::Ringing | AlarmState::Snoozed) {
                return Err(EngineError::state_conflict(sm.state(), "alarm is already active"));
            }
        }

        log::info!("Testing alarm {}", alarm_id);
        if self
            .trigger_alarm(alarm_id, TriggerKind::ManualTest, false)
            .await
        {
            Ok(())
        } else {
            let state = self.state_of(alarm_id).await.unwrap_or_default();
            Err(EngineError::state_conflict(
                state,
                "alarm cannot be triggered from its current state",
            ))
        }
    }

    // --- Timer handlers ---

    async fn handle_main_fire(&self, alarm_id: &str) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        if let Some(entry) = self.entry(alarm_id) {
            entry.timers.lock().unwrap().main = None;
        }
        self.trigger_alarm(alarm_id, TriggerKind::Scheduled, true)
            .await;
    }

    async fn handle_pre_alarm(&self, alarm_id: &str) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let Some(entry) = self.entry(alarm_id) else { return };
        entry.timers.lock().unwrap().pre_alarm = None;

        let (cfg, ctx, snapshot) = {
            let mut sm = entry.sm.lock().await;
            if sm.state() != AlarmState::Armed {
                return;
            }
            let now = self.clock.now();
            if sm
                .transition_to(AlarmState::PreAlarm, None, false, now)
                .is_err()
            {
                return;
            }
            log::debug!("Pre-alarm triggered for {}", alarm_id);
            self.emit_alarm_event(&sm, EventKind::PreAlarm);
            (sm.data().clone(), sm.script_context(), sm.event_snapshot())
        };

        self.pipeline
            .run_slot(
                &cfg,
                &self.defaults,
                ScriptSlot::PreAlarm,
                &ctx,
                Some(snapshot),
                self.clock.now(),
            )
            .await;
        self.notify_update();
    }

    async fn handle_snooze_end(&self, alarm_id: &str) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let Some(entry) = self.entry(alarm_id) else { return };
        entry.timers.lock().unwrap().snooze_end = None;
        {
            let sm = entry.sm.lock().await;
            if sm.state() != AlarmState::Snoozed {
                return;
            }
        }
        log::debug!("Snooze ended for alarm {}", alarm_id);
        self.trigger_alarm(alarm_id, TriggerKind::Scheduled, false)
            .await;
    }

    async fn handle_auto_dismiss(&self, alarm_id: &str) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let Some(entry) = self.entry(alarm_id) else { return };
        entry.timers.lock().unwrap().auto_dismiss = None;

        let (cfg, ctx, snapshot) = {
            let mut sm = entry.sm.lock().await;
            if sm.state() != AlarmState::Ringing {
                return;
            }
            let now = self.clock.now();
            if sm
                .transition_to(AlarmState::AutoDismissed, None, false, now)
                .is_err()
            {
                return;
            }
            entry.timers.lock().unwrap().cancel_snooze_end();
            self.persist_runtime(alarm_id, sm.snapshot());
            log::info!("Auto-dismissing alarm {} after timeout", alarm_id);
            self.emit_alarm_event(&sm, EventKind::AutoDismissed);
            (sm.data().clone(), sm.script_context(), sm.event_snapshot())
        };

        self.pipeline
            .run_slot(
                &cfg,
                &self.defaults,
                ScriptSlot::PostAlarm,
                &ctx,
                Some(snapshot),
                self.clock.now(),
            )
            .await;

        self.finish_cycle(alarm_id, &entry, AlarmState::AutoDismissed, None)
            .await;
        self.notify_update();
    }

    // --- Internals ---

    /// Drive an alarm to `Ringing`, arm auto-dismiss, run the alarm script.
    /// With `dedupe`, a fire within the duplicate window of the previous
    /// trigger is ignored.
    async fn trigger_alarm(
        &self,
        alarm_id: &str,
        kind: TriggerKind,
        dedupe: bool,
    ) -> bool {
        let Some(entry) = self.entry(alarm_id) else {
            return false;
        };

        let (cfg, ctx, snapshot) = {
            let mut sm = entry.sm.lock().await;
            let now = self.clock.now();

            if dedupe
                && kind != TriggerKind::ManualTest
                && let Some(last) = sm.runtime().last_triggered
                && (now - last).num_seconds() < DUPLICATE_FIRE_WINDOW_S
            {
                log::debug!(
                    "Ignoring duplicate trigger for alarm {} (last trigger: {})",
                    alarm_id,
                    last
                );
                return false;
            }

            if let Err(err) = sm.transition_to(AlarmState::Ringing, Some(kind), false, now) {
                log::warn!(
                    "Failed to transition alarm {} to ringing state: {}",
                    alarm_id,
                    err
                );
                return false;
            }

            // A scheduled fire is the "moment of emission" that consumes a
            // pending skip flag.
            if sm.data().skip_next && kind != TriggerKind::ManualTest {
                let mut updated = sm.data().clone();
                updated.skip_next = false;
                match self.store.lock().unwrap().update_alarm(updated.clone()) {
                    Ok(()) => *sm.data_mut() = updated,
                    Err(err) => log::error!("Failed to clear skip flag: {:#}", err),
                }
            }

            sm.runtime_mut().next_trigger_at = None;
            self.persist_runtime(alarm_id, sm.snapshot());

            let at = now + chrono::Duration::minutes(sm.data().auto_dismiss_timeout_min as i64);
            let handle = self.arm_auto_dismiss(alarm_id, at);
            {
                let mut timers = entry.timers.lock().unwrap();
                timers.cancel_auto_dismiss();
                timers.auto_dismiss = Some(handle);
            }

            self.emit_alarm_event(&sm, EventKind::Triggered);
            (sm.data().clone(), sm.script_context(), sm.event_snapshot())
        };

        log::info!("Alarm {} triggered ({})", alarm_id, kind);
        self.pipeline
            .run_slot(
                &cfg,
                &self.defaults,
                ScriptSlot::Alarm,
                &ctx,
                Some(snapshot),
                self.clock.now(),
            )
            .await;
        self.notify_update();
        true
    }

    /// After a dismissal or auto-dismissal: disable a one-time alarm, or
    /// re-arm for the next occurrence. Skipped when another command has
    /// already moved the alarm out of `expected`.
    async fn finish_cycle(
        &self,
        alarm_id: &str,
        entry: &Arc<AlarmEntry>,
        expected: AlarmState,
        floor: Option<DateTime<Local>>,
    ) {
        let mut sm = entry.sm.lock().await;
        if sm.state() != expected {
            log::debug!(
                "Alarm {} moved to {} during script execution, skipping re-arm",
                alarm_id,
                sm.state()
            );
            return;
        }
        let now = self.clock.now();
        if sm.data().one_time {
            let mut updated = sm.data().clone();
            updated.enabled = false;
            match self.store.lock().unwrap().update_alarm(updated.clone()) {
                Ok(()) => *sm.data_mut() = updated,
                Err(err) => log::error!("Failed to disable one-time alarm: {:#}", err),
            }
            let _ = sm.transition_to(AlarmState::Disabled, None, false, now);
            sm.runtime_mut().next_trigger_at = None;
            self.persist_runtime(alarm_id, sm.snapshot());
            log::info!("One-time alarm {} completed and disabled", alarm_id);
        } else if sm.transition_to(AlarmState::Armed, None, false, now).is_ok() {
            self.schedule_locked(alarm_id, entry, &mut sm, floor);
        }
    }

    /// Compute and arm the next trigger (and pre-alarm) for an alarm.
    /// Callers hold the per-alarm mutex; the new schedule is flushed to the
    /// store before any timer is armed.
    fn schedule_locked(
        &self,
        alarm_id: &str,
        entry: &Arc<AlarmEntry>,
        sm: &mut StateMachine,
        floor: Option<DateTime<Local>>,
    ) {
        let now = self.clock.now();
        {
            let mut timers = entry.timers.lock().unwrap();
            timers.cancel_main();
            timers.cancel_pre_alarm();
        }

        if !sm.data().enabled {
            sm.runtime_mut().next_trigger_at = None;
            self.persist_runtime(alarm_id, sm.snapshot());
            return;
        }

        let base = match floor {
            Some(f) if f > now => f,
            _ => now,
        };
        let next = schedule::next_trigger_in_tz(sm.data(), &base, &Local);
        sm.runtime_mut().next_trigger_at = next;
        self.persist_runtime(alarm_id, sm.snapshot());

        let Some(next) = next else {
            log::debug!("Alarm {} has no upcoming occurrence", alarm_id);
            return;
        };

        if sm.data().pre_alarm_duration_min > 0 {
            let pre_at = next - chrono::Duration::minutes(sm.data().pre_alarm_duration_min as i64);
            if pre_at > now {
                let handle = self.arm_pre_alarm(alarm_id, pre_at);
                entry.timers.lock().unwrap().pre_alarm = Some(handle);
            }
        }

        let handle = self.arm_main(alarm_id, next);
        entry.timers.lock().unwrap().main = Some(handle);
        log::debug!("Scheduled alarm {} for {}", alarm_id, next);
    }

    fn arm_main(&self, alarm_id: &str, at: DateTime<Local>) -> CancelHandle {
        let me = self.me.clone();
        let alarm_id = alarm_id.to_string();
        self.timer.arm_at(
            at,
            Box::new(move || {
                Box::pin(async move {
                    if let Some(coordinator) = me.upgrade() {
                        coordinator.handle_main_fire(&alarm_id).await;
                    }
                })
            }),
        )
    }

    fn arm_pre_alarm(&self, alarm_id: &str, at: DateTime<Local>) -> CancelHandle {
        let me = self.me.clone();
        let alarm_id = alarm_id.to_string();
        self.timer.arm_at(
            at,
            Box::new(move || {
                Box::pin(async move {
                    if let Some(coordinator) = me.upgrade() {
                        coordinator.handle_pre_alarm(&alarm_id).await;
                    }
                })
            }),
        )
    }

    fn arm_snooze_end(&self, alarm_id: &str, at: DateTime<Local>) -> CancelHandle {
        let me = self.me.clone();
        let alarm_id = alarm_id.to_string();
        self.timer.arm_at(
            at,
            Box::new(move || {
                Box::pin(async move {
                    if let Some(coordinator) = me.upgrade() {
                        coordinator.handle_snooze_end(&alarm_id).await;
                    }
                })
            }),
        )
    }

    fn arm_auto_dismiss(&self, alarm_id: &str, at: DateTime<Local>) -> CancelHandle {
        let me = self.me.clone();
        let alarm_id = alarm_id.to_string();
        self.timer.arm_at(
            at,
            Box::new(move || {
                Box::pin(async move {
                    if let Some(coordinator) = me.upgrade() {
                        coordinator.handle_auto_dismiss(&alarm_id).await;
                    }
                })
            }),
        )
    }

    // --- Health monitor ---

    fn schedule_health_check(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let interval = self.store.lock().unwrap().settings().watchdog_timeout_s;
        let at = self.clock.now() + chrono::Duration::seconds(interval as i64);
        let me = self.me.clone();
        let handle = self.timer.arm_at(
            at,
            Box::new(move || {
                Box::pin(async move {
                    if let Some(coordinator) = me.upgrade() {
                        coordinator.run_health_check().await;
                        coordinator.schedule_health_check();
                    }
                })
            }),
        );
        let mut slot = self.health_timer.lock().unwrap();
        if let Some(old) = slot.take() {
            old.cancel();
        }
        *slot = Some(handle);
    }

    /// One watchdog pass: verify timer/state consistency, self-heal what
    /// can be healed, surface the rest as a `HealthWarning`.
    pub async fn run_health_check(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let now = self.clock.now();
        let mut issues = Vec::new();
        let mut active_alarms = 0usize;

        let entries: Vec<(String, Arc<AlarmEntry>)> = self
            .alarms
            .lock()
            .unwrap()
            .iter()
            .map(|(id, e)| (id.clone(), Arc::clone(e)))
            .collect();
        let alarm_count = entries.len();

        for (alarm_id, entry) in &entries {
            let mut sm = entry.sm.lock().await;

            // Unresolved script references are warnings, never fatal.
            for slot in ScriptSlot::iter() {
                if let Some(routine) = sm.data().script(slot)
                    && !self.pipeline.runner().resolves(routine)
                {
                    issues.push(format!(
                        "Alarm {} references unresolved routine '{}' ({})",
                        alarm_id, routine, slot
                    ));
                }
            }

            let state = sm.state();
            if matches!(state, AlarmState::Ringing | AlarmState::Snoozed) {
                active_alarms += 1;
            }

            let (has_main, has_snooze, has_auto) = {
                let timers = entry.timers.lock().unwrap();
                (
                    TimerSlots::has(&timers.main),
                    TimerSlots::has(&timers.snooze_end),
                    TimerSlots::has(&timers.auto_dismiss),
                )
            };

            if sm.data().enabled
                && state == AlarmState::Armed
                && !has_main
                && sm.runtime().next_trigger_at.is_some()
            {
                issues.push(format!("Alarm {} is armed but not scheduled", alarm_id));
                log::warn!("Health: rescheduling unarmed alarm {}", alarm_id);
                self.schedule_locked(alarm_id, entry, &mut sm, None);
            } else if state == AlarmState::Ringing && !has_auto {
                issues.push(format!(
                    "Alarm {} is ringing but has no auto-dismiss timer",
                    alarm_id
                ));
                log::warn!("Health: re-arming auto-dismiss for alarm {}", alarm_id);
                let at =
                    now + chrono::Duration::minutes(sm.data().auto_dismiss_timeout_min as i64);
                let handle = self.arm_auto_dismiss(alarm_id, at);
                entry.timers.lock().unwrap().auto_dismiss = Some(handle);
            } else if state == AlarmState::Snoozed && !has_snooze {
                issues.push(format!(
                    "Alarm {} is snoozed but has no wake timer",
                    alarm_id
                ));
                log::warn!("Health: waking lost snooze for alarm {}", alarm_id);
                drop(sm);
                self.trigger_alarm(alarm_id, TriggerKind::Scheduled, false)
                    .await;
            }
        }

        let status = HealthStatus::new_pass(now, issues.clone(), alarm_count, active_alarms);
        *self.health.lock().unwrap() = status;

        if !issues.is_empty() {
            log::warn!("Health check found issues: {:?}", issues);
            self.bus.emit(EngineEvent {
                timestamp: now,
                alarm: None,
                kind: EventKind::HealthWarning { issues },
            });
        }
        self.notify_update();
    }

    // --- Helpers ---

    /// Observer installed on every state machine; reports each
    /// successful transition.
    fn transition_hook() -> TransitionHook {
        Box::new(|alarm_id, old, new| {
            log::debug!("Alarm {} state changed: {} -> {}", alarm_id, old, new);
        })
    }

    fn entry(&self, alarm_id: &str) -> Option<Arc<AlarmEntry>> {
        self.alarms.lock().unwrap().get(alarm_id).cloned()
    }

    fn require_entry(&self, alarm_id: &str) -> Result<Arc<AlarmEntry>, EngineError> {
        self.entry(alarm_id)
            .ok_or_else(|| EngineError::NotFound(alarm_id.to_string()))
    }

    fn ensure_accepting(&self) -> Result<(), EngineError> {
        if self.accepting.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Stopped)
        }
    }

    fn persist_runtime(&self, alarm_id: &str, snapshot: RuntimeState) {
        if let Err(err) = self
            .store
            .lock()
            .unwrap()
            .save_runtime_state(alarm_id, snapshot)
        {
            log::error!(
                "Failed to persist runtime state for alarm {}: {:#}",
                alarm_id,
                err
            );
        }
    }

    fn emit_alarm_event(&self, sm: &StateMachine, kind: EventKind) {
        self.bus.emit(EngineEvent {
            timestamp: self.clock.now(),
            alarm: Some(sm.event_snapshot()),
            kind,
        });
    }

    fn notify_update(&self) {
        let subscribers: Vec<_> = self.update_subscribers.lock().unwrap().clone();
        let mut any_closed = false;
        for tx in &subscribers {
            if tx.send(()).is_err() {
                any_closed = true;
            }
        }
        if any_closed {
            self.update_subscribers
                .lock()
                .unwrap()
                .retain(|tx| !tx.is_closed());
        }
    }
}
