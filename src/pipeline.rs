// File: ./src/pipeline.rs
//! Execution pipeline around the `ScriptRunner`: per-attempt timeout,
//! bounded retry with exponential backoff, and a one-shot fallback slot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::events::{AlarmSnapshot, EngineEvent, EventBus, EventKind};
use crate::model::{Alarm, DeviceDefaults, ScriptSlot};
use crate::runner::{ScriptContext, ScriptRunner};

/// Resolve the routine for `slot`, applying device defaults when the alarm
/// opted in and left the slot unset.
pub fn resolve_script(alarm: &Alarm, defaults: &DeviceDefaults, slot: ScriptSlot) -> Option<String> {
    if !alarm.use_device_defaults {
        return alarm.script(slot).map(str::to_string);
    }
    alarm
        .script(slot)
        .or_else(|| defaults.script(slot))
        .map(str::to_string)
}

pub fn resolve_timeout_s(alarm: &Alarm, defaults: &DeviceDefaults) -> u32 {
    if alarm.use_device_defaults {
        defaults.script_timeout_s
    } else {
        alarm.script_timeout_s
    }
}

pub fn resolve_retry_count(alarm: &Alarm, defaults: &DeviceDefaults) -> u32 {
    if alarm.use_device_defaults {
        defaults.script_retry_count
    } else {
        alarm.script_retry_count
    }
}

pub struct ExecutionPipeline {
    runner: Arc<dyn ScriptRunner>,
    bus: Arc<EventBus>,
    /// Set on shutdown; pending retries bail out instead of sleeping.
    stopping: Arc<AtomicBool>,
}

impl ExecutionPipeline {
    pub fn new(runner: Arc<dyn ScriptRunner>, bus: Arc<EventBus>) -> Self {
        Self {
            runner,
            bus,
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn runner(&self) -> &Arc<dyn ScriptRunner> {
        &self.runner
    }

    /// Abandon outstanding retry loops (best-effort, checked between
    /// attempts). In-flight attempts run to completion.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    /// Run the routine bound to `slot` for this alarm. An unbound slot is a
    /// successful no-op. Returns false once every attempt (and the fallback,
    /// where applicable) has failed; the caller's state is never rolled back
    /// on script failure.
    pub async fn run_slot(
        &self,
        alarm: &Alarm,
        defaults: &DeviceDefaults,
        slot: ScriptSlot,
        context: &ScriptContext,
        snapshot: Option<AlarmSnapshot>,
        timestamp: chrono::DateTime<chrono::Local>,
    ) -> bool {
        self.run_slot_inner(alarm, defaults, slot, context, snapshot, timestamp)
            .await
    }

    fn run_slot_inner<'a>(
        &'a self,
        alarm: &'a Alarm,
        defaults: &'a DeviceDefaults,
        slot: ScriptSlot,
        context: &'a ScriptContext,
        snapshot: Option<AlarmSnapshot>,
        timestamp: chrono::DateTime<chrono::Local>,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let Some(routine) = resolve_script(alarm, defaults, slot) else {
                return true;
            };

            let timeout_s = resolve_timeout_s(alarm, defaults) as u64;
            let retry_count = resolve_retry_count(alarm, defaults);
            let attempts = retry_count + 1;
            let mut last_error = String::new();

            for attempt in 0..attempts {
                log::debug!(
                    "Executing {} routine '{}' for alarm {} (attempt {}/{})",
                    slot,
                    routine,
                    alarm.id,
                    attempt + 1,
                    attempts
                );

                let run = self.runner.run(&routine, context);
                match tokio::time::timeout(Duration::from_secs(timeout_s), run).await {
                    Ok(Ok(())) => {
                        log::debug!(
                            "Routine '{}' ({}) succeeded for alarm {}",
                            routine,
                            slot,
                            alarm.id
                        );
                        return true;
                    }
                    Ok(Err(err)) => {
                        last_error = err.to_string();
                        log::warn!(
                            "Routine '{}' ({}) failed for alarm {} (attempt {}/{}): {}",
                            routine,
                            slot,
                            alarm.id,
                            attempt + 1,
                            attempts,
                            last_error
                        );
                    }
                    Err(_) => {
                        last_error = format!("timed out after {}s", timeout_s);
                        log::warn!(
                            "Routine '{}' ({}) timed out for alarm {} (attempt {}/{})",
                            routine,
                            slot,
                            alarm.id,
                            attempt + 1,
                            attempts
                        );
                    }
                }

                if self.stopping.load(Ordering::SeqCst) {
                    log::debug!("Shutdown in progress, abandoning retries for '{}'", routine);
                    return false;
                }
                if attempt < retry_count {
                    tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                }
            }

            log::error!(
                "Routine '{}' ({}) failed for alarm {} after {} attempts",
                routine,
                slot,
                alarm.id,
                attempts
            );
            self.bus.emit(EngineEvent {
                timestamp,
                alarm: snapshot.clone(),
                kind: EventKind::ScriptFailed {
                    slot,
                    routine: routine.clone(),
                    error: format!("failed after {} attempts: {}", attempts, last_error),
                },
            });

            // One recursive fallback run; the fallback slot itself never
            // falls back again.
            if slot != ScriptSlot::Fallback
                && resolve_script(alarm, defaults, ScriptSlot::Fallback).is_some()
            {
                log::info!("Running fallback routine for alarm {}", alarm.id);
                self.run_slot_inner(
                    alarm,
                    defaults,
                    ScriptSlot::Fallback,
                    context,
                    snapshot,
                    timestamp,
                )
                .await;
            }

            false
        })
    }
}
