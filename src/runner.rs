// File: ./src/runner.rs
//! The `ScriptRunner` capability: how automation routines actually run is
//! the host's business; the engine only needs a name, a payload, and an
//! outcome.

use anyhow::Result;
use futures::future::BoxFuture;
use serde::Serialize;

use crate::model::{DayOfWeek, TriggerKind};

/// Context payload passed verbatim to every invoked routine.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptContext {
    pub alarm_id: String,
    pub alarm_name: String,
    pub alarm_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_type: Option<TriggerKind>,
    pub snooze_count: u32,
    pub is_one_time: bool,
    pub days: Vec<DayOfWeek>,
}

/// Executes a named external routine with a context payload.
pub trait ScriptRunner: Send + Sync {
    fn run(&self, routine: &str, context: &ScriptContext) -> BoxFuture<'static, Result<()>>;

    /// Whether `routine` resolves to something runnable. Used by the health
    /// monitor; hosts that cannot answer should leave the default.
    fn resolves(&self, _routine: &str) -> bool {
        true
    }
}

/// Runner that only logs invocations. Used by the standalone daemon and as
/// a harmless default for hosts still wiring things up.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogRunner;

impl ScriptRunner for LogRunner {
    fn run(&self, routine: &str, context: &ScriptContext) -> BoxFuture<'static, Result<()>> {
        let routine = routine.to_string();
        let payload = serde_json::to_string(context).unwrap_or_default();
        Box::pin(async move {
            log::info!("Would run routine '{}' with {}", routine, payload);
            Ok(())
        })
    }
}
