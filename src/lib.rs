// Crate root library declaration and module exports.

pub mod cli;
pub mod clock;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod health;
pub mod model;
pub mod pipeline;
pub mod runner;
pub mod schedule;
pub mod state_machine;
pub mod store;

pub use coordinator::Coordinator;
pub use error::EngineError;
pub use model::{Alarm, AlarmState, DayOfWeek, ScriptSlot, TriggerKind};
