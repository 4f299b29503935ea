// File: ./src/error.rs
//! Typed error surface of the command API.

use thiserror::Error;

use crate::model::AlarmState;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input; nothing changed.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Operation on an unknown alarm id.
    #[error("no such alarm: {0}")]
    NotFound(String),

    /// The operation is not valid from the alarm's current state; nothing
    /// changed.
    #[error("not allowed in state {state}: {reason}")]
    StateConflict { state: AlarmState, reason: String },

    /// A store write failed; the in-memory change was rolled back where
    /// feasible.
    #[error("persistence failure: {0:#}")]
    Persistence(#[source] anyhow::Error),

    /// The engine is shutting down and refuses new commands.
    #[error("engine is stopped")]
    Stopped,

    /// Anything unexpected. Logged with full context at the site.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn state_conflict(state: AlarmState, reason: impl Into<String>) -> Self {
        Self::StateConflict {
            state,
            reason: reason.into(),
        }
    }
}
