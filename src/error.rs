//! Error type shared by every fallible engine operation.

use thiserror::Error;

use crate::model::{MatchId, MatchStatus};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Rejected at intake; the offending value never reaches the pool.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The match was not in a state that allows `action`. Callers should
    /// refresh and retry.
    #[error("cannot {action} match {match_id} while it is {status}")]
    InvalidStateTransition {
        match_id: MatchId,
        status: MatchStatus,
        action: &'static str,
    },

    /// An optimistic commit lost a race against another assignment.
    #[error("concurrent assignment conflict: {0}")]
    ConcurrentAssignmentConflict(String),

    #[error("{service} unavailable: {reason}")]
    ExternalDependencyUnavailable {
        service: &'static str,
        reason: String,
    },
}

impl EngineError {
    pub fn invalid(message: impl Into<String>) -> Self {
        EngineError::InvalidInput(message.into())
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn unavailable(service: &'static str, reason: impl ToString) -> Self {
        EngineError::ExternalDependencyUnavailable {
            service,
            reason: reason.to_string(),
        }
    }

    /// Stable machine-readable kind, used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::NotFound { .. } => "not_found",
            EngineError::InvalidStateTransition { .. } => "invalid_state_transition",
            EngineError::ConcurrentAssignmentConflict(_) => "concurrent_assignment_conflict",
            EngineError::ExternalDependencyUnavailable { .. } => "external_dependency_unavailable",
        }
    }
}
