//! Typed error hierarchy for the Conductor orchestrator.
//!
//! `ConductorError` is the taxonomy the queue and processors dispatch on;
//! HTTP response mapping lives in `server.rs`.

use thiserror::Error;

/// Errors from the orchestration core.
#[derive(Debug, Error)]
pub enum ConductorError {
    /// Attempted state transition is not an edge of the state table.
    /// Programmer error; jobs failing with this are not retried.
    #[error("Invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Task {id} not found")]
    TaskNotFound { id: String },

    #[error("Subtask {id} not found")]
    SubtaskNotFound { id: String },

    /// Source-forge / network / storage timeout or 5xx. Retried by the
    /// queue with exponential backoff.
    #[error("Transient external failure: {0}")]
    Transient(String),

    /// Agent process exceeded its wall clock and was killed.
    #[error("Agent run timed out after {seconds}s")]
    AgentTimeout { seconds: u64 },

    /// Board item lacks a resolvable repository; logged, no task created.
    #[error("Board item {item_id} has no resolvable repository")]
    MissingLink { item_id: String },

    /// Webhook delivery failed signature verification; rejected, no state change.
    #[error("Webhook signature verification failed")]
    InvalidSignature,

    #[error("Failed to spawn agent process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConductorError {
    /// Whether the queue's retry policy should apply.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::AgentTimeout { .. } | Self::SpawnFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_carries_edge() {
        let err = ConductorError::InvalidTransition {
            entity: "task",
            from: "done".into(),
            to: "pending".into(),
        };
        assert!(err.to_string().contains("done -> pending"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn transient_is_retryable() {
        assert!(ConductorError::Transient("github 502".into()).is_retryable());
        assert!(ConductorError::AgentTimeout { seconds: 1800 }.is_retryable());
    }

    #[test]
    fn invalid_signature_is_not_retryable() {
        assert!(!ConductorError::InvalidSignature.is_retryable());
    }

    #[test]
    fn all_variants_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ConductorError::InvalidSignature);
        assert_std_error(&ConductorError::MissingLink {
            item_id: "PVTI_x".into(),
        });
    }
}
