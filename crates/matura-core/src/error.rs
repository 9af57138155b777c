//! Error taxonomy the scheduler branches on.

use thiserror::Error;

use crate::types::PairStatus;

/// Content generation failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerateError {
    /// Completion service error or timeout. Recoverable with a fallback phrase.
    #[error("generation failed: {0}")]
    Failed(String),

    #[error("script '{script_id}' exhausted")]
    ScriptExhausted { script_id: String },

    #[error("script '{script_id}' not found")]
    UnknownScript { script_id: String },

    #[error("identity '{member}' has no behaviour prompt")]
    MissingBehavior { member: String },
}

/// Errors reported by a messaging channel implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// Connection closed, rate limited, upstream hiccup. Safe to retry.
    #[error("transient channel error: {0}")]
    Transient(String),

    /// Invalid credentials or unknown instance. Retrying will not help.
    #[error("fatal channel error: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("identity not found: {0}")]
    NotFound(String),
}

/// Failures of the message dispatcher.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("identity '{name}' unresolvable: {reason}")]
    IdentityUnresolvable { name: String, reason: String },

    #[error("transient channel error: {0}")]
    Transient(String),

    #[error("fatal channel error: {0}")]
    Fatal(String),
}

impl DispatchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<ChannelError> for DispatchError {
    fn from(error: ChannelError) -> Self {
        match error {
            ChannelError::Transient(msg) => Self::Transient(msg),
            ChannelError::Fatal(msg) => Self::Fatal(msg),
        }
    }
}

/// Pair state store failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("pair not found: {0}")]
    NotFound(String),

    #[error("pair already exists: {0}")]
    AlreadyExists(String),

    #[error("turn counter conflict on pair {pair_id}: expected {expected}, found {actual}")]
    Conflict {
        pair_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("pair {pair_id} is {status}, refusing to advance")]
    NotRunning { pair_id: String, status: PairStatus },

    #[error("invalid status transition for pair {pair_id}: {from} -> {to}")]
    InvalidTransition {
        pair_id: String,
        from: PairStatus,
        to: PairStatus,
    },

    #[error("storage backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_errors_map_onto_dispatch_errors() {
        let transient: DispatchError = ChannelError::Transient("closed".to_owned()).into();
        assert!(transient.is_transient());

        let fatal: DispatchError = ChannelError::Fatal("401".to_owned()).into();
        assert!(!fatal.is_transient());
        assert_eq!(fatal.to_string(), "fatal channel error: 401");
    }

    #[test]
    fn conflict_message_names_both_counters() {
        let err = StoreError::Conflict {
            pair_id: "p1".to_owned(),
            expected: 4,
            actual: 5,
        };
        assert_eq!(
            err.to_string(),
            "turn counter conflict on pair p1: expected 4, found 5"
        );
    }
}
