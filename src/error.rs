//! Error types for the shard wrangler.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for wrangler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the shard wrangler.
///
/// Errors are `Clone` so a reduced [`ErrorSet`](crate::concurrency::ErrorSet)
/// result can be handed out without consuming the set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A role, direction or replication-graph invariant does not hold.
    /// Raised before anything is mutated.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// A coordination lock could not be acquired in time.
    #[error("timed out after {timeout:?} waiting for lock on {scope}")]
    LockTimeout { scope: String, timeout: Duration },

    /// A lock was held or released by someone else.
    #[error("lock conflict on {scope}: {reason}")]
    LockConflict { scope: String, reason: String },

    /// A remote tablet action failed, either at invocation or during execution.
    #[error("action {action} on {target} failed: {reason}")]
    Action {
        target: String,
        action: String,
        reason: String,
    },

    /// A remote tablet action did not complete before its deadline.
    #[error("action {action} on {target} timed out after {timeout:?}")]
    ActionTimeout {
        target: String,
        action: String,
        timeout: Duration,
    },

    /// Writing a mutated shard record back to the store failed.
    #[error("failed to persist shard {keyspace}/{shard}: {reason}")]
    Persistence {
        keyspace: String,
        shard: String,
        reason: String,
    },

    /// Replica positions disagree with the demoted master.
    #[error("replication consistency violated: {0}")]
    Consistency(String),

    /// Several failures gathered during a parallel phase.
    #[error("{}", join_messages(.0))]
    Aggregate(Vec<Error>),

    /// A delegated validator rejected the shard or tablet.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Topology store failure outside of a shard write.
    #[error("topology store error: {0}")]
    Store(String),

    /// A shard, tablet or action handle does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Failed to encode or decode an action descriptor.
    #[error("serialization error: {0}")]
    Serialization(String),
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// True for both failed and timed-out remote actions.
    pub fn is_action_error(&self) -> bool {
        matches!(self, Error::Action { .. } | Error::ActionTimeout { .. })
    }

    /// True for lock and action timeouts, including inside an aggregate.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::LockTimeout { .. } | Error::ActionTimeout { .. } => true,
            Error::Aggregate(errors) => errors.iter().any(Error::is_timeout),
            _ => false,
        }
    }

    /// True for precondition failures.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Error::Precondition(_))
    }

    /// Flatten into the list of underlying errors.
    pub fn into_errors(self) -> Vec<Error> {
        match self {
            Error::Aggregate(errors) => errors.into_iter().flat_map(Error::into_errors).collect(),
            other => vec![other],
        }
    }

    /// Append an operator remediation hint to the message, keeping the variant.
    ///
    /// Structured variants get the hint folded into their free-text field;
    /// a timed-out action becomes a failed action carrying the hint. Lock
    /// timeouts have no free text and are returned unchanged.
    pub fn with_hint(self, hint: impl AsRef<str>) -> Self {
        let hint = hint.as_ref();
        match self {
            Error::Precondition(m) => Error::Precondition(format!("{m}, {hint}")),
            Error::Consistency(m) => Error::Consistency(format!("{m}, {hint}")),
            Error::Validation(m) => Error::Validation(format!("{m}, {hint}")),
            Error::Store(m) => Error::Store(format!("{m}, {hint}")),
            Error::NotFound(m) => Error::NotFound(format!("{m}, {hint}")),
            Error::Serialization(m) => Error::Serialization(format!("{m}, {hint}")),
            Error::Action {
                target,
                action,
                reason,
            } => Error::Action {
                target,
                action,
                reason: format!("{reason}, {hint}"),
            },
            Error::Persistence {
                keyspace,
                shard,
                reason,
            } => Error::Persistence {
                keyspace,
                shard,
                reason: format!("{reason}, {hint}"),
            },
            Error::LockConflict { scope, reason } => Error::LockConflict {
                scope,
                reason: format!("{reason}, {hint}"),
            },
            Error::ActionTimeout {
                target,
                action,
                timeout,
            } => Error::Action {
                target,
                action,
                reason: format!("timed out after {timeout:?}, {hint}"),
            },
            Error::Aggregate(mut errors) => {
                if let Some(last) = errors.pop() {
                    errors.push(last.with_hint(hint));
                }
                Error::Aggregate(errors)
            }
            lock @ Error::LockTimeout { .. } => lock,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
