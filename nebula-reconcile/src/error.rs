//! Error types for reconciliation.

use std::time::Duration;

use thiserror::Error;

use crate::document::ObservedObject;

/// Errors that can occur while reconciling remote objects.
#[derive(Debug, Error)]
pub enum Error {
    /// The remote service could not be reached or spoke garbage at the protocol level.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote service answered but reported failure.
    #[error("{method} rejected: {message}")]
    RemoteRejected { method: String, message: String },

    /// Caller-supplied input is malformed. Raised before any remote call.
    #[error("validation error: {0}")]
    Validation(String),

    /// No remote object matches the reference.
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// The awaited lifecycle state was never observed within the budget.
    #[error(
        "timed out after {elapsed:?} waiting for object {id} to become {target} (last state: {})",
        describe_last(.last)
    )]
    ConvergenceTimeout {
        id: i64,
        target: &'static str,
        elapsed: Duration,
        last: Option<Box<ObservedObject>>,
    },

    /// Several objects in the caller's scope share the requested name.
    #[error("{} {kind} objects named {name:?} (ids {ids:?})", .ids.len())]
    AmbiguousMatch {
        kind: &'static str,
        name: String,
        ids: Vec<i64>,
    },

    /// A payload from the remote service could not be decoded.
    #[error("malformed response: {0}")]
    Decode(String),

    /// A freshly created object never became usable.
    #[error("{kind} {id} did not become ready: {source}")]
    NotReady {
        kind: &'static str,
        id: i64,
        #[source]
        source: Box<Error>,
    },

    /// A wait was cancelled by the host.
    #[error("wait cancelled")]
    Cancelled,
}

fn describe_last(last: &Option<Box<ObservedObject>>) -> String {
    match last.as_deref() {
        Some(obj) => match obj.state {
            Some(state) => format!("{} ({}) in state {}", obj.name, obj.id, state),
            None => format!("{} ({}) without state", obj.name, obj.id),
        },
        None => "never observed".to_string(),
    }
}

impl Error {
    /// Whether the error came from the remote call path rather than local input.
    pub fn is_remote(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::RemoteRejected { .. })
    }
}

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, Error>;
