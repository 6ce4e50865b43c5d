//! Structured error types for map/reduce task execution
//!
//! Every failure carries the task it belongs to and, where it makes sense,
//! the member and phase that produced it. Callers that only care about the
//! broad category use [`MapReduceError::kind`].

use crate::cluster::Address;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Phase of a map/reduce execution, used to label failures and log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Intermediate store creation across the cluster
    Setup,
    /// Map and per-member combine
    Map,
    /// Global reduction, distributed or on the invoking member
    Reduce,
    /// Intermediate store teardown or purge
    Cleanup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Setup => write!(f, "Setup"),
            Phase::Map => write!(f, "Map"),
            Phase::Reduce => write!(f, "Reduce"),
            Phase::Cleanup => write!(f, "Cleanup"),
        }
    }
}

/// Broad classification of a [`MapReduceError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The task or the engine was configured incorrectly
    Configuration,
    /// A user function or a remote invocation failed
    Execution,
    /// Cooperative cancellation was observed
    Interrupted,
}

/// Main error type for map/reduce operations
#[derive(Debug, Error)]
pub enum MapReduceError {
    // Configuration errors
    #[error("Invalid map/reduce configuration: {reason}")]
    InvalidConfiguration { reason: String },

    #[error("Invalid setting {field}={value}: {reason}")]
    InvalidSetting {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load settings from {path}: {reason}")]
    SettingsLoadFailed {
        path: PathBuf,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Task {task_id} is in an invalid state on {member}: {reason}")]
    InvalidState {
        task_id: String,
        member: Address,
        reason: String,
    },

    // Execution errors
    #[error("{function} of task {task_id} failed on {member}: {source}")]
    UserFunctionFailed {
        task_id: String,
        member: Address,
        function: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("{phase} phase of task {task_id} failed on {member}: {reason}")]
    PartFailed {
        task_id: String,
        phase: Phase,
        member: Address,
        reason: String,
        #[source]
        source: Option<Box<MapReduceError>>,
    },

    #[error("Could not create intermediate store {store} on {member}: {reason}")]
    StoreInitializationFailed {
        store: String,
        member: Address,
        reason: String,
    },

    #[error("Intermediate store {store} not found on {member}")]
    StoreNotFound { store: String, member: Address },

    #[error("Invocation on {member} timed out after {timeout:?}")]
    Timeout { member: Address, timeout: Duration },

    #[error("Task {task_id} failed remotely: {message}")]
    RemoteFailure { task_id: String, message: String },

    #[error("Could not reach {member}: {reason}")]
    Transport { member: Address, reason: String },

    #[error("No primary owner for key in cache {cache}")]
    NoOwner { cache: String },

    #[error("Could not marshal {what}")]
    Marshalling {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unexpected response from {member}: expected {expected}, got {actual}")]
    UnexpectedResponse {
        member: Address,
        expected: &'static str,
        actual: String,
    },

    #[error("Execution of task {task_id} was aborted: {reason}")]
    ExecutionAborted { task_id: String, reason: String },

    // Cancellation
    #[error("Task {task_id} was interrupted")]
    Interrupted { task_id: String },
}

impl MapReduceError {
    /// Category this error falls into
    pub fn kind(&self) -> ErrorKind {
        match self {
            MapReduceError::InvalidConfiguration { .. }
            | MapReduceError::InvalidSetting { .. }
            | MapReduceError::SettingsLoadFailed { .. }
            | MapReduceError::InvalidState { .. } => ErrorKind::Configuration,
            MapReduceError::Interrupted { .. } => ErrorKind::Interrupted,
            _ => ErrorKind::Execution,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.kind() == ErrorKind::Interrupted
    }

    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        MapReduceError::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    pub(crate) fn interrupted(task_id: impl ToString) -> Self {
        MapReduceError::Interrupted {
            task_id: task_id.to_string(),
        }
    }

    /// Wrap a failure reported by one task part.
    ///
    /// Interruptions are passed through untouched so callers can still
    /// recognise cooperative cancellation.
    pub(crate) fn part_failed(
        task_id: impl ToString,
        phase: Phase,
        member: Address,
        cause: MapReduceError,
    ) -> Self {
        if cause.is_interrupted() {
            return cause;
        }
        MapReduceError::PartFailed {
            task_id: task_id.to_string(),
            phase,
            member,
            reason: cause.to_string(),
            source: Some(Box::new(cause)),
        }
    }
}

pub type MapReduceResult<T> = Result<T, MapReduceError>;
