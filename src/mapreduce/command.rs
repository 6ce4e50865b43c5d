//! Commands exchanged between the coordinating member and node executors
//!
//! Everything here crosses the wire, so every payload is serde-serializable
//! and keyed maps travel as pair lists.

use super::intermediate::StoreRef;
use super::{Mapper, Reducer, TaskId};
use crate::error::{MapReduceError, MapReduceResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use uuid::Uuid;

/// Run a mapper (and optional combiner) over one member's input entries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct MapCombineCommand<M: Mapper, R: Reducer<M::KeyOut, M::ValueOut>> {
    pub task_id: TaskId,
    pub part_id: Uuid,
    pub cache_name: String,
    pub mapper: M,
    pub combiner: Option<R>,
    /// Explicit input keys; `None` selects every locally owned entry
    pub keys: Option<Vec<M::KeyIn>>,
    /// Where emitted values migrate; unused when `emit_full_values` is set
    pub intermediate_store: Option<StoreRef>,
    /// Return collected values instead of migrating them
    pub emit_full_values: bool,
    pub max_collector_size: usize,
}

/// Reduce the keys a member owns in the intermediate store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "K: Serialize + serde::de::DeserializeOwned, R: Serialize + serde::de::DeserializeOwned")]
pub struct ReduceCommand<K, R> {
    pub task_id: TaskId,
    pub part_id: Uuid,
    pub destination: StoreRef,
    pub reducer: R,
    pub keys: Vec<K>,
    pub results_cache: Option<String>,
}

/// Cancel a running task part on its target member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelCommand {
    pub task_id: TaskId,
    pub part_id: Uuid,
}

/// Every command a node executor accepts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum TaskCommand<M: Mapper, R: Reducer<M::KeyOut, M::ValueOut>> {
    CreateStore(StoreRef),
    RemoveStore { store: StoreRef, task_id: TaskId },
    MapCombine(MapCombineCommand<M, R>),
    Reduce(ReduceCommand<M::KeyOut, R>),
    Cancel(CancelCommand),
    /// The execution is over; forget its recorded cancellations
    ReleaseTask(TaskId),
}

impl<M: Mapper, R: Reducer<M::KeyOut, M::ValueOut>> TaskCommand<M, R> {
    /// Short label used in log lines
    pub fn describe(&self) -> &'static str {
        match self {
            TaskCommand::CreateStore(_) => "create-store",
            TaskCommand::RemoveStore { .. } => "remove-store",
            TaskCommand::MapCombine(_) => "map-combine",
            TaskCommand::Reduce(_) => "reduce",
            TaskCommand::Cancel(_) => "cancel",
            TaskCommand::ReleaseTask(_) => "release-task",
        }
    }
}

/// Response to a [`TaskCommand`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "K: Serialize + serde::de::DeserializeOwned + Eq + Hash, V: Serialize + serde::de::DeserializeOwned")]
pub enum TaskResponse<K, V> {
    /// Store management and cancellation succeeded
    Ack,
    /// Output keys migrated into the intermediate store
    MappedKeys(HashSet<K>),
    /// Per-key value sequences kept on the mapping member
    Collected(Vec<(K, Vec<V>)>),
    /// Reduced values
    Reduced(Vec<(K, V)>),
    /// The command failed on the target
    Failure { message: String, interrupted: bool },
}

impl<K, V> TaskResponse<K, V> {
    pub fn collected(values: HashMap<K, Vec<V>>) -> Self {
        TaskResponse::Collected(values.into_iter().collect())
    }

    pub fn reduced(values: HashMap<K, V>) -> Self {
        TaskResponse::Reduced(values.into_iter().collect())
    }

    /// Convert an executor outcome into something that can cross the wire
    pub fn from_result(result: MapReduceResult<Self>) -> Self {
        match result {
            Ok(response) => response,
            Err(err) => TaskResponse::Failure {
                interrupted: err.is_interrupted(),
                message: err.to_string(),
            },
        }
    }

    /// Turn a `Failure` back into an error raised for `task_id`
    pub fn into_result(self, task_id: &TaskId) -> MapReduceResult<Self> {
        match self {
            TaskResponse::Failure {
                interrupted: true, ..
            } => Err(MapReduceError::interrupted(task_id)),
            TaskResponse::Failure { message, .. } => Err(MapReduceError::RemoteFailure {
                task_id: task_id.to_string(),
                message,
            }),
            other => Ok(other),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TaskResponse::Failure { .. })
    }
}

impl<K, V> fmt::Display for TaskResponse<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskResponse::Ack => write!(f, "ack"),
            TaskResponse::MappedKeys(keys) => write!(f, "{} mapped keys", keys.len()),
            TaskResponse::Collected(values) => write!(f, "{} collected keys", values.len()),
            TaskResponse::Reduced(values) => write!(f, "{} reduced keys", values.len()),
            TaskResponse::Failure { message, .. } => write!(f, "failure: {}", message),
        }
    }
}
