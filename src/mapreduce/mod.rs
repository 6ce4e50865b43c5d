//! Distributed map/combine/reduce over a partitioned cache
//!
//! A [`MapReduceTask`] maps every selected entry of a cache on the member
//! that owns it, optionally combines the emitted values per member, and
//! reduces them either on the invoking member or on the owners of the
//! intermediate keys.
//!
//! ```text
//!            ┌──────────────┐
//!            │ MapReduceTask│  (invoking member)
//!            └──────┬───────┘
//!     Setup         │ CreateStore ──> every member
//!     Map           │ MapCombine  ──> one part per input-key owner
//!                   │      NodeExecutor: map -> combine -> chunk -> merge into store
//!     Reduce        │ Reduce      ──> one part per intermediate-key owner
//!     Cleanup       │ RemoveStore ──> every member (always)
//!                   v
//!            Map<KOut, VOut> / results cache / collated value
//! ```
//!
//! With local reduction the Setup, Reduce and Cleanup rows collapse: map
//! parts return their collected values and the invoking member reduces.

pub mod cancellation;
pub mod collector;
pub mod command;
pub mod coordinator;
pub mod executor;
pub mod future;
pub mod intermediate;
pub mod lifecycle;
mod task_part;

use crate::cluster::{GridKey, GridValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

pub use cancellation::{CancellationService, CancellationToken};
pub use collector::Collector;
pub use command::{CancelCommand, MapCombineCommand, ReduceCommand, TaskCommand, TaskResponse};
pub use coordinator::{MapReduceTask, MapReduceTaskBuilder};
pub use executor::{MapCombineOutput, NodeExecutor};
pub use future::{TaskCanceller, TaskFuture};
pub use intermediate::{DeltaList, IntermediateKey, StoreRef, DEFAULT_INTERMEDIATE_STORE};
pub use lifecycle::{NoopLifecycle, TaskLifecycle};

/// Unique identifier of one map/reduce task
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User function turning one input entry into zero or more emitted pairs.
///
/// Mappers travel to remote members, so they must be serializable. Any
/// state they hold is copied, never shared, between invocations.
pub trait Mapper:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type KeyIn: GridKey;
    type ValueIn: GridValue;
    type KeyOut: GridKey;
    type ValueOut: GridValue;

    fn map(
        &self,
        key: &Self::KeyIn,
        value: &Self::ValueIn,
        collector: &mut Collector<Self::KeyOut, Self::ValueOut>,
    ) -> anyhow::Result<()>;
}

/// User function folding every value of one key into a single value.
///
/// The same type serves as the optional per-member combiner. A combiner is
/// only safe when the function is associative and commutative.
pub trait Reducer<K, V>:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn reduce(&self, key: &K, values: Vec<V>) -> anyhow::Result<V>;
}

/// Post-processing of the final result into a caller-chosen shape
pub trait Collator<K, V> {
    type Output;

    fn collate(&self, reduced: HashMap<K, V>) -> Self::Output;
}

impl<K, V, T, F> Collator<K, V> for F
where
    F: Fn(HashMap<K, V>) -> T,
{
    type Output = T;

    fn collate(&self, reduced: HashMap<K, V>) -> T {
        self(reduced)
    }
}

#[cfg(test)]
mod executor_test;
