//! Addressing and chunking of intermediate state
//!
//! Emitted values travel from the mapping member to the reducing member
//! through an intermediate store. A task either owns a private store, named
//! after its [`TaskId`], or shares [`DEFAULT_INTERMEDIATE_STORE`] with other
//! running tasks, in which case every key is qualified with the task id.

use super::TaskId;
use serde::{Deserialize, Serialize};

/// Name of the intermediate store shared by concurrently running tasks
pub const DEFAULT_INTERMEDIATE_STORE: &str = "__tmpMapReduce";

/// Key under which intermediate values are stored
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntermediateKey<K> {
    /// Raw output key, used in a task-private store
    Plain(K),
    /// Output key qualified with its task, used in the shared store
    Composite { task_id: TaskId, key: K },
}

impl<K> IntermediateKey<K> {
    pub fn key(&self) -> &K {
        match self {
            IntermediateKey::Plain(key) => key,
            IntermediateKey::Composite { key, .. } => key,
        }
    }

    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            IntermediateKey::Plain(_) => None,
            IntermediateKey::Composite { task_id, .. } => Some(task_id),
        }
    }

    /// Whether this key was written by `task_id` into the shared store
    pub fn belongs_to(&self, task_id: &TaskId) -> bool {
        self.task_id() == Some(task_id)
    }
}

/// Reference to the intermediate store a task writes to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRef {
    name: String,
    shared: bool,
}

impl StoreRef {
    /// The store shared across tasks, under `name`
    pub fn shared(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: true,
        }
    }

    /// A store private to `task_id`
    pub fn per_task(task_id: &TaskId) -> Self {
        Self {
            name: task_id.to_string(),
            shared: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Address `key` in this store: composite when shared, plain otherwise
    pub fn key_for<K>(&self, task_id: &TaskId, key: K) -> IntermediateKey<K> {
        if self.shared {
            IntermediateKey::Composite {
                task_id: task_id.clone(),
                key,
            }
        } else {
            IntermediateKey::Plain(key)
        }
    }
}

/// Mergeable accumulator of intermediate values for one key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaList<V>(Vec<V>);

impl<V> DeltaList<V> {
    pub fn new(values: Vec<V>) -> Self {
        Self(values)
    }

    /// Fold `incoming` into `self`: stored values first, then the new ones
    pub fn merge(mut self, incoming: DeltaList<V>) -> DeltaList<V> {
        self.0.extend(incoming.0);
        self
    }

    pub fn values(&self) -> &[V] {
        &self.0
    }

    pub fn into_values(self) -> Vec<V> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Split `values` into accumulators of at most `max_chunk` values each.
///
/// Order is preserved across chunks, so merging them back in sequence
/// yields the original list.
pub fn chunk_values<V>(values: Vec<V>, max_chunk: usize) -> Vec<DeltaList<V>> {
    let max_chunk = max_chunk.max(1);
    let mut chunks = Vec::with_capacity(values.len().div_ceil(max_chunk));
    let mut current = Vec::with_capacity(max_chunk.min(values.len()));
    for value in values {
        current.push(value);
        if current.len() == max_chunk {
            chunks.push(DeltaList::new(std::mem::take(&mut current)));
        }
    }
    if !current.is_empty() {
        chunks.push(DeltaList::new(current));
    }
    chunks
}
