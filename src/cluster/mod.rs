//! Collaborator contracts consumed by the map/reduce engine
//!
//! The engine never stores data, hashes keys or moves bytes between members
//! itself. It is handed implementations of the traits in this module by the
//! surrounding data grid (or by [`crate::testing`] for an in-process grid).

pub mod marshaller;

use crate::error::MapReduceResult;
use crate::mapreduce::intermediate::{DeltaList, IntermediateKey};
use crate::mapreduce::{Mapper, Reducer, TaskCommand, TaskId, TaskResponse};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

pub use marshaller::{JsonMarshaller, Marshaller};

/// Address of a cluster member
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bounds every key stored in or emitted into the grid must satisfy
pub trait GridKey:
    Clone + Eq + Hash + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> GridKey for T where
    T: Clone + Eq + Hash + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Bounds every value stored in or emitted into the grid must satisfy
pub trait GridValue:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> GridValue for T where
    T: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// A member's view of a named cache
pub trait GridCache<K, V>: Send + Sync {
    fn name(&self) -> &str;

    fn get(&self, key: &K) -> Option<V>;

    fn put(&self, key: K, value: V);

    /// Keys resident in this member's memory, primary and backup copies alike
    fn local_keys(&self) -> Vec<K>;
}

/// Cache region holding chunked intermediate values.
///
/// Writes never overwrite: [`IntermediateStore::merge`] folds the incoming
/// chunk into whatever is already stored with [`DeltaList::merge`].
pub trait IntermediateStore<K, V>: Send + Sync {
    fn name(&self) -> &str;

    fn merge(&self, key: IntermediateKey<K>, chunk: DeltaList<V>) -> MapReduceResult<()>;

    fn get(&self, key: &IntermediateKey<K>) -> Option<DeltaList<V>>;

    /// Remove every composite key scoped to `task_id`, returning how many went
    fn purge_task(&self, task_id: &TaskId) -> usize;

    fn clear(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-member cache lifecycle operations the engine needs
pub trait CacheManager<K, V>: Send + Sync {
    fn create_intermediate_store(&self, name: &str) -> MapReduceResult<()>;

    fn intermediate_store(&self, name: &str) -> Option<Arc<dyn IntermediateStore<K, V>>>;

    fn remove_intermediate_store(&self, name: &str) -> MapReduceResult<()>;

    fn results_cache(&self, name: &str) -> MapReduceResult<Arc<dyn GridCache<K, V>>>;
}

/// Key ownership lookup.
///
/// `key` is the marshalled form of a raw input key, a raw output key or a
/// task-qualified [`IntermediateKey`].
pub trait DistributionManager: Send + Sync {
    fn primary_location(&self, cache: &str, key: &[u8]) -> Option<Address>;
}

/// Entries of a cache that are not resident in memory
pub trait PersistentStore<K, V>: Send + Sync {
    /// Visit every entry the filter accepts. A filter error stops the scan.
    fn scan_with_filter(
        &self,
        filter: &dyn Fn(&K) -> MapReduceResult<bool>,
        on_entry: &mut dyn FnMut(K, V) -> MapReduceResult<()>,
    ) -> MapReduceResult<()>;
}

/// Cluster transport for task commands
#[async_trait]
pub trait RpcManager<M, R>: Send + Sync
where
    M: Mapper,
    R: Reducer<M::KeyOut, M::ValueOut>,
{
    /// Address of the member this manager sends from
    fn address(&self) -> &Address;

    /// Current cluster view, including the local member
    fn members(&self) -> Vec<Address>;

    /// Invoke `command` on every target and wait for all responses.
    ///
    /// `timeout` bounds each target independently; `None` waits forever.
    async fn invoke_remotely(
        &self,
        targets: &[Address],
        command: TaskCommand<M, R>,
        timeout: Option<Duration>,
    ) -> MapReduceResult<HashMap<Address, TaskResponse<M::KeyOut, M::ValueOut>>>;
}
