//! In-process data grid
//!
//! Every member is a [`NodeExecutor`] living in this process. Commands sent
//! through [`LoopbackRpc`] are marshalled to JSON and back, so anything that
//! would not survive a real wire fails here too.

use crate::cluster::marshaller::key_bytes;
use crate::cluster::{
    Address, CacheManager, DistributionManager, GridCache, IntermediateStore, JsonMarshaller,
    PersistentStore, RpcManager,
};
use crate::config::EngineSettings;
use crate::error::{MapReduceError, MapReduceResult};
use crate::mapreduce::{
    CancellationService, DeltaList, IntermediateKey, MapReduceTask, MapReduceTaskBuilder, Mapper,
    NodeExecutor, NoopLifecycle, Reducer, TaskCommand, TaskId, TaskLifecycle, TaskResponse,
};
use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, trace};

/// Rendezvous hashing over SHA-256 digests.
///
/// Each key ranks every member by `sha256(cache, key, member)`; the highest
/// ranked member is the primary owner and the next ones hold backups.
#[derive(Debug, Clone)]
pub struct ConsistentHash {
    members: Vec<Address>,
    num_owners: usize,
}

impl ConsistentHash {
    pub fn new(members: Vec<Address>, num_owners: usize) -> Self {
        let num_owners = num_owners.clamp(1, members.len().max(1));
        Self {
            members,
            num_owners,
        }
    }

    fn score(cache: &str, key: &[u8], member: &Address) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(cache.as_bytes());
        hasher.update([0u8]);
        hasher.update(key);
        hasher.update([0u8]);
        hasher.update(member.as_str().as_bytes());
        hasher.finalize().into()
    }

    /// Primary owner first, then backups
    pub fn owners(&self, cache: &str, key: &[u8]) -> Vec<Address> {
        let mut ranked: Vec<([u8; 32], &Address)> = self
            .members
            .iter()
            .map(|member| (Self::score(cache, key, member), member))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0));
        ranked
            .into_iter()
            .take(self.num_owners)
            .map(|(_, member)| member.clone())
            .collect()
    }

    pub fn num_owners(&self) -> usize {
        self.num_owners
    }
}

impl DistributionManager for ConsistentHash {
    fn primary_location(&self, cache: &str, key: &[u8]) -> Option<Address> {
        self.owners(cache, key).into_iter().next()
    }
}

/// One member's in-memory copy of a cache
#[derive(Debug)]
pub struct MemoryCache<K, V> {
    name: String,
    entries: RwLock<HashMap<K, V>>,
}

impl<K, V> MemoryCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> HashMap<K, V> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<K, V> GridCache<K, V> for MemoryCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &K) -> Option<V> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn put(&self, key: K, value: V) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value);
    }

    fn local_keys(&self) -> Vec<K> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

/// Intermediate store merging chunks on write
#[derive(Debug)]
pub struct MemoryIntermediateStore<K, V> {
    name: String,
    entries: Mutex<HashMap<IntermediateKey<K>, DeltaList<V>>>,
}

impl<K, V> MemoryIntermediateStore<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of entries written by `task_id`
    pub fn entries_of(&self, task_id: &TaskId) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|key| key.belongs_to(task_id))
            .count()
    }
}

impl<K, V> IntermediateStore<K, V> for MemoryIntermediateStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn merge(&self, key: IntermediateKey<K>, chunk: DeltaList<V>) -> MapReduceResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let merged = match entries.remove(&key) {
            Some(existing) => existing.merge(chunk),
            None => chunk,
        };
        entries.insert(key, merged);
        Ok(())
    }

    fn get(&self, key: &IntermediateKey<K>) -> Option<DeltaList<V>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn purge_task(&self, task_id: &TaskId) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|key, _| !key.belongs_to(task_id));
        before - entries.len()
    }

    fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Cluster-wide registry of intermediate stores and results caches.
///
/// An intermediate store lives as long as at least one member holds it.
#[derive(Debug)]
pub struct StoreRegistry<K, V> {
    stores: Mutex<HashMap<String, (Arc<MemoryIntermediateStore<K, V>>, HashSet<Address>)>>,
    results: Mutex<HashMap<String, Arc<MemoryCache<K, V>>>>,
}

impl<K, V> Default for StoreRegistry<K, V> {
    fn default() -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> StoreRegistry<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    fn join(&self, name: &str, member: &Address) {
        let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        let (_, holders) = stores
            .entry(name.to_string())
            .or_insert_with(|| (Arc::new(MemoryIntermediateStore::new(name)), HashSet::new()));
        holders.insert(member.clone());
    }

    fn leave(&self, name: &str, member: &Address) {
        let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        let now_empty = match stores.get_mut(name) {
            Some((_, holders)) => {
                holders.remove(member);
                holders.is_empty()
            }
            None => false,
        };
        if now_empty {
            stores.remove(name);
            debug!("Intermediate store {} destroyed", name);
        }
    }

    fn held_by(
        &self,
        name: &str,
        member: &Address,
    ) -> Option<Arc<MemoryIntermediateStore<K, V>>> {
        let stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        stores
            .get(name)
            .filter(|(_, holders)| holders.contains(member))
            .map(|(store, _)| Arc::clone(store))
    }

    /// Names of every intermediate store still alive
    pub fn store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .stores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn store(&self, name: &str) -> Option<Arc<MemoryIntermediateStore<K, V>>> {
        self.stores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|(store, _)| Arc::clone(store))
    }

    pub fn results_cache(&self, name: &str) -> Arc<MemoryCache<K, V>> {
        let mut results = self.results.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            results
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(MemoryCache::new(name))),
        )
    }
}

/// One member's cache manager over the shared [`StoreRegistry`]
#[derive(Debug)]
pub struct MemoryCacheManager<K, V> {
    member: Address,
    registry: Arc<StoreRegistry<K, V>>,
    fail_creation: AtomicBool,
}

impl<K, V> MemoryCacheManager<K, V> {
    pub fn new(member: Address, registry: Arc<StoreRegistry<K, V>>) -> Self {
        Self {
            member,
            registry,
            fail_creation: AtomicBool::new(false),
        }
    }

    /// Make every following store creation on this member fail
    pub fn fail_store_creation(&self, fail: bool) {
        self.fail_creation.store(fail, Ordering::SeqCst);
    }
}

impl<K, V> CacheManager<K, V> for MemoryCacheManager<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn create_intermediate_store(&self, name: &str) -> MapReduceResult<()> {
        if self.fail_creation.load(Ordering::SeqCst) {
            return Err(MapReduceError::StoreInitializationFailed {
                store: name.to_string(),
                member: self.member.clone(),
                reason: "store creation disabled on this member".to_string(),
            });
        }
        self.registry.join(name, &self.member);
        Ok(())
    }

    fn intermediate_store(&self, name: &str) -> Option<Arc<dyn IntermediateStore<K, V>>> {
        self.registry
            .held_by(name, &self.member)
            .map(|store| store as Arc<dyn IntermediateStore<K, V>>)
    }

    fn remove_intermediate_store(&self, name: &str) -> MapReduceResult<()> {
        self.registry.leave(name, &self.member);
        Ok(())
    }

    fn results_cache(&self, name: &str) -> MapReduceResult<Arc<dyn GridCache<K, V>>> {
        Ok(self.registry.results_cache(name) as Arc<dyn GridCache<K, V>>)
    }
}

/// Entries kept outside of memory, shared by every member
#[derive(Debug)]
pub struct MemoryPersistentStore<K, V> {
    entries: Mutex<Vec<(K, V)>>,
}

impl<K, V> Default for MemoryPersistentStore<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<K: Clone, V: Clone> MemoryPersistentStore<K, V> {
    pub fn insert(&self, key: K, value: V) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((key, value));
    }
}

impl<K, V> PersistentStore<K, V> for MemoryPersistentStore<K, V>
where
    K: Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn scan_with_filter(
        &self,
        filter: &dyn Fn(&K) -> MapReduceResult<bool>,
        on_entry: &mut dyn FnMut(K, V) -> MapReduceResult<()>,
    ) -> MapReduceResult<()> {
        let snapshot = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for (key, value) in snapshot {
            if filter(&key)? {
                on_entry(key, value)?;
            }
        }
        Ok(())
    }
}

/// Members reachable through [`LoopbackRpc`], with fault injection
pub struct Network<M: Mapper> {
    nodes: BTreeMap<Address, Arc<NodeExecutor<M>>>,
    unreachable: Mutex<HashSet<Address>>,
    delays: Mutex<HashMap<Address, Duration>>,
}

impl<M: Mapper> Network<M> {
    fn new(nodes: BTreeMap<Address, Arc<NodeExecutor<M>>>) -> Self {
        Self {
            nodes,
            unreachable: Mutex::new(HashSet::new()),
            delays: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_unreachable(&self, member: &Address, unreachable: bool) {
        let mut members = self.unreachable.lock().unwrap_or_else(PoisonError::into_inner);
        if unreachable {
            members.insert(member.clone());
        } else {
            members.remove(member);
        }
    }

    /// Hold every command for `member` back by `delay` before delivering it
    pub fn set_delay(&self, member: &Address, delay: Duration) {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(member.clone(), delay);
    }

    fn route(
        &self,
        member: &Address,
    ) -> MapReduceResult<(Arc<NodeExecutor<M>>, Option<Duration>)> {
        if self
            .unreachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(member)
        {
            return Err(MapReduceError::Transport {
                member: member.clone(),
                reason: "member unreachable".to_string(),
            });
        }
        let node = self
            .nodes
            .get(member)
            .cloned()
            .ok_or_else(|| MapReduceError::Transport {
                member: member.clone(),
                reason: "not a cluster member".to_string(),
            })?;
        let delay = self
            .delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(member)
            .copied();
        Ok((node, delay))
    }
}

fn through_json<T, U>(what: &str, value: &T) -> MapReduceResult<U>
where
    T: Serialize,
    U: serde::de::DeserializeOwned,
{
    let marshalling = |source| MapReduceError::Marshalling {
        what: what.to_string(),
        source,
    };
    let bytes = serde_json::to_vec(value).map_err(marshalling)?;
    serde_json::from_slice(&bytes).map_err(marshalling)
}

/// Transport delivering commands to in-process members
pub struct LoopbackRpc<M: Mapper, R> {
    address: Address,
    network: Arc<Network<M>>,
    _reducer: PhantomData<fn() -> R>,
}

impl<M: Mapper, R> LoopbackRpc<M, R> {
    pub fn new(address: Address, network: Arc<Network<M>>) -> Self {
        Self {
            address,
            network,
            _reducer: PhantomData,
        }
    }
}

impl<M, R> LoopbackRpc<M, R>
where
    M: Mapper,
    R: Reducer<M::KeyOut, M::ValueOut>,
{
    async fn invoke_one(
        &self,
        target: Address,
        command: TaskCommand<M, R>,
        timeout: Option<Duration>,
    ) -> MapReduceResult<TaskResponse<M::KeyOut, M::ValueOut>> {
        let (node, delay) = self.network.route(&target)?;
        let member = target.clone();
        let delivery = async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let command: TaskCommand<M, R> = through_json("command", &command)?;
            trace!("Delivering {} to {}", command.describe(), member);
            let response = tokio::task::spawn_blocking(move || {
                TaskResponse::from_result(node.perform(command))
            })
            .await
            .map_err(|e| MapReduceError::Transport {
                member: member.clone(),
                reason: e.to_string(),
            })?;
            through_json::<_, TaskResponse<M::KeyOut, M::ValueOut>>("response", &response)
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, delivery)
                .await
                .map_err(|_| MapReduceError::Timeout {
                    member: target,
                    timeout,
                })?,
            None => delivery.await,
        }
    }
}

#[async_trait]
impl<M, R> RpcManager<M, R> for LoopbackRpc<M, R>
where
    M: Mapper,
    R: Reducer<M::KeyOut, M::ValueOut>,
{
    fn address(&self) -> &Address {
        &self.address
    }

    fn members(&self) -> Vec<Address> {
        self.network.nodes.keys().cloned().collect()
    }

    async fn invoke_remotely(
        &self,
        targets: &[Address],
        command: TaskCommand<M, R>,
        timeout: Option<Duration>,
    ) -> MapReduceResult<HashMap<Address, TaskResponse<M::KeyOut, M::ValueOut>>> {
        let invocations = targets.iter().map(|target| {
            let command = command.clone();
            async move {
                let response = self.invoke_one(target.clone(), command, timeout).await?;
                Ok::<_, MapReduceError>((target.clone(), response))
            }
        });
        futures::future::join_all(invocations)
            .await
            .into_iter()
            .collect()
    }
}

/// Builds a [`LocalGrid`]
#[derive(Clone)]
pub struct LocalGridBuilder {
    members: usize,
    num_owners: usize,
    cache_name: String,
    settings: EngineSettings,
    lifecycle: Option<Arc<dyn TaskLifecycle>>,
}

impl Default for LocalGridBuilder {
    fn default() -> Self {
        Self {
            members: 1,
            num_owners: 1,
            cache_name: "grid".to_string(),
            settings: EngineSettings::default(),
            lifecycle: None,
        }
    }
}

impl LocalGridBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of members, at least one
    pub fn members(mut self, members: usize) -> Self {
        self.members = members.max(1);
        self
    }

    /// Copies kept of every entry, primary included
    pub fn num_owners(mut self, num_owners: usize) -> Self {
        self.num_owners = num_owners;
        self
    }

    pub fn cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = name.into();
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn lifecycle(mut self, lifecycle: Arc<dyn TaskLifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn build<M: Mapper>(self) -> LocalGrid<M> {
        let members: Vec<Address> = (0..self.members)
            .map(|i| Address::new(format!("node-{}", i)))
            .collect();
        let distribution = Arc::new(ConsistentHash::new(members.clone(), self.num_owners));
        let registry = Arc::new(StoreRegistry::default());
        let persistent = Arc::new(MemoryPersistentStore::default());
        let lifecycle = self
            .lifecycle
            .unwrap_or_else(|| Arc::new(NoopLifecycle) as Arc<dyn TaskLifecycle>);

        let mut caches = BTreeMap::new();
        let mut managers = BTreeMap::new();
        let mut nodes = BTreeMap::new();
        for member in &members {
            let cache = Arc::new(MemoryCache::new(self.cache_name.clone()));
            let manager = Arc::new(MemoryCacheManager::new(member.clone(), Arc::clone(&registry)));
            let node = NodeExecutor::new(
                member.clone(),
                Arc::clone(&cache) as Arc<dyn GridCache<M::KeyIn, M::ValueIn>>,
                Arc::clone(&manager) as Arc<dyn CacheManager<M::KeyOut, M::ValueOut>>,
                Arc::clone(&distribution) as Arc<dyn DistributionManager>,
            )
            .with_persistent_store(
                Arc::clone(&persistent) as Arc<dyn PersistentStore<M::KeyIn, M::ValueIn>>
            )
            .with_lifecycle(Arc::clone(&lifecycle))
            .with_cancellation_service(Arc::new(CancellationService::new()))
            .with_check_frequency(self.settings.cancellation_check_frequency);

            caches.insert(member.clone(), cache);
            managers.insert(member.clone(), manager);
            nodes.insert(member.clone(), Arc::new(node));
        }
        debug!(
            "Built in-process grid of {} members for cache {}",
            members.len(),
            self.cache_name
        );

        LocalGrid {
            network: Arc::new(Network::new(nodes)),
            members,
            cache_name: self.cache_name,
            distribution,
            caches,
            managers,
            registry,
            persistent,
            settings: self.settings,
        }
    }
}

/// A whole cluster of in-process members sharing one input cache
pub struct LocalGrid<M: Mapper> {
    members: Vec<Address>,
    cache_name: String,
    distribution: Arc<ConsistentHash>,
    caches: BTreeMap<Address, Arc<MemoryCache<M::KeyIn, M::ValueIn>>>,
    managers: BTreeMap<Address, Arc<MemoryCacheManager<M::KeyOut, M::ValueOut>>>,
    registry: Arc<StoreRegistry<M::KeyOut, M::ValueOut>>,
    persistent: Arc<MemoryPersistentStore<M::KeyIn, M::ValueIn>>,
    network: Arc<Network<M>>,
    settings: EngineSettings,
}

impl<M: Mapper> LocalGrid<M> {
    pub fn members(&self) -> &[Address] {
        &self.members
    }

    /// Address of the `index`-th member, wrapping around
    pub fn address(&self, index: usize) -> &Address {
        &self.members[index % self.members.len()]
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn network(&self) -> &Arc<Network<M>> {
        &self.network
    }

    pub fn owners(&self, key: &M::KeyIn) -> MapReduceResult<Vec<Address>> {
        let bytes = key_bytes(&JsonMarshaller, key)?;
        Ok(self.distribution.owners(&self.cache_name, &bytes))
    }

    pub fn primary_owner(&self, key: &M::KeyIn) -> MapReduceResult<Address> {
        self.owners(key)?
            .into_iter()
            .next()
            .ok_or_else(|| MapReduceError::NoOwner {
                cache: self.cache_name.clone(),
            })
    }

    /// Store an entry in memory on its primary owner and its backups
    pub fn put(&self, key: M::KeyIn, value: M::ValueIn) -> MapReduceResult<()> {
        for owner in self.owners(&key)? {
            if let Some(cache) = self.caches.get(&owner) {
                cache.put(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    /// Store an entry only in the persistent store
    pub fn put_persisted(&self, key: M::KeyIn, value: M::ValueIn) {
        self.persistent.insert(key, value);
    }

    pub fn memory_cache(
        &self,
        member: &Address,
    ) -> Option<&Arc<MemoryCache<M::KeyIn, M::ValueIn>>> {
        self.caches.get(member)
    }

    pub fn node(&self, index: usize) -> Arc<NodeExecutor<M>> {
        let address = self.address(index);
        Arc::clone(&self.network.nodes[address])
    }

    pub fn rpc<R>(&self, index: usize) -> Arc<dyn RpcManager<M, R>>
    where
        R: Reducer<M::KeyOut, M::ValueOut>,
    {
        Arc::new(LoopbackRpc::new(
            self.address(index).clone(),
            Arc::clone(&self.network),
        ))
    }

    /// Task builder invoked from the `index`-th member
    pub fn task<R>(&self, index: usize) -> MapReduceTaskBuilder<M, R>
    where
        R: Reducer<M::KeyOut, M::ValueOut>,
    {
        MapReduceTask::builder(self.node(index))
            .with_rpc(self.rpc(index))
            .with_settings(self.settings.clone())
    }

    pub fn fail_store_creation(&self, index: usize, fail: bool) {
        if let Some(manager) = self.managers.get(self.address(index)) {
            manager.fail_store_creation(fail);
        }
    }

    pub fn set_unreachable(&self, index: usize, unreachable: bool) {
        self.network.set_unreachable(self.address(index), unreachable);
    }

    pub fn set_delay(&self, index: usize, delay: Duration) {
        self.network.set_delay(self.address(index), delay);
    }

    /// Names of intermediate stores still alive anywhere in the grid
    pub fn intermediate_store_names(&self) -> Vec<String> {
        self.registry.store_names()
    }

    pub fn intermediate_store(
        &self,
        name: &str,
    ) -> Option<Arc<MemoryIntermediateStore<M::KeyOut, M::ValueOut>>> {
        self.registry.store(name)
    }

    pub fn results_cache(&self, name: &str) -> Arc<MemoryCache<M::KeyOut, M::ValueOut>> {
        self.registry.results_cache(name)
    }
}
