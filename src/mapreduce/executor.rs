//! Per-member execution of map, combine and reduce work
//!
//! A [`NodeExecutor`] lives on every member. It runs user functions against
//! the entries the member is primary owner of and against its slice of the
//! intermediate store. Commands reach it either in-process (the coordinating
//! member) or through the transport.

use super::cancellation::{CancellationService, CancellationToken};
use super::collector::Collector;
use super::command::{MapCombineCommand, ReduceCommand, TaskCommand, TaskResponse};
use super::intermediate::chunk_values;
use super::lifecycle::{NoopLifecycle, TaskLifecycle};
use super::{Mapper, Reducer, TaskId};
use crate::cluster::marshaller::key_bytes;
use crate::cluster::{
    Address, CacheManager, DistributionManager, GridCache, JsonMarshaller, Marshaller,
    PersistentStore,
};
use crate::config::DEFAULT_CHECK_FREQUENCY;
use crate::error::{MapReduceError, MapReduceResult};
use serde::Serialize;
use std::any::type_name;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// What a map/combine part hands back to the coordinator
#[derive(Debug, Clone)]
pub enum MapCombineOutput<K, V> {
    /// Keys whose values were migrated into the intermediate store
    MigratedKeys(HashSet<K>),
    /// Per-key values kept for reduction on the invoking member
    Collected(HashMap<K, Vec<V>>),
}

impl<K, V> From<MapCombineOutput<K, V>> for TaskResponse<K, V> {
    fn from(output: MapCombineOutput<K, V>) -> Self {
        match output {
            MapCombineOutput::MigratedKeys(keys) => TaskResponse::MappedKeys(keys),
            MapCombineOutput::Collected(values) => TaskResponse::collected(values),
        }
    }
}

/// Fixed-cadence cancellation check, one tick per processed entry
struct InterruptCheck<'a> {
    token: &'a CancellationToken,
    frequency: usize,
    counter: usize,
}

impl<'a> InterruptCheck<'a> {
    fn new(token: &'a CancellationToken, frequency: usize) -> Self {
        Self {
            token,
            frequency: frequency.max(1),
            counter: 0,
        }
    }

    fn tick(&mut self, task_id: &TaskId) -> MapReduceResult<()> {
        if self.counter % self.frequency == 0 && self.token.is_cancelled() {
            debug!(
                "Task {} observed cancellation after {} entries",
                task_id, self.counter
            );
            return Err(MapReduceError::interrupted(task_id));
        }
        self.counter += 1;
        Ok(())
    }
}

/// Runs task commands on one member
pub struct NodeExecutor<M: Mapper> {
    address: Address,
    input: Arc<dyn GridCache<M::KeyIn, M::ValueIn>>,
    persistent: Option<Arc<dyn PersistentStore<M::KeyIn, M::ValueIn>>>,
    caches: Arc<dyn CacheManager<M::KeyOut, M::ValueOut>>,
    distribution: Arc<dyn DistributionManager>,
    marshaller: Arc<dyn Marshaller>,
    lifecycle: Arc<dyn TaskLifecycle>,
    cancellation: Arc<CancellationService>,
    check_frequency: usize,
}

impl<M: Mapper> NodeExecutor<M> {
    pub fn new(
        address: Address,
        input: Arc<dyn GridCache<M::KeyIn, M::ValueIn>>,
        caches: Arc<dyn CacheManager<M::KeyOut, M::ValueOut>>,
        distribution: Arc<dyn DistributionManager>,
    ) -> Self {
        Self {
            address,
            input,
            persistent: None,
            caches,
            distribution,
            marshaller: Arc::new(JsonMarshaller),
            lifecycle: Arc::new(NoopLifecycle),
            cancellation: Arc::new(CancellationService::new()),
            check_frequency: DEFAULT_CHECK_FREQUENCY,
        }
    }

    /// Entries missing from memory are loaded from `store` during mapping
    pub fn with_persistent_store(
        mut self,
        store: Arc<dyn PersistentStore<M::KeyIn, M::ValueIn>>,
    ) -> Self {
        self.persistent = Some(store);
        self
    }

    pub fn with_marshaller(mut self, marshaller: Arc<dyn Marshaller>) -> Self {
        self.marshaller = marshaller;
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn TaskLifecycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn with_cancellation_service(mut self, service: Arc<CancellationService>) -> Self {
        self.cancellation = service;
        self
    }

    pub fn with_check_frequency(mut self, frequency: usize) -> Self {
        self.check_frequency = frequency;
        self
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn cache_name(&self) -> &str {
        self.input.name()
    }

    pub fn marshaller(&self) -> &dyn Marshaller {
        self.marshaller.as_ref()
    }

    pub fn distribution(&self) -> &dyn DistributionManager {
        self.distribution.as_ref()
    }

    pub fn cancellation(&self) -> &Arc<CancellationService> {
        &self.cancellation
    }

    /// Primary owner of `key` in `cache`, as seen by this member
    pub fn owner_of<K: Serialize>(&self, cache: &str, key: &K) -> MapReduceResult<Address> {
        let bytes = key_bytes(self.marshaller.as_ref(), key)?;
        self.distribution
            .primary_location(cache, &bytes)
            .ok_or_else(|| MapReduceError::NoOwner {
                cache: cache.to_string(),
            })
    }

    fn is_local_primary<K: Serialize>(&self, cache: &str, key: &K) -> MapReduceResult<bool> {
        Ok(self.owner_of(cache, key)? == self.address)
    }

    /// Handle one inbound command.
    ///
    /// Map and reduce work is registered with the cancellation service under
    /// the command's part id for as long as it runs.
    pub fn perform<R>(
        &self,
        command: TaskCommand<M, R>,
    ) -> MapReduceResult<TaskResponse<M::KeyOut, M::ValueOut>>
    where
        R: Reducer<M::KeyOut, M::ValueOut>,
    {
        trace!("{} handling {} command", self.address, command.describe());
        match command {
            TaskCommand::CreateStore(store) => {
                self.caches.create_intermediate_store(store.name())?;
                debug!("Intermediate store {} ready on {}", store.name(), self.address);
                Ok(TaskResponse::Ack)
            }
            TaskCommand::RemoveStore { store, task_id } => {
                self.cancellation.release_task(&task_id);
                if store.is_shared() {
                    if let Some(shared) = self.caches.intermediate_store(store.name()) {
                        let purged = shared.purge_task(&task_id);
                        debug!(
                            "Purged {} entries of task {} from {} on {}",
                            purged,
                            task_id,
                            store.name(),
                            self.address
                        );
                    }
                } else {
                    self.caches.remove_intermediate_store(store.name())?;
                    debug!("Removed intermediate store {} on {}", store.name(), self.address);
                }
                Ok(TaskResponse::Ack)
            }
            TaskCommand::MapCombine(cmd) => {
                let token = self.cancellation.register(cmd.part_id);
                let result = self.map_and_combine(&cmd, &token);
                self.cancellation.unregister(&cmd.part_id);
                result.map(TaskResponse::from)
            }
            TaskCommand::Reduce(cmd) => {
                let token = self.cancellation.register(cmd.part_id);
                let result = self.reduce(&cmd, &token);
                self.cancellation.unregister(&cmd.part_id);
                result.map(TaskResponse::reduced)
            }
            TaskCommand::Cancel(cmd) => {
                self.cancellation.cancel(&cmd.task_id, &cmd.part_id);
                Ok(TaskResponse::Ack)
            }
            TaskCommand::ReleaseTask(task_id) => {
                self.cancellation.release_task(&task_id);
                Ok(TaskResponse::Ack)
            }
        }
    }

    /// Map every selected local entry, combine, then migrate or return.
    pub fn map_and_combine<R>(
        &self,
        cmd: &MapCombineCommand<M, R>,
        token: &CancellationToken,
    ) -> MapReduceResult<MapCombineOutput<M::KeyOut, M::ValueOut>>
    where
        R: Reducer<M::KeyOut, M::ValueOut>,
    {
        let cache = self.input.name();
        let candidates = match &cmd.keys {
            Some(keys) => keys.clone(),
            None => self.input.local_keys(),
        };
        let mut local_keys = Vec::with_capacity(candidates.len());
        for key in candidates {
            if self.is_local_primary(cache, &key)? {
                local_keys.push(key);
            }
        }
        debug!(
            "Task {} mapping {} local keys of {} on {}",
            cmd.task_id,
            local_keys.len(),
            cache,
            self.address
        );

        let mapper_name = type_name::<M>();
        let mut collector = Collector::new();
        self.lifecycle.on_pre_execute(mapper_name, cache);
        let mapped = self.map_entries(cmd, local_keys, &mut collector, token);
        self.lifecycle.on_post_execute(mapper_name);
        mapped?;

        trace!(
            "Task {} emitted {} pairs on {}",
            cmd.task_id,
            collector.emitted_count(),
            self.address
        );
        let mut collected = collector.into_collected_values();
        if let Some(combiner) = &cmd.combiner {
            collected = self.combine(&cmd.task_id, combiner, collected)?;
        }

        if cmd.emit_full_values {
            return Ok(MapCombineOutput::Collected(collected));
        }
        self.migrate(cmd, collected, token)
            .map(MapCombineOutput::MigratedKeys)
    }

    fn map_entries<R>(
        &self,
        cmd: &MapCombineCommand<M, R>,
        local_keys: Vec<M::KeyIn>,
        collector: &mut Collector<M::KeyOut, M::ValueOut>,
        token: &CancellationToken,
    ) -> MapReduceResult<()>
    where
        R: Reducer<M::KeyOut, M::ValueOut>,
    {
        let mut check = InterruptCheck::new(token, self.check_frequency);
        let mut processed = HashSet::new();
        let mut requested = HashSet::new();

        for key in local_keys {
            check.tick(&cmd.task_id)?;
            match self.input.get(&key) {
                Some(value) => {
                    self.invoke_mapper(cmd, &key, &value, collector)?;
                    processed.insert(key);
                }
                None => {
                    requested.insert(key);
                }
            }
        }

        let Some(store) = &self.persistent else {
            return Ok(());
        };
        let cache = self.input.name();
        let filter = |key: &M::KeyIn| {
            if processed.contains(key) {
                return Ok(false);
            }
            if cmd.keys.is_some() && !requested.contains(key) {
                return Ok(false);
            }
            self.is_local_primary(cache, key)
        };
        let mut loaded = 0usize;
        store.scan_with_filter(&filter, &mut |key: M::KeyIn, value: M::ValueIn| {
            check.tick(&cmd.task_id)?;
            loaded += 1;
            self.invoke_mapper(cmd, &key, &value, collector)
        })?;
        if loaded > 0 {
            debug!(
                "Task {} mapped {} entries loaded from the persistent store on {}",
                cmd.task_id, loaded, self.address
            );
        }
        Ok(())
    }

    fn invoke_mapper<R>(
        &self,
        cmd: &MapCombineCommand<M, R>,
        key: &M::KeyIn,
        value: &M::ValueIn,
        collector: &mut Collector<M::KeyOut, M::ValueOut>,
    ) -> MapReduceResult<()>
    where
        R: Reducer<M::KeyOut, M::ValueOut>,
    {
        cmd.mapper
            .map(key, value, collector)
            .map_err(|source| MapReduceError::UserFunctionFailed {
                task_id: cmd.task_id.to_string(),
                member: self.address.clone(),
                function: "mapper",
                source,
            })
    }

    /// Combine every key that collected more than one value
    fn combine<R>(
        &self,
        task_id: &TaskId,
        combiner: &R,
        collected: HashMap<M::KeyOut, Vec<M::ValueOut>>,
    ) -> MapReduceResult<HashMap<M::KeyOut, Vec<M::ValueOut>>>
    where
        R: Reducer<M::KeyOut, M::ValueOut>,
    {
        let combiner_name = type_name::<R>();
        self.lifecycle
            .on_pre_execute(combiner_name, self.input.name());
        let result = collected
            .into_iter()
            .map(|(key, values)| -> MapReduceResult<(M::KeyOut, Vec<M::ValueOut>)> {
                if values.len() <= 1 {
                    return Ok((key, values));
                }
                let combined = combiner.reduce(&key, values).map_err(|source| {
                    MapReduceError::UserFunctionFailed {
                        task_id: task_id.to_string(),
                        member: self.address.clone(),
                        function: "combiner",
                        source,
                    }
                })?;
                Ok((key, vec![combined]))
            })
            .collect();
        self.lifecycle.on_post_execute(combiner_name);
        result
    }

    /// Chunk and merge collected values into the intermediate store
    fn migrate<R>(
        &self,
        cmd: &MapCombineCommand<M, R>,
        collected: HashMap<M::KeyOut, Vec<M::ValueOut>>,
        token: &CancellationToken,
    ) -> MapReduceResult<HashSet<M::KeyOut>>
    where
        R: Reducer<M::KeyOut, M::ValueOut>,
    {
        let store_ref = cmd.intermediate_store.as_ref().ok_or_else(|| {
            MapReduceError::InvalidState {
                task_id: cmd.task_id.to_string(),
                member: self.address.clone(),
                reason: "map-combine without an intermediate store".to_string(),
            }
        })?;
        let store = self
            .caches
            .intermediate_store(store_ref.name())
            .ok_or_else(|| MapReduceError::StoreNotFound {
                store: store_ref.name().to_string(),
                member: self.address.clone(),
            })?;

        // Group by owner of the intermediate key so each reducer's share is logged once
        let mut by_owner: BTreeMap<Address, Vec<(M::KeyOut, Vec<M::ValueOut>)>> = BTreeMap::new();
        for (key, values) in collected {
            let intermediate_key = store_ref.key_for(&cmd.task_id, key.clone());
            let owner = self.owner_of(store_ref.name(), &intermediate_key)?;
            by_owner.entry(owner).or_default().push((key, values));
        }

        let mut check = InterruptCheck::new(token, self.check_frequency);
        let mut migrated = HashSet::new();
        for (owner, entries) in by_owner {
            trace!(
                "Task {} migrating {} keys owned by {} into {}",
                cmd.task_id,
                entries.len(),
                owner,
                store_ref.name()
            );
            for (key, values) in entries {
                check.tick(&cmd.task_id)?;
                for chunk in chunk_values(values, cmd.max_collector_size) {
                    store.merge(store_ref.key_for(&cmd.task_id, key.clone()), chunk)?;
                }
                migrated.insert(key);
            }
        }
        Ok(migrated)
    }

    /// Reduce the keys this member owns in the intermediate store.
    ///
    /// With a results cache the reduced entries are written there and the
    /// returned map is empty.
    pub fn reduce<R>(
        &self,
        cmd: &ReduceCommand<M::KeyOut, R>,
        token: &CancellationToken,
    ) -> MapReduceResult<HashMap<M::KeyOut, M::ValueOut>>
    where
        R: Reducer<M::KeyOut, M::ValueOut>,
    {
        if cmd.keys.is_empty() {
            return Err(MapReduceError::InvalidState {
                task_id: cmd.task_id.to_string(),
                member: self.address.clone(),
                reason: "reduce dispatched without keys".to_string(),
            });
        }
        let store = self
            .caches
            .intermediate_store(cmd.destination.name())
            .ok_or_else(|| MapReduceError::StoreNotFound {
                store: cmd.destination.name().to_string(),
                member: self.address.clone(),
            })?;

        let mut entries = Vec::with_capacity(cmd.keys.len());
        for key in &cmd.keys {
            let values = store
                .get(&cmd.destination.key_for(&cmd.task_id, key.clone()))
                .ok_or_else(|| MapReduceError::InvalidState {
                    task_id: cmd.task_id.to_string(),
                    member: self.address.clone(),
                    reason: format!("no intermediate values for key {:?}", key),
                })?;
            entries.push((key.clone(), values.into_values()));
        }
        debug!(
            "Task {} reducing {} keys from {} on {}",
            cmd.task_id,
            entries.len(),
            store.name(),
            self.address
        );
        self.reduce_entries(
            &cmd.task_id,
            &cmd.reducer,
            store.name(),
            entries,
            cmd.results_cache.as_deref(),
            token,
        )
    }

    /// Reduce values gathered by map parts on the invoking member
    pub fn reduce_collected<R>(
        &self,
        task_id: &TaskId,
        reducer: &R,
        collected: HashMap<M::KeyOut, Vec<M::ValueOut>>,
        results_cache: Option<&str>,
        token: &CancellationToken,
    ) -> MapReduceResult<HashMap<M::KeyOut, M::ValueOut>>
    where
        R: Reducer<M::KeyOut, M::ValueOut>,
    {
        debug!(
            "Task {} reducing {} collected keys on {}",
            task_id,
            collected.len(),
            self.address
        );
        self.reduce_entries(
            task_id,
            reducer,
            self.input.name(),
            collected,
            results_cache,
            token,
        )
    }

    fn reduce_entries<R>(
        &self,
        task_id: &TaskId,
        reducer: &R,
        cache: &str,
        entries: impl IntoIterator<Item = (M::KeyOut, Vec<M::ValueOut>)>,
        results_cache: Option<&str>,
        token: &CancellationToken,
    ) -> MapReduceResult<HashMap<M::KeyOut, M::ValueOut>>
    where
        R: Reducer<M::KeyOut, M::ValueOut>,
    {
        let reducer_name = type_name::<R>();
        let mut check = InterruptCheck::new(token, self.check_frequency);
        let mut reduced = HashMap::new();

        self.lifecycle.on_pre_execute(reducer_name, cache);
        let outcome = entries.into_iter().try_for_each(|(key, values)| {
            check.tick(task_id)?;
            let value = reducer
                .reduce(&key, values)
                .map_err(|source| MapReduceError::UserFunctionFailed {
                    task_id: task_id.to_string(),
                    member: self.address.clone(),
                    function: "reducer",
                    source,
                })?;
            reduced.insert(key, value);
            Ok::<(), MapReduceError>(())
        });
        self.lifecycle.on_post_execute(reducer_name);
        outcome?;

        match results_cache {
            Some(name) => {
                let results = self.caches.results_cache(name)?;
                let written = reduced.len();
                for (key, value) in reduced {
                    results.put(key, value);
                }
                debug!(
                    "Task {} wrote {} reduced entries into {} on {}",
                    task_id, written, name, self.address
                );
                Ok(HashMap::new())
            }
            None => Ok(reduced),
        }
    }
}
