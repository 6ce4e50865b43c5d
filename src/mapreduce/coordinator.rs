//! Client-facing orchestration of one map/reduce task
//!
//! The coordinator partitions work by owner, dispatches one task part per
//! member and phase, joins the parts in submission order and assembles the
//! result. Intermediate state is always reclaimed before an execution
//! returns, whatever the outcome.
//!
//! ```text
//! distributed reduce:  Setup -> Map -> Reduce -> Cleanup
//! local reduce:                 Map -> reduce on the invoking member
//! ```

use super::command::{CancelCommand, MapCombineCommand, ReduceCommand, TaskCommand, TaskResponse};
use super::executor::NodeExecutor;
use super::future::{TaskCanceller, TaskFuture};
use super::intermediate::StoreRef;
use super::task_part::{PartHandle, TaskPart};
use super::{Collator, Mapper, Reducer, TaskId};
use crate::cluster::marshaller::round_trip_copy;
use crate::cluster::{Address, RpcManager};
use crate::config::EngineSettings;
use crate::error::{MapReduceError, MapReduceResult, Phase};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

type Reduced<M> = HashMap<<M as Mapper>::KeyOut, <M as Mapper>::ValueOut>;
type Response<M> = TaskResponse<<M as Mapper>::KeyOut, <M as Mapper>::ValueOut>;

/// Immutable task configuration, validated once by the builder
#[derive(Debug, Clone)]
struct TaskConfig<M: Mapper, R> {
    mapper: M,
    reducer: R,
    combiner: Option<R>,
    keys: Option<Vec<M::KeyIn>>,
    distribute_reduce: bool,
    shared_store: bool,
    timeout: Option<Duration>,
    settings: EngineSettings,
}

/// Assembles a [`MapReduceTask`]
pub struct MapReduceTaskBuilder<M: Mapper, R: Reducer<M::KeyOut, M::ValueOut>> {
    node: Arc<NodeExecutor<M>>,
    rpc: Option<Arc<dyn RpcManager<M, R>>>,
    mapper: Option<M>,
    reducer: Option<R>,
    combiner: Option<R>,
    keys: Option<Vec<M::KeyIn>>,
    distribute_reduce: bool,
    shared_store: bool,
    timeout: Option<Duration>,
    settings: EngineSettings,
}

impl<M: Mapper, R: Reducer<M::KeyOut, M::ValueOut>> MapReduceTaskBuilder<M, R> {
    fn new(node: Arc<NodeExecutor<M>>) -> Self {
        Self {
            node,
            rpc: None,
            mapper: None,
            reducer: None,
            combiner: None,
            keys: None,
            distribute_reduce: false,
            shared_store: false,
            timeout: None,
            settings: EngineSettings::default(),
        }
    }

    /// Cluster transport; without one every part runs on the local member
    pub fn with_rpc(mut self, rpc: Arc<dyn RpcManager<M, R>>) -> Self {
        self.rpc = Some(rpc);
        self
    }

    pub fn mapped_with(mut self, mapper: M) -> Self {
        self.mapper = Some(mapper);
        self
    }

    pub fn reduced_with(mut self, reducer: R) -> Self {
        self.reducer = Some(reducer);
        self
    }

    pub fn combined_with(mut self, combiner: R) -> Self {
        self.combiner = Some(combiner);
        self
    }

    /// Restrict the task to `keys`; an empty list selects every key
    pub fn on_keys(mut self, keys: impl IntoIterator<Item = M::KeyIn>) -> Self {
        let keys: Vec<_> = keys.into_iter().collect();
        self.keys = (!keys.is_empty()).then_some(keys);
        self
    }

    pub fn distribute_reduce_phase(mut self, distribute: bool) -> Self {
        self.distribute_reduce = distribute;
        self
    }

    pub fn use_intermediate_shared_store(mut self, shared: bool) -> Self {
        self.shared_store = shared;
        self
    }

    /// Bound every remote invocation; zero waits forever
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> MapReduceResult<MapReduceTask<M, R>> {
        let mapper = self
            .mapper
            .ok_or_else(|| MapReduceError::configuration("a mapper is required"))?;
        let reducer = self
            .reducer
            .ok_or_else(|| MapReduceError::configuration("a reducer is required"))?;
        self.settings.validate()?;

        if let Some(rpc) = &self.rpc {
            if !rpc.members().contains(self.node.address()) {
                return Err(MapReduceError::configuration(format!(
                    "local member {} is not part of the cluster view",
                    self.node.address()
                )));
            }
            if rpc.address() != self.node.address() {
                return Err(MapReduceError::configuration(format!(
                    "transport of {} cannot drive the executor of {}",
                    rpc.address(),
                    self.node.address()
                )));
            }
        } else if self.distribute_reduce {
            debug!("No cluster transport, reducing on the invoking member");
        }

        let timeout = self.timeout.unwrap_or(self.settings.timeout);
        let config = TaskConfig {
            mapper,
            reducer,
            combiner: self.combiner,
            keys: self.keys,
            distribute_reduce: self.distribute_reduce && self.rpc.is_some(),
            shared_store: self.shared_store,
            timeout: (!timeout.is_zero()).then_some(timeout),
            settings: self.settings,
        };
        Ok(MapReduceTask {
            task_id: TaskId::new(),
            config,
            node: self.node,
            rpc: self.rpc,
            running: AtomicBool::new(false),
            current: Mutex::new(None),
        })
    }
}

/// Per-execution bookkeeping shared with the cancel handle
struct ExecutionState<M: Mapper, R: Reducer<M::KeyOut, M::ValueOut>> {
    task_id: TaskId,
    cancelled: Arc<AtomicBool>,
    parts: Mutex<Vec<(Address, Uuid)>>,
    cancels: Mutex<Vec<JoinHandle<()>>>,
    node: Arc<NodeExecutor<M>>,
    rpc: Option<Arc<dyn RpcManager<M, R>>>,
    timeout: Option<Duration>,
    runtime: Handle,
}

impl<M: Mapper, R: Reducer<M::KeyOut, M::ValueOut>> ExecutionState<M, R> {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn check_cancelled(&self) -> MapReduceResult<()> {
        if self.is_cancelled() {
            return Err(MapReduceError::interrupted(&self.task_id));
        }
        Ok(())
    }

    /// Record a dispatched part. A part registered after cancellation is
    /// cancelled right away.
    fn register(&self, target: Address, part_id: Uuid) {
        let mut parts = self.parts.lock().unwrap_or_else(PoisonError::into_inner);
        parts.push((target.clone(), part_id));
        if self.is_cancelled() {
            self.send_cancel(target, part_id);
        }
    }

    fn forget(&self, part_id: &Uuid) {
        self.parts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(_, id)| id != part_id);
    }

    fn clear_parts(&self) {
        self.parts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn cancel_parts(&self) {
        let parts = self
            .parts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        debug!(
            "Broadcasting cancellation of task {} to {} parts",
            self.task_id,
            parts.len()
        );
        for (target, part_id) in parts {
            self.send_cancel(target, part_id);
        }
    }

    fn send_cancel(&self, target: Address, part_id: Uuid) {
        if target == *self.node.address() {
            self.node.cancellation().cancel(&self.task_id, &part_id);
            return;
        }
        let Some(rpc) = self.rpc.clone() else {
            return;
        };
        let timeout = self.timeout;
        let task_id = self.task_id.clone();
        let delivery = self.runtime.spawn(async move {
            let command = TaskCommand::Cancel(CancelCommand {
                task_id: task_id.clone(),
                part_id,
            });
            if let Err(err) = rpc.invoke_remotely(&[target.clone()], command, timeout).await {
                warn!(
                    "Failed to cancel part {} of task {} on {}: {}",
                    part_id, task_id, target, err
                );
            }
        });
        self.cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(delivery);
    }

    /// Wait until every cancel sent so far has been delivered or given up on
    async fn settle_cancels(&self) {
        let deliveries: Vec<_> = self
            .cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for outcome in join_all(deliveries).await {
            if let Err(err) = outcome {
                debug!("Cancel delivery for task {} aborted: {}", self.task_id, err);
            }
        }
    }
}

/// Clears the running flag when an execution ends or is dropped
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A configured map/reduce task.
///
/// The configuration is fixed; the task can be executed again once the
/// previous execution returned.
pub struct MapReduceTask<M: Mapper, R: Reducer<M::KeyOut, M::ValueOut>> {
    task_id: TaskId,
    config: TaskConfig<M, R>,
    node: Arc<NodeExecutor<M>>,
    rpc: Option<Arc<dyn RpcManager<M, R>>>,
    running: AtomicBool,
    current: Mutex<Option<TaskCanceller>>,
}

impl<M: Mapper, R: Reducer<M::KeyOut, M::ValueOut>> MapReduceTask<M, R> {
    pub fn builder(node: Arc<NodeExecutor<M>>) -> MapReduceTaskBuilder<M, R> {
        MapReduceTaskBuilder::new(node)
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn is_distributed_reduce(&self) -> bool {
        self.config.distribute_reduce
    }

    pub fn uses_shared_store(&self) -> bool {
        self.config.shared_store
    }

    /// Effective per-invocation timeout, `None` when unbounded
    pub fn timeout(&self) -> Option<Duration> {
        self.config.timeout
    }

    /// Run the task and return every reduced entry
    pub async fn execute(&self) -> MapReduceResult<Reduced<M>> {
        let state = self.new_state(Handle::current());
        self.run(state, None).await
    }

    /// Run the task, writing reduced entries into the cache `results_cache`
    pub async fn execute_into(&self, results_cache: &str) -> MapReduceResult<()> {
        let state = self.new_state(Handle::current());
        self.run(state, Some(results_cache.to_string()))
            .await
            .map(|_| ())
    }

    pub async fn execute_collated<C>(&self, collator: C) -> MapReduceResult<C::Output>
    where
        C: Collator<M::KeyOut, M::ValueOut>,
    {
        let reduced = self.execute().await?;
        Ok(collator.collate(reduced))
    }

    /// Run the task on `runtime` and return a cancellable future
    pub fn execute_async(self: &Arc<Self>, runtime: &Handle) -> TaskFuture<Reduced<M>> {
        let state = self.new_state(runtime.clone());
        let canceller = self.canceller_for(&state);
        let task = Arc::clone(self);
        let handle = runtime.spawn(async move { task.run(state, None).await });
        TaskFuture::new(handle, canceller)
    }

    pub fn execute_async_collated<C>(
        self: &Arc<Self>,
        collator: C,
        runtime: &Handle,
    ) -> TaskFuture<C::Output>
    where
        C: Collator<M::KeyOut, M::ValueOut> + Send + 'static,
        C::Output: Send + 'static,
    {
        let state = self.new_state(runtime.clone());
        let canceller = self.canceller_for(&state);
        let task = Arc::clone(self);
        let handle = runtime.spawn(async move {
            let reduced = task.run(state, None).await?;
            Ok(collator.collate(reduced))
        });
        TaskFuture::new(handle, canceller)
    }

    /// Cancel the execution in progress, if any
    pub fn cancel(&self) -> bool {
        let current = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        current.is_some_and(|canceller| canceller.cancel())
    }

    fn new_state(&self, runtime: Handle) -> Arc<ExecutionState<M, R>> {
        Arc::new(ExecutionState {
            task_id: self.task_id.clone(),
            cancelled: Arc::new(AtomicBool::new(false)),
            parts: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            node: Arc::clone(&self.node),
            rpc: self.rpc.clone(),
            timeout: self.config.timeout,
            runtime,
        })
    }

    fn canceller_for(&self, state: &Arc<ExecutionState<M, R>>) -> TaskCanceller {
        let broadcaster = Arc::clone(state);
        TaskCanceller::new(
            self.task_id.clone(),
            Arc::clone(&state.cancelled),
            move || broadcaster.cancel_parts(),
        )
    }

    fn set_current(&self, canceller: Option<TaskCanceller>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = canceller;
    }

    async fn run(
        &self,
        state: Arc<ExecutionState<M, R>>,
        results_cache: Option<String>,
    ) -> MapReduceResult<Reduced<M>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MapReduceError::InvalidState {
                task_id: self.task_id.to_string(),
                member: self.node.address().clone(),
                reason: "task is already executing".to_string(),
            });
        }
        let _running = RunningGuard(&self.running);
        self.set_current(Some(self.canceller_for(&state)));

        info!(
            "Executing task {} on {} ({} reduce, {} store)",
            self.task_id,
            self.node.address(),
            if self.config.distribute_reduce {
                "distributed"
            } else {
                "local"
            },
            if self.config.shared_store {
                "shared"
            } else {
                "private"
            }
        );
        let result = match state.check_cancelled() {
            Err(err) => Err(err),
            Ok(()) => match &self.rpc {
                Some(rpc) if self.config.distribute_reduce => {
                    self.execute_distributed(&state, rpc, results_cache).await
                }
                _ => self.execute_local(&state, results_cache).await,
            },
        };
        self.set_current(None);

        match &result {
            Ok(reduced) => info!("Task {} completed with {} entries", self.task_id, reduced.len()),
            Err(err) if err.is_interrupted() => info!("Task {} was cancelled", self.task_id),
            Err(err) => warn!("Task {} failed: {}", self.task_id, err),
        }
        result
    }

    fn intermediate_store(&self) -> StoreRef {
        if self.config.shared_store {
            StoreRef::shared(self.config.settings.intermediate_store_name.clone())
        } else {
            StoreRef::per_task(&self.task_id)
        }
    }

    fn copy_function<F>(&self, what: &str, function: &F) -> MapReduceResult<F>
    where
        F: Serialize + DeserializeOwned,
    {
        round_trip_copy(self.node.marshaller(), what, function)
    }

    async fn execute_distributed(
        &self,
        state: &Arc<ExecutionState<M, R>>,
        rpc: &Arc<dyn RpcManager<M, R>>,
        results_cache: Option<String>,
    ) -> MapReduceResult<Reduced<M>> {
        let store = self.intermediate_store();
        let members = rpc.members();

        let outcome = match self.setup(rpc, &members, &store).await {
            Ok(()) => self.map_then_reduce(state, &store, results_cache).await,
            Err(err) => Err(err),
        };
        state.settle_cancels().await;
        self.cleanup(rpc, &members, &store).await;
        outcome
    }

    async fn map_then_reduce(
        &self,
        state: &Arc<ExecutionState<M, R>>,
        store: &StoreRef,
        results_cache: Option<String>,
    ) -> MapReduceResult<Reduced<M>> {
        state.check_cancelled()?;
        let mut mapped_keys = HashSet::new();
        for (member, response) in self.map_phase(state, Some(store)).await? {
            match response {
                TaskResponse::MappedKeys(keys) => mapped_keys.extend(keys),
                other => return Err(unexpected(member, "mapped keys", &other)),
            }
        }
        info!(
            "Map phase of task {} migrated {} keys into {}",
            self.task_id,
            mapped_keys.len(),
            store.name()
        );

        state.check_cancelled()?;
        let mut by_owner: BTreeMap<Address, Vec<M::KeyOut>> = BTreeMap::new();
        for key in mapped_keys {
            let owner = self
                .node
                .owner_of(store.name(), &store.key_for(&self.task_id, key.clone()))?;
            by_owner.entry(owner).or_default().push(key);
        }

        // Build every command before dispatching so an early return leaves no part behind
        let mut commands = Vec::with_capacity(by_owner.len());
        for (owner, keys) in by_owner {
            let part_id = Uuid::new_v4();
            let command = TaskCommand::Reduce(ReduceCommand {
                task_id: self.task_id.clone(),
                part_id,
                destination: store.clone(),
                reducer: self.copy_function("reducer", &self.config.reducer)?,
                keys,
                results_cache: results_cache.clone(),
            });
            commands.push((owner, part_id, command));
        }
        state.check_cancelled()?;
        let parts = commands
            .into_iter()
            .map(|(owner, part_id, command)| {
                let handle = self.dispatch(state, owner.clone(), part_id, command);
                TaskPart::Reduce(PartHandle::new(owner, part_id, handle))
            })
            .collect();

        let mut reduced = HashMap::new();
        for (member, response) in self.join_parts(state, parts).await? {
            match response {
                TaskResponse::Reduced(pairs) => reduced.extend(pairs),
                other => return Err(unexpected(member, "reduced values", &other)),
            }
        }
        info!(
            "Reduce phase of task {} produced {} entries",
            self.task_id,
            reduced.len()
        );
        Ok(reduced)
    }

    async fn execute_local(
        &self,
        state: &Arc<ExecutionState<M, R>>,
        results_cache: Option<String>,
    ) -> MapReduceResult<Reduced<M>> {
        let outcome = self.collect_then_reduce(state, results_cache).await;
        state.settle_cancels().await;
        self.release().await;
        outcome
    }

    async fn collect_then_reduce(
        &self,
        state: &Arc<ExecutionState<M, R>>,
        results_cache: Option<String>,
    ) -> MapReduceResult<Reduced<M>> {
        let mut collected: HashMap<M::KeyOut, Vec<M::ValueOut>> = HashMap::new();
        for (member, response) in self.map_phase(state, None).await? {
            match response {
                TaskResponse::Collected(pairs) => {
                    for (key, values) in pairs {
                        collected.entry(key).or_default().extend(values);
                    }
                }
                other => return Err(unexpected(member, "collected values", &other)),
            }
        }
        info!(
            "Map phase of task {} collected {} keys",
            self.task_id,
            collected.len()
        );
        state.check_cancelled()?;

        let local = self.node.address().clone();
        let part_id = Uuid::new_v4();
        let reducer = self.copy_function("reducer", &self.config.reducer)?;
        state.register(local.clone(), part_id);
        let node = Arc::clone(&self.node);
        let task_id = self.task_id.clone();
        let handle = state.runtime.spawn_blocking(move || {
            let token = node.cancellation().register(part_id);
            let result = node.reduce_collected(
                &task_id,
                &reducer,
                collected,
                results_cache.as_deref(),
                &token,
            );
            node.cancellation().unregister(&part_id);
            result.map(TaskResponse::reduced)
        });

        let part = TaskPart::Reduce(PartHandle::new(local.clone(), part_id, handle));
        let reduced = match self.join_parts(state, vec![part]).await?.pop() {
            Some((_, TaskResponse::Reduced(pairs))) => pairs.into_iter().collect(),
            Some((member, other)) => return Err(unexpected(member, "reduced values", &other)),
            None => HashMap::new(),
        };
        Ok(reduced)
    }

    /// Dispatch one map/combine part per input owner and join them
    async fn map_phase(
        &self,
        state: &Arc<ExecutionState<M, R>>,
        store: Option<&StoreRef>,
    ) -> MapReduceResult<Vec<(Address, Response<M>)>> {
        let targets = self.map_targets()?;
        debug!(
            "Task {} dispatching map parts to {} members",
            self.task_id,
            targets.len()
        );

        let mut commands = Vec::with_capacity(targets.len());
        for (target, keys) in targets {
            let part_id = Uuid::new_v4();
            let combiner = match &self.config.combiner {
                Some(combiner) => Some(self.copy_function("combiner", combiner)?),
                None => None,
            };
            let command = TaskCommand::MapCombine(MapCombineCommand {
                task_id: self.task_id.clone(),
                part_id,
                cache_name: self.node.cache_name().to_string(),
                mapper: self.copy_function("mapper", &self.config.mapper)?,
                combiner,
                keys,
                intermediate_store: store.cloned(),
                emit_full_values: store.is_none(),
                max_collector_size: self.config.settings.max_collector_size,
            });
            commands.push((target, part_id, command));
        }
        state.check_cancelled()?;
        let parts = commands
            .into_iter()
            .map(|(target, part_id, command)| {
                let handle = self.dispatch(state, target.clone(), part_id, command);
                TaskPart::MapCombine(PartHandle::new(target, part_id, handle))
            })
            .collect();
        self.join_parts(state, parts).await
    }

    /// Members that get a map part, with the explicit keys each should map
    fn map_targets(&self) -> MapReduceResult<BTreeMap<Address, Option<Vec<M::KeyIn>>>> {
        let mut targets = BTreeMap::new();
        match (&self.rpc, &self.config.keys) {
            (None, keys) => {
                targets.insert(self.node.address().clone(), keys.clone());
            }
            (Some(rpc), None) => {
                for member in rpc.members() {
                    targets.insert(member, None);
                }
            }
            (Some(_), Some(keys)) => {
                let cache = self.node.cache_name();
                for key in keys {
                    let owner = self.node.owner_of(cache, key)?;
                    targets
                        .entry(owner)
                        .or_insert_with(|| Some(Vec::new()))
                        .get_or_insert_with(Vec::new)
                        .push(key.clone());
                }
            }
        }
        Ok(targets)
    }

    /// Start `command` on `target`: in-process on the blocking pool when the
    /// target is this member, through the transport otherwise.
    fn dispatch(
        &self,
        state: &Arc<ExecutionState<M, R>>,
        target: Address,
        part_id: Uuid,
        command: TaskCommand<M, R>,
    ) -> JoinHandle<MapReduceResult<Response<M>>> {
        state.register(target.clone(), part_id);
        debug!(
            "Task {} dispatching {} part {} to {}",
            self.task_id,
            command.describe(),
            part_id,
            target
        );

        if target == *self.node.address() {
            let node = Arc::clone(&self.node);
            return state
                .runtime
                .spawn_blocking(move || node.perform(command));
        }

        let rpc = self.rpc.clone();
        let timeout = self.config.timeout;
        let task_id = self.task_id.clone();
        state.runtime.spawn(async move {
            let rpc = rpc.ok_or_else(|| MapReduceError::Transport {
                member: target.clone(),
                reason: "no cluster transport configured".to_string(),
            })?;
            let mut responses = rpc
                .invoke_remotely(&[target.clone()], command, timeout)
                .await?;
            let response = responses
                .remove(&target)
                .ok_or_else(|| MapReduceError::Transport {
                    member: target.clone(),
                    reason: "no response received".to_string(),
                })?;
            response.into_result(&task_id)
        })
    }

    /// Join parts in submission order.
    ///
    /// The first failure wins; parts still outstanding are cancelled and
    /// drained before it is returned so none keeps writing state.
    async fn join_parts(
        &self,
        state: &Arc<ExecutionState<M, R>>,
        parts: Vec<TaskPart<M::KeyOut, M::ValueOut>>,
    ) -> MapReduceResult<Vec<(Address, Response<M>)>> {
        let mut responses = Vec::with_capacity(parts.len());
        let mut parts = parts.into_iter();
        let mut failure = None;

        for part in parts.by_ref() {
            let target = part.target().clone();
            let part_id = part.part_id();
            match part.join(&self.task_id).await {
                Ok(response) => {
                    state.forget(&part_id);
                    responses.push((target, response));
                }
                Err(err) => {
                    state.forget(&part_id);
                    failure = Some(err);
                    break;
                }
            }
        }

        let failure = failure.or_else(|| state.check_cancelled().err());
        let result = match failure {
            None => Ok(responses),
            Some(err) => {
                state.cancel_parts();
                for part in parts {
                    let part_id = part.part_id();
                    if let Err(late) = part.join(&self.task_id).await {
                        debug!("Discarding outcome of part {}: {}", part_id, late);
                    }
                }
                Err(err)
            }
        };
        state.clear_parts();
        result
    }

    /// Create the intermediate store on every member, the local one in-process
    async fn setup(
        &self,
        rpc: &Arc<dyn RpcManager<M, R>>,
        members: &[Address],
        store: &StoreRef,
    ) -> MapReduceResult<()> {
        debug!(
            "Task {} creating intermediate store {} on {} members",
            self.task_id,
            store.name(),
            members.len()
        );
        let local = self.node.address();
        self.perform_local(TaskCommand::CreateStore(store.clone()))
            .await
            .map_err(|err| {
                MapReduceError::part_failed(&self.task_id, Phase::Setup, local.clone(), err)
            })?;

        let remote: Vec<&Address> = members.iter().filter(|member| *member != local).collect();
        let outcomes = join_all(remote.iter().map(|member| {
            self.invoke_on(rpc, member, TaskCommand::CreateStore(store.clone()))
        }))
        .await;
        for (member, outcome) in remote.into_iter().zip(outcomes) {
            outcome.map_err(|err| {
                MapReduceError::part_failed(&self.task_id, Phase::Setup, member.clone(), err)
            })?;
        }
        Ok(())
    }

    /// Destroy or purge the intermediate store on every member.
    ///
    /// Failures are logged; they never replace the execution's outcome.
    async fn cleanup(
        &self,
        rpc: &Arc<dyn RpcManager<M, R>>,
        members: &[Address],
        store: &StoreRef,
    ) {
        let command = || TaskCommand::<M, R>::RemoveStore {
            store: store.clone(),
            task_id: self.task_id.clone(),
        };
        let local = self.node.address();
        if let Err(err) = self.perform_local(command()).await {
            warn!(
                "Cleanup of {} for task {} failed on {}: {}",
                store.name(),
                self.task_id,
                local,
                err
            );
        }

        let remote: Vec<&Address> = members.iter().filter(|member| *member != local).collect();
        let outcomes = join_all(
            remote
                .iter()
                .map(|member| self.invoke_on(rpc, member, command())),
        )
        .await;
        for (member, outcome) in remote.into_iter().zip(outcomes) {
            if let Err(err) = outcome {
                warn!(
                    "Cleanup of {} for task {} failed on {}: {}",
                    store.name(),
                    self.task_id,
                    member,
                    err
                );
            }
        }
        debug!("Task {} released intermediate store {}", self.task_id, store.name());
    }

    /// Drop cancellations recorded for this execution on every member
    async fn release(&self) {
        let local = self.node.address();
        let release = || TaskCommand::<M, R>::ReleaseTask(self.task_id.clone());
        if let Err(err) = self.perform_local(release()).await {
            warn!("Releasing task {} failed on {}: {}", self.task_id, local, err);
        }
        let Some(rpc) = &self.rpc else {
            return;
        };
        let remote: Vec<Address> = rpc
            .members()
            .into_iter()
            .filter(|member| member != local)
            .collect();
        let outcomes = join_all(
            remote
                .iter()
                .map(|member| self.invoke_on(rpc, member, release())),
        )
        .await;
        for (member, outcome) in remote.iter().zip(outcomes) {
            if let Err(err) = outcome {
                warn!("Releasing task {} failed on {}: {}", self.task_id, member, err);
            }
        }
    }

    /// Run a command on this member off the async worker threads
    async fn perform_local(&self, command: TaskCommand<M, R>) -> MapReduceResult<Response<M>> {
        let node = Arc::clone(&self.node);
        tokio::task::spawn_blocking(move || node.perform(command))
            .await
            .map_err(|err| MapReduceError::InvalidState {
                task_id: self.task_id.to_string(),
                member: self.node.address().clone(),
                reason: format!("local command panicked or was aborted: {}", err),
            })?
    }

    async fn invoke_on(
        &self,
        rpc: &Arc<dyn RpcManager<M, R>>,
        member: &Address,
        command: TaskCommand<M, R>,
    ) -> MapReduceResult<()> {
        let mut responses = rpc
            .invoke_remotely(std::slice::from_ref(member), command, self.config.timeout)
            .await?;
        match responses.remove(member) {
            Some(response) => response.into_result(&self.task_id).map(|_| ()),
            None => Err(MapReduceError::Transport {
                member: member.clone(),
                reason: "no response received".to_string(),
            }),
        }
    }
}

fn unexpected<K, V>(
    member: Address,
    expected: &'static str,
    actual: &TaskResponse<K, V>,
) -> MapReduceError {
    MapReduceError::UnexpectedResponse {
        member,
        expected,
        actual: actual.to_string(),
    }
}
