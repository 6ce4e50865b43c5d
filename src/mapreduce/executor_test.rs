//! Unit tests for the node executor

use super::*;
use crate::cluster::{Address, DistributionManager, IntermediateStore};
use crate::config::EngineSettings;
use crate::error::MapReduceError;
use crate::testing::{
    LocalGrid, LocalGridBuilder, MemoryCache, MemoryCacheManager, MemoryPersistentStore,
    StoreRegistry, SumReducer, WordCountMapper,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Default)]
struct RecordingLifecycle {
    events: Mutex<Vec<String>>,
}

impl RecordingLifecycle {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl TaskLifecycle for RecordingLifecycle {
    fn on_pre_execute(&self, function: &str, cache: &str) {
        let short = function.rsplit("::").next().unwrap_or(function);
        self.events
            .lock()
            .unwrap()
            .push(format!("pre:{}:{}", short, cache));
    }

    fn on_post_execute(&self, function: &str) {
        let short = function.rsplit("::").next().unwrap_or(function);
        self.events.lock().unwrap().push(format!("post:{}", short));
    }
}

/// Word count that fails on documents containing "poison"
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PoisonedMapper;

impl Mapper for PoisonedMapper {
    type KeyIn = String;
    type ValueIn = String;
    type KeyOut = String;
    type ValueOut = u64;

    fn map(
        &self,
        key: &String,
        value: &String,
        collector: &mut Collector<String, u64>,
    ) -> anyhow::Result<()> {
        if value.contains("poison") {
            anyhow::bail!("cannot map {}", key);
        }
        WordCountMapper::new().map(key, value, collector)
    }
}

/// Sum that refuses to combine a single value
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StrictSum;

impl Reducer<String, u64> for StrictSum {
    fn reduce(&self, key: &String, values: Vec<u64>) -> anyhow::Result<u64> {
        if values.len() < 2 {
            anyhow::bail!("combiner called on singleton key {}", key);
        }
        Ok(values.iter().sum())
    }
}

fn single_member<M: Mapper>(settings: EngineSettings) -> (LocalGrid<M>, Arc<RecordingLifecycle>) {
    let lifecycle = Arc::new(RecordingLifecycle::default());
    let grid = LocalGridBuilder::new()
        .cache_name("docs")
        .settings(settings)
        .lifecycle(lifecycle.clone())
        .build();
    (grid, lifecycle)
}

fn map_command<M, R>(
    task_id: &TaskId,
    mapper: M,
    combiner: Option<R>,
    store: Option<StoreRef>,
) -> MapCombineCommand<M, R>
where
    M: Mapper,
    R: Reducer<M::KeyOut, M::ValueOut>,
{
    MapCombineCommand {
        task_id: task_id.clone(),
        part_id: Uuid::new_v4(),
        cache_name: "docs".to_string(),
        mapper,
        combiner,
        keys: None,
        emit_full_values: store.is_none(),
        intermediate_store: store,
        max_collector_size: 2,
    }
}

fn create_store(node: &NodeExecutor<WordCountMapper>, store: &StoreRef) {
    node.perform(TaskCommand::<WordCountMapper, SumReducer>::CreateStore(
        store.clone(),
    ))
    .unwrap();
}

#[test]
fn test_emit_full_values_returns_raw_sequences() {
    let (grid, _) = single_member::<WordCountMapper>(EngineSettings::default());
    grid.put("doc1".to_string(), "the cat sat on the mat".to_string())
        .unwrap();
    let node = grid.node(0);

    let cmd = map_command::<_, SumReducer>(&TaskId::new(), WordCountMapper::new(), None, None);
    let output = node
        .map_and_combine(&cmd, &CancellationToken::new())
        .unwrap();

    let MapCombineOutput::Collected(values) = output else {
        panic!("expected collected values");
    };
    assert_eq!(values["the"], vec![1, 1]);
    assert_eq!(values["cat"], vec![1]);
    assert!(grid.intermediate_store_names().is_empty());
}

#[test]
fn test_combiner_skips_singleton_keys() {
    let (grid, _) = single_member::<WordCountMapper>(EngineSettings::default());
    grid.put("doc1".to_string(), "a b a a".to_string()).unwrap();
    let node = grid.node(0);

    let cmd = map_command(&TaskId::new(), WordCountMapper::new(), Some(StrictSum), None);
    let MapCombineOutput::Collected(values) = node
        .map_and_combine(&cmd, &CancellationToken::new())
        .unwrap()
    else {
        panic!("expected collected values");
    };

    assert_eq!(values["a"], vec![3]);
    assert_eq!(values["b"], vec![1]);
}

#[test]
fn test_migration_merges_chunks_into_private_store() {
    let (grid, _) = single_member::<WordCountMapper>(EngineSettings::default());
    grid.put("doc1".to_string(), "x x x x x y".to_string())
        .unwrap();
    let node = grid.node(0);
    let task_id = TaskId::new();
    let store = StoreRef::per_task(&task_id);
    create_store(&node, &store);

    let cmd = map_command::<_, SumReducer>(&task_id, WordCountMapper::new(), None, Some(store.clone()));
    let MapCombineOutput::MigratedKeys(keys) = node
        .map_and_combine(&cmd, &CancellationToken::new())
        .unwrap()
    else {
        panic!("expected migrated keys");
    };

    assert_eq!(keys.len(), 2);
    let backing = grid.intermediate_store(store.name()).unwrap();
    let x = backing
        .get(&IntermediateKey::Plain("x".to_string()))
        .unwrap();
    assert_eq!(x.into_values(), vec![1, 1, 1, 1, 1]);
}

#[test]
fn test_shared_store_uses_composite_keys() {
    let (grid, _) = single_member::<WordCountMapper>(EngineSettings::default());
    grid.put("doc1".to_string(), "hello".to_string()).unwrap();
    let node = grid.node(0);
    let task_id = TaskId::new();
    let store = StoreRef::shared(DEFAULT_INTERMEDIATE_STORE);
    create_store(&node, &store);

    let cmd = map_command::<_, SumReducer>(&task_id, WordCountMapper::new(), None, Some(store.clone()));
    node.map_and_combine(&cmd, &CancellationToken::new())
        .unwrap();

    let backing = grid.intermediate_store(DEFAULT_INTERMEDIATE_STORE).unwrap();
    assert!(backing
        .get(&IntermediateKey::Plain("hello".to_string()))
        .is_none());
    assert!(backing
        .get(&store.key_for(&task_id, "hello".to_string()))
        .is_some());
    assert_eq!(backing.entries_of(&task_id), 1);
}

#[test]
fn test_missing_store_is_reported() {
    let (grid, _) = single_member::<WordCountMapper>(EngineSettings::default());
    grid.put("doc1".to_string(), "hello".to_string()).unwrap();
    let task_id = TaskId::new();

    let cmd = map_command::<_, SumReducer>(
        &task_id,
        WordCountMapper::new(),
        None,
        Some(StoreRef::per_task(&task_id)),
    );
    let err = grid
        .node(0)
        .map_and_combine(&cmd, &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(err, MapReduceError::StoreNotFound { .. }));
}

#[test]
fn test_explicit_keys_limited_to_local_primaries() {
    let grid: LocalGrid<WordCountMapper> = LocalGridBuilder::new()
        .members(2)
        .cache_name("docs")
        .build();
    let docs: Vec<String> = (0..16).map(|i| format!("doc-{}", i)).collect();
    for doc in &docs {
        grid.put(doc.clone(), format!("word{}", &doc[4..])).unwrap();
    }
    let node = grid.node(0);
    let local: Vec<&String> = docs
        .iter()
        .filter(|doc| grid.primary_owner(doc).unwrap() == *node.address())
        .collect();

    let mut cmd = map_command::<_, SumReducer>(&TaskId::new(), WordCountMapper::new(), None, None);
    cmd.keys = Some(docs.clone());
    let MapCombineOutput::Collected(values) = node
        .map_and_combine(&cmd, &CancellationToken::new())
        .unwrap()
    else {
        panic!("expected collected values");
    };

    assert_eq!(values.len(), local.len());
    for doc in local {
        assert!(values.contains_key(&format!("word{}", &doc[4..])));
    }
}

#[test]
fn test_persisted_entries_are_mapped_once() {
    let (grid, _) = single_member::<WordCountMapper>(EngineSettings::default());
    grid.put("doc1".to_string(), "memory".to_string()).unwrap();
    grid.put_persisted("doc1".to_string(), "memory".to_string());
    grid.put_persisted("doc2".to_string(), "disk".to_string());

    let cmd = map_command::<_, SumReducer>(&TaskId::new(), WordCountMapper::new(), None, None);
    let MapCombineOutput::Collected(values) = grid
        .node(0)
        .map_and_combine(&cmd, &CancellationToken::new())
        .unwrap()
    else {
        panic!("expected collected values");
    };

    assert_eq!(values["memory"], vec![1]);
    assert_eq!(values["disk"], vec![1]);
}

#[test]
fn test_explicit_keys_skip_unrequested_persisted_entries() {
    let (grid, _) = single_member::<WordCountMapper>(EngineSettings::default());
    grid.put_persisted("doc1".to_string(), "wanted".to_string());
    grid.put_persisted("doc2".to_string(), "unwanted".to_string());

    let mut cmd = map_command::<_, SumReducer>(&TaskId::new(), WordCountMapper::new(), None, None);
    cmd.keys = Some(vec!["doc1".to_string()]);
    let MapCombineOutput::Collected(values) = grid
        .node(0)
        .map_and_combine(&cmd, &CancellationToken::new())
        .unwrap()
    else {
        panic!("expected collected values");
    };

    assert!(values.contains_key("wanted"));
    assert!(!values.contains_key("unwanted"));
}

/// Ownership table with no live members
struct NoOwners;

impl DistributionManager for NoOwners {
    fn primary_location(&self, _cache: &str, _key: &[u8]) -> Option<Address> {
        None
    }
}

#[test]
fn test_persisted_entry_without_owner_fails_the_part() {
    let member = Address::new("node-0");
    let persistent: Arc<MemoryPersistentStore<String, String>> =
        Arc::new(MemoryPersistentStore::default());
    persistent.insert("doc1".to_string(), "on disk".to_string());
    let input: Arc<MemoryCache<String, String>> = Arc::new(MemoryCache::new("docs"));
    let registry: Arc<StoreRegistry<String, u64>> = Arc::new(StoreRegistry::default());
    let caches = Arc::new(MemoryCacheManager::new(member.clone(), registry));
    let node: NodeExecutor<WordCountMapper> =
        NodeExecutor::new(member, input, caches, Arc::new(NoOwners))
            .with_persistent_store(persistent);

    let cmd = map_command::<_, SumReducer>(&TaskId::new(), WordCountMapper::new(), None, None);
    let err = node
        .map_and_combine(&cmd, &CancellationToken::new())
        .unwrap_err();

    assert!(matches!(err, MapReduceError::NoOwner { .. }));
}

#[test]
fn test_cancelled_token_interrupts_and_runs_post_hook() {
    let (grid, lifecycle) = single_member::<WordCountMapper>(EngineSettings::default());
    grid.put("doc1".to_string(), "hello".to_string()).unwrap();
    let token = CancellationToken::new();
    token.cancel();

    let cmd = map_command::<_, SumReducer>(&TaskId::new(), WordCountMapper::new(), None, None);
    let err = grid.node(0).map_and_combine(&cmd, &token).unwrap_err();

    assert!(err.is_interrupted());
    assert_eq!(
        lifecycle.events(),
        vec![
            "pre:WordCountMapper:docs".to_string(),
            "post:WordCountMapper".to_string()
        ]
    );
}

#[test]
fn test_mapper_failure_is_wrapped_and_post_hook_runs() {
    let (grid, lifecycle) = single_member::<PoisonedMapper>(EngineSettings::default());
    grid.put("doc1".to_string(), "poison".to_string()).unwrap();

    let cmd = map_command::<_, SumReducer>(&TaskId::new(), PoisonedMapper, None, None);
    let err = grid
        .node(0)
        .map_and_combine(&cmd, &CancellationToken::new())
        .unwrap_err();

    match err {
        MapReduceError::UserFunctionFailed {
            function, source, ..
        } => {
            assert_eq!(function, "mapper");
            assert!(source.to_string().contains("cannot map doc1"));
        }
        other => panic!("unexpected error {}", other),
    }
    assert_eq!(lifecycle.events().last().unwrap(), "post:PoisonedMapper");
}

#[test]
fn test_cancel_command_before_map_command() {
    let (grid, _) = single_member::<WordCountMapper>(EngineSettings::default());
    grid.put("doc1".to_string(), "hello".to_string()).unwrap();
    let node = grid.node(0);
    let cmd = map_command::<_, SumReducer>(&TaskId::new(), WordCountMapper::new(), None, None);

    node.perform(TaskCommand::<WordCountMapper, SumReducer>::Cancel(CancelCommand {
        task_id: cmd.task_id.clone(),
        part_id: cmd.part_id,
    }))
    .unwrap();
    let err = node.perform(TaskCommand::MapCombine(cmd)).unwrap_err();

    assert!(err.is_interrupted());
    assert_eq!(node.cancellation().registered(), 0);
}

#[test]
fn test_release_forgets_cancels_of_finished_parts() {
    let (grid, _) = single_member::<WordCountMapper>(EngineSettings::default());
    let node = grid.node(0);
    let task_id = TaskId::new();

    node.perform(TaskCommand::<WordCountMapper, SumReducer>::Cancel(CancelCommand {
        task_id: task_id.clone(),
        part_id: Uuid::new_v4(),
    }))
    .unwrap();
    assert_eq!(node.cancellation().registered(), 1);

    node.perform(TaskCommand::<WordCountMapper, SumReducer>::ReleaseTask(task_id))
        .unwrap();
    assert_eq!(node.cancellation().registered(), 0);
}

#[test]
fn test_reduce_rejects_empty_key_set() {
    let (grid, _) = single_member::<WordCountMapper>(EngineSettings::default());
    let task_id = TaskId::new();
    let cmd = ReduceCommand::<String, SumReducer> {
        task_id: task_id.clone(),
        part_id: Uuid::new_v4(),
        destination: StoreRef::per_task(&task_id),
        reducer: SumReducer,
        keys: Vec::new(),
        results_cache: None,
    };

    let err = grid
        .node(0)
        .reduce(&cmd, &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(err, MapReduceError::InvalidState { .. }));
}

#[test]
fn test_reduce_reads_store_and_writes_results_cache() {
    let (grid, lifecycle) = single_member::<WordCountMapper>(EngineSettings::default());
    grid.put("doc1".to_string(), "b a b".to_string()).unwrap();
    let node = grid.node(0);
    let task_id = TaskId::new();
    let store = StoreRef::per_task(&task_id);
    create_store(&node, &store);
    let map = map_command::<_, SumReducer>(&task_id, WordCountMapper::new(), None, Some(store.clone()));
    node.map_and_combine(&map, &CancellationToken::new())
        .unwrap();

    let mut reduce = ReduceCommand {
        task_id: task_id.clone(),
        part_id: Uuid::new_v4(),
        destination: store,
        reducer: SumReducer,
        keys: vec!["a".to_string(), "b".to_string()],
        results_cache: None,
    };
    let reduced = node.reduce(&reduce, &CancellationToken::new()).unwrap();
    let expected: HashMap<String, u64> = [("a".to_string(), 1), ("b".to_string(), 2)]
        .into_iter()
        .collect();
    assert_eq!(reduced, expected);

    reduce.results_cache = Some("counts".to_string());
    let returned = node.reduce(&reduce, &CancellationToken::new()).unwrap();
    assert!(returned.is_empty());
    assert_eq!(grid.results_cache("counts").entries(), expected);
    let reduce_hook = format!("pre:SumReducer:{}", reduce.destination.name());
    assert!(lifecycle.events().contains(&reduce_hook));
}

#[test]
fn test_remove_store_purges_only_own_task_in_shared_store() {
    let (grid, _) = single_member::<WordCountMapper>(EngineSettings::default());
    grid.put("doc1".to_string(), "shared words".to_string())
        .unwrap();
    let node = grid.node(0);
    let store = StoreRef::shared(DEFAULT_INTERMEDIATE_STORE);
    create_store(&node, &store);

    let mine = TaskId::new();
    let theirs = TaskId::new();
    for task_id in [&mine, &theirs] {
        let cmd = map_command::<_, SumReducer>(task_id, WordCountMapper::new(), None, Some(store.clone()));
        node.map_and_combine(&cmd, &CancellationToken::new())
            .unwrap();
    }

    node.perform(TaskCommand::<WordCountMapper, SumReducer>::RemoveStore {
        store: store.clone(),
        task_id: mine.clone(),
    })
    .unwrap();

    let backing = grid.intermediate_store(DEFAULT_INTERMEDIATE_STORE).unwrap();
    assert_eq!(backing.entries_of(&mine), 0);
    assert_eq!(backing.entries_of(&theirs), 2);
}

#[test]
fn test_owner_of_matches_grid() {
    let grid: LocalGrid<WordCountMapper> = LocalGridBuilder::new().members(3).build();
    let node = grid.node(1);
    let key = "some-doc".to_string();
    let owner: Address = node.owner_of(grid.cache_name(), &key).unwrap();
    assert_eq!(owner, grid.primary_owner(&key).unwrap());
}
