//! Common test utilities and helpers
//!
//! Grids, corpora and user functions shared by the integration tests.

#![allow(dead_code)]

use gridreduce::mapreduce::TaskLifecycle;
use gridreduce::testing::{LocalGrid, LocalGridBuilder, WordCountMapper};
use gridreduce::{Collector, EngineSettings, Mapper, Reducer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Documents used by most word count tests
pub const CORPUS: &[(&str, &str)] = &[
    ("doc-01", "the cat sat on the mat"),
    ("doc-02", "the dog sat on the log"),
    ("doc-03", "a cat and a dog"),
    ("doc-04", "the quick brown fox jumps over the lazy dog"),
    ("doc-05", "cat cat cat"),
    ("doc-06", "never odd or even"),
    ("doc-07", "the end of the story is not the end"),
    ("doc-08", "mat log fox"),
    ("doc-09", "brown bread and brown rice"),
    ("doc-10", "a dog is a dog is a dog"),
    ("doc-11", "over and over and over"),
    ("doc-12", "quick quick slow"),
];

/// Word counts of `documents`, computed sequentially
pub fn expected_counts<'a>(documents: impl IntoIterator<Item = &'a str>) -> HashMap<String, u64> {
    let mut counts = HashMap::new();
    for text in documents {
        for word in text.split_whitespace() {
            *counts.entry(word.to_string()).or_insert(0) += 1;
        }
    }
    counts
}

pub fn corpus_counts() -> HashMap<String, u64> {
    expected_counts(CORPUS.iter().map(|(_, text)| *text))
}

/// Builder for grids preloaded with documents
pub struct TestGridBuilder {
    members: usize,
    num_owners: usize,
    documents: Vec<(String, String)>,
    persisted: Vec<(String, String)>,
    settings: EngineSettings,
    lifecycle: Option<Arc<dyn TaskLifecycle>>,
}

impl TestGridBuilder {
    pub fn new() -> Self {
        Self {
            members: 3,
            num_owners: 1,
            documents: CORPUS
                .iter()
                .map(|(key, text)| (key.to_string(), text.to_string()))
                .collect(),
            persisted: Vec::new(),
            settings: EngineSettings::default(),
            lifecycle: None,
        }
    }

    pub fn members(mut self, members: usize) -> Self {
        self.members = members;
        self
    }

    pub fn num_owners(mut self, num_owners: usize) -> Self {
        self.num_owners = num_owners;
        self
    }

    pub fn documents(mut self, documents: &[(&str, &str)]) -> Self {
        self.documents = documents
            .iter()
            .map(|(key, text)| (key.to_string(), text.to_string()))
            .collect();
        self
    }

    pub fn persisted(mut self, key: &str, text: &str) -> Self {
        self.persisted.push((key.to_string(), text.to_string()));
        self
    }

    pub fn lifecycle(mut self, lifecycle: Arc<dyn TaskLifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Check for cancellation before every entry
    pub fn eager_cancellation(mut self) -> Self {
        self.settings.cancellation_check_frequency = 1;
        self
    }

    pub fn build<M>(self) -> LocalGrid<M>
    where
        M: Mapper<KeyIn = String, ValueIn = String>,
    {
        let mut builder = LocalGridBuilder::new()
            .members(self.members)
            .num_owners(self.num_owners)
            .cache_name("documents")
            .settings(self.settings);
        if let Some(lifecycle) = self.lifecycle {
            builder = builder.lifecycle(lifecycle);
        }
        let grid = builder.build();
        for (key, text) in self.documents {
            grid.put(key, text).expect("document should be stored");
        }
        for (key, text) in self.persisted {
            grid.put_persisted(key, text);
        }
        grid
    }
}

impl Default for TestGridBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub fn word_count_grid(members: usize) -> LocalGrid<WordCountMapper> {
    TestGridBuilder::new().members(members).build()
}

/// Emits every word with the position it appears at in its document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionMapper;

impl Mapper for PositionMapper {
    type KeyIn = String;
    type ValueIn = String;
    type KeyOut = String;
    type ValueOut = Vec<u64>;

    fn map(
        &self,
        _key: &String,
        value: &String,
        collector: &mut Collector<String, Vec<u64>>,
    ) -> anyhow::Result<()> {
        for (position, word) in value.split_whitespace().enumerate() {
            collector.emit(word.to_string(), vec![position as u64]);
        }
        Ok(())
    }
}

/// Concatenates every list it sees, sorted so results compare across runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcatReducer;

impl Reducer<String, Vec<u64>> for ConcatReducer {
    fn reduce(&self, _key: &String, values: Vec<Vec<u64>>) -> anyhow::Result<Vec<u64>> {
        let mut all: Vec<u64> = values.into_iter().flatten().collect();
        all.sort_unstable();
        Ok(all)
    }
}

/// Emits `(key, value)` unchanged
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityMapper;

impl Mapper for IdentityMapper {
    type KeyIn = String;
    type ValueIn = u64;
    type KeyOut = String;
    type ValueOut = u64;

    fn map(
        &self,
        key: &String,
        value: &u64,
        collector: &mut Collector<String, u64>,
    ) -> anyhow::Result<()> {
        collector.emit(key.clone(), *value);
        Ok(())
    }
}

/// Word count that sleeps before every document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowMapper {
    pub delay: Duration,
}

impl SlowMapper {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Mapper for SlowMapper {
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
        std::thread::sleep(self.delay);
        WordCountMapper::new().map(key, value, collector)
    }
}

/// Word count failing on any document containing `poison`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailingMapper {
    pub poison: String,
}

impl FailingMapper {
    pub fn new(poison: &str) -> Self {
        Self {
            poison: poison.to_string(),
        }
    }
}

impl Mapper for FailingMapper {
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
        if value.split_whitespace().any(|word| word == self.poison) {
            anyhow::bail!("refusing to map {}", key);
        }
        WordCountMapper::new().map(key, value, collector)
    }
}

/// Records which user functions ran, in order
#[derive(Debug, Default)]
pub struct RecordingLifecycle {
    calls: Mutex<Vec<String>>,
}

impl RecordingLifecycle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Short type names of the functions that started
    pub fn started(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn started_count(&self, function: &str) -> usize {
        self.started().iter().filter(|name| *name == function).count()
    }
}

impl TaskLifecycle for RecordingLifecycle {
    fn on_pre_execute(&self, function: &str, _cache: &str) {
        let short = function.rsplit("::").next().unwrap_or(function);
        self.calls.lock().unwrap().push(short.to_string());
    }
}
