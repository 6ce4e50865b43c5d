//! Word counting, the canonical map/reduce job

use crate::mapreduce::{Collector, Mapper, Reducer};
use anyhow::anyhow;
use serde::{Deserialize, Serialize};

/// Emits `(word, 1)` for every word of a document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordCountMapper {
    /// Fold words to lowercase before emitting
    pub lowercase: bool,
}

impl WordCountMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lowercase() -> Self {
        Self { lowercase: true }
    }
}

impl Mapper for WordCountMapper {
    type KeyIn = String;
    type ValueIn = String;
    type KeyOut = String;
    type ValueOut = u64;

    fn map(
        &self,
        _document: &String,
        text: &String,
        collector: &mut Collector<String, u64>,
    ) -> anyhow::Result<()> {
        for raw in text.split_whitespace() {
            let word = raw.trim_matches(|c: char| !c.is_alphanumeric());
            if word.is_empty() {
                continue;
            }
            let word = if self.lowercase {
                word.to_lowercase()
            } else {
                word.to_string()
            };
            collector.emit(word, 1);
        }
        Ok(())
    }
}

/// Sums counts; associative and commutative, so it doubles as a combiner
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SumReducer;

impl<K> Reducer<K, u64> for SumReducer {
    fn reduce(&self, _key: &K, values: Vec<u64>) -> anyhow::Result<u64> {
        values
            .into_iter()
            .try_fold(0u64, |total, value| total.checked_add(value))
            .ok_or_else(|| anyhow!("count overflow"))
    }
}
