//! Per-invocation accumulator of emitted pairs

use std::collections::HashMap;
use std::hash::Hash;

/// Collects the pairs one mapper invocation emits.
///
/// Owned by a single map invocation, so it needs no synchronization. Values
/// keep their emission order per key and duplicates are retained.
#[derive(Debug, Clone)]
pub struct Collector<K, V> {
    store: HashMap<K, Vec<V>>,
    emitted: usize,
}

impl<K: Eq + Hash, V> Collector<K, V> {
    pub fn new() -> Self {
        Self {
            store: HashMap::new(),
            emitted: 0,
        }
    }

    /// Append `value` to the sequence collected for `key`
    pub fn emit(&mut self, key: K, value: V) {
        self.store.entry(key).or_default().push(value);
        self.emitted += 1;
    }

    pub fn collected_values(&self) -> &HashMap<K, Vec<V>> {
        &self.store
    }

    pub fn into_collected_values(self) -> HashMap<K, Vec<V>> {
        self.store
    }

    /// Total number of emitted pairs, duplicates included
    pub fn emitted_count(&self) -> usize {
        self.emitted
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

impl<K: Eq + Hash, V> Default for Collector<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_preserves_order_per_key() {
        let mut collector = Collector::new();
        collector.emit("a", 1);
        collector.emit("b", 10);
        collector.emit("a", 2);
        collector.emit("a", 3);

        let values = collector.collected_values();
        assert_eq!(values["a"], vec![1, 2, 3]);
        assert_eq!(values["b"], vec![10]);
    }

    #[test]
    fn test_duplicates_are_retained() {
        let mut collector = Collector::new();
        collector.emit("the", 1);
        collector.emit("the", 1);

        assert_eq!(collector.emitted_count(), 2);
        assert_eq!(collector.into_collected_values()["the"], vec![1, 1]);
    }

    #[test]
    fn test_new_collector_is_empty() {
        let collector: Collector<String, u32> = Collector::default();
        assert!(collector.is_empty());
        assert_eq!(collector.emitted_count(), 0);
    }
}
