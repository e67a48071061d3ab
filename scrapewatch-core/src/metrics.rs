use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// One numeric observation produced by a scraper run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric_name: String,
    pub data_source: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl MetricSample {
    pub fn new(metric_name: impl Into<String>, data_source: impl Into<String>, value: f64) -> Self {
        Self {
            metric_name: metric_name.into(),
            data_source: data_source.into(),
            value,
            timestamp: Utc::now(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Bounded FIFO of recent values per metric name. Every operation takes the
/// lock exactly once, so readers never observe a half-evicted buffer.
#[derive(Debug)]
pub struct MetricHistoryStore {
    capacity: usize,
    histories: Mutex<HashMap<String, VecDeque<f64>>>,
}

impl Default for MetricHistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl MetricHistoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            histories: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record(&self, sample: &MetricSample) {
        self.push(&sample.metric_name, sample.value);
    }

    pub fn push(&self, metric_name: &str, value: f64) {
        let mut guard = self.lock();
        let history = guard
            .entry(metric_name.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));
        history.push_back(value);
        while history.len() > self.capacity {
            history.pop_front();
        }
    }

    /// Copy of the stored values, oldest first.
    pub fn snapshot(&self, metric_name: &str) -> Vec<f64> {
        self.lock()
            .get(metric_name)
            .map(|history| history.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, metric_name: &str) -> usize {
        self.lock().get(metric_name).map(VecDeque::len).unwrap_or(0)
    }

    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn clear(&self, metric_name: &str) -> bool {
        self.lock().remove(metric_name).is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<f64>>> {
        self.histories
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn keeps_last_hundred_values_in_order() {
        let store = MetricHistoryStore::default();
        for i in 0..150 {
            store.record(&MetricSample::new("close_price", "yahoo", i as f64));
        }
        let values = store.snapshot("close_price");
        assert_eq!(values.len(), 100);
        let expected: Vec<f64> = (50..150).map(|i| i as f64).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn histories_are_independent_per_metric() {
        let store = MetricHistoryStore::new(3);
        store.push("a", 1.0);
        store.push("b", 2.0);
        store.push("a", 3.0);
        assert_eq!(store.snapshot("a"), vec![1.0, 3.0]);
        assert_eq!(store.snapshot("b"), vec![2.0]);
        assert!(store.snapshot("missing").is_empty());
        assert_eq!(store.metric_names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn concurrent_writers_never_exceed_capacity() {
        let store = Arc::new(MetricHistoryStore::new(20));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        store.push("volume", (worker * 100 + i) as f64);
                        assert!(store.len("volume") <= 20);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len("volume"), 20);
    }
}
