//! Bounded TTL/LRU index joining admission-time identity to watch events.
//!
//! Keys are content hashes over `(identifier, operation, sanitized bytes)`,
//! so the two streams need no shared ordering: whoever observes the same
//! bytes within the TTL window gets the actor. Every read is destructive.

use crate::event::{content_hash, Operation};
use crate::identity::ResourceIdentifier;
use crate::metrics::CorrelationMetrics;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

pub const DEFAULT_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_ENTRIES: usize = 8192;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CorrelationKey([u8; 32]);

impl CorrelationKey {
    pub fn compute(
        identifier: &ResourceIdentifier,
        operation: Operation,
        sanitized: &[u8],
    ) -> Self {
        CorrelationKey(content_hash(identifier, operation, sanitized))
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorrelationEntry {
    pub username: String,
    pub uid: String,
    pub timestamp: DateTime<Utc>,
}

struct Slot {
    entry: CorrelationEntry,
    inserted: Instant,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CorrelationKey, Slot>,
    // Reads are destructive, so recency order equals insertion order; the
    // sequence index doubles as the LRU list and the expiry scan order.
    recency: BTreeMap<u64, CorrelationKey>,
    next_seq: u64,
}

pub struct CorrelationIndex {
    ttl: Duration,
    max_entries: usize,
    metrics: CorrelationMetrics,
    inner: Mutex<Inner>,
}

impl CorrelationIndex {
    pub fn new(ttl: Duration, max_entries: usize, metrics: CorrelationMetrics) -> Self {
        CorrelationIndex {
            ttl,
            max_entries: max_entries.max(1),
            metrics,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn put(&self, key: CorrelationKey, entry: CorrelationEntry) {
        let mut inner = self.inner.lock().expect("correlation lock poisoned");
        Self::expire(&mut inner, self.ttl, Instant::now());

        if let Some(old) = inner.entries.remove(&key) {
            inner.recency.remove(&old.seq);
        } else if inner.entries.len() >= self.max_entries {
            let oldest = inner.recency.iter().next().map(|(&seq, &k)| (seq, k));
            if let Some((seq, oldest)) = oldest {
                inner.recency.remove(&seq);
                inner.entries.remove(&oldest);
                self.metrics.evictions.inc();
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.recency.insert(seq, key);
        inner.entries.insert(
            key,
            Slot {
                entry,
                inserted: Instant::now(),
                seq,
            },
        );
        self.metrics.put.inc();
    }

    pub fn get_and_delete(&self, key: &CorrelationKey) -> Option<CorrelationEntry> {
        let mut inner = self.inner.lock().expect("correlation lock poisoned");
        Self::expire(&mut inner, self.ttl, Instant::now());
        match inner.entries.remove(key) {
            Some(slot) => {
                inner.recency.remove(&slot.seq);
                self.metrics.hit.inc();
                Some(slot.entry)
            }
            None => {
                self.metrics.miss.inc();
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("correlation lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expire(inner: &mut Inner, ttl: Duration, now: Instant) {
        loop {
            let Some((&seq, &key)) = inner.recency.iter().next() else {
                break;
            };
            let expired = inner
                .entries
                .get(&key)
                .map(|slot| now.duration_since(slot.inserted) >= ttl)
                .unwrap_or(true);
            if !expired {
                break;
            }
            inner.recency.remove(&seq);
            inner.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ResourceScope;

    fn key(n: u8) -> CorrelationKey {
        let id = ResourceIdentifier {
            group: String::new(),
            version: "v1".into(),
            resource: "configmaps".into(),
            scope: ResourceScope::Namespaced,
            namespace: Some("default".into()),
            name: format!("cm-{n}"),
        };
        CorrelationKey::compute(&id, Operation::Update, b"payload")
    }

    fn entry(user: &str) -> CorrelationEntry {
        CorrelationEntry {
            username: user.to_string(),
            uid: "uid-1".to_string(),
            timestamp: Utc::now(),
        }
    }

    fn index(ttl: Duration, max: usize) -> CorrelationIndex {
        CorrelationIndex::new(ttl, max, CorrelationMetrics::default())
    }

    #[test]
    fn get_is_destructive() {
        let idx = index(DEFAULT_TTL, 16);
        idx.put(key(1), entry("jane@acme.com"));
        let hit = idx.get_and_delete(&key(1)).unwrap();
        assert_eq!(hit.username, "jane@acme.com");
        assert!(idx.get_and_delete(&key(1)).is_none());
        assert!(idx.is_empty());
    }

    #[test]
    fn never_grows_past_max_entries() {
        let idx = index(DEFAULT_TTL, 3);
        for n in 0..10 {
            idx.put(key(n), entry("u"));
            assert!(idx.len() <= 3);
        }
        // the three most recent survive
        assert!(idx.get_and_delete(&key(0)).is_none());
        assert!(idx.get_and_delete(&key(9)).is_some());
    }

    #[test]
    fn replacing_a_key_does_not_evict_others() {
        let idx = index(DEFAULT_TTL, 2);
        idx.put(key(1), entry("a"));
        idx.put(key(2), entry("b"));
        idx.put(key(1), entry("c"));
        assert_eq!(idx.len(), 2);
        assert_eq!(idx.get_and_delete(&key(1)).unwrap().username, "c");
        assert_eq!(idx.get_and_delete(&key(2)).unwrap().username, "b");
    }

    #[test]
    fn entries_expire_after_ttl() {
        let idx = index(Duration::from_millis(20), 16);
        idx.put(key(1), entry("a"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(idx.get_and_delete(&key(1)).is_none());
        assert!(idx.is_empty());
    }
}
