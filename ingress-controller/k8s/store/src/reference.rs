use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::Mutex;

/// Tracks which consumers (routes) reference which objects (secrets).
///
/// Keys are opaque. A referenced key is present only while at least one
/// consumer references it.
#[derive(Debug, Default)]
pub struct ReferenceIndex {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    consumers_by_ref: HashMap<String, HashSet<String>>,
    refs_by_consumer: HashMap<String, HashSet<String>>,
}

// === impl ReferenceIndex ===

impl ReferenceIndex {
    /// Records that `consumer` references each key in `refs`.
    pub fn insert<I, S>(&self, consumer: &str, refs: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inner = self.inner.lock();
        for r in refs {
            let r = r.into();
            inner
                .refs_by_consumer
                .entry(consumer.to_string())
                .or_default()
                .insert(r.clone());
            inner
                .consumers_by_ref
                .entry(r)
                .or_default()
                .insert(consumer.to_string());
        }
    }

    /// Removes `consumer` from every reference it holds.
    pub fn delete(&self, consumer: &str) {
        let mut inner = self.inner.lock();
        let Some(refs) = inner.refs_by_consumer.remove(consumer) else {
            return;
        };
        for r in refs {
            if let Some(consumers) = inner.consumers_by_ref.get_mut(&r) {
                consumers.remove(consumer);
                if consumers.is_empty() {
                    inner.consumers_by_ref.remove(&r);
                }
            }
        }
    }

    /// Replaces the full set of references held by `consumer`.
    pub fn replace<I, S>(&self, consumer: &str, refs: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.delete(consumer);
        self.insert(consumer, refs);
    }

    pub fn has(&self, r: &str) -> bool {
        self.inner.lock().consumers_by_ref.contains_key(r)
    }

    pub fn has_consumer(&self, consumer: &str) -> bool {
        self.inner.lock().refs_by_consumer.contains_key(consumer)
    }

    /// Returns the sorted consumers of `r`.
    pub fn consumers_of(&self, r: &str) -> Vec<String> {
        let inner = self.inner.lock();
        sorted(inner.consumers_by_ref.get(r))
    }

    /// Returns the sorted references held by `consumer`.
    pub fn refs_of(&self, consumer: &str) -> Vec<String> {
        let inner = self.inner.lock();
        sorted(inner.refs_by_consumer.get(consumer))
    }

    /// The number of referenced keys.
    pub fn len(&self) -> usize {
        self.inner.lock().consumers_by_ref.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sorted(keys: Option<&HashSet<String>>) -> Vec<String> {
    let mut keys = keys
        .map(|k| k.iter().cloned().collect::<Vec<_>>())
        .unwrap_or_default();
    keys.sort();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_is_idempotent() {
        let index = ReferenceIndex::default();
        index.insert("ns/route", ["ns/tls"]);
        index.insert("ns/route", ["ns/tls"]);
        assert_eq!(index.consumers_of("ns/tls"), vec!["ns/route"]);
        assert_eq!(index.refs_of("ns/route"), vec!["ns/tls"]);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn delete_drops_empty_entries() {
        let index = ReferenceIndex::default();
        index.insert("ns/a", ["ns/shared", "ns/only-a"]);
        index.insert("ns/b", ["ns/shared"]);

        index.delete("ns/a");
        assert!(!index.has("ns/only-a"));
        assert!(index.has("ns/shared"));
        assert_eq!(index.consumers_of("ns/shared"), vec!["ns/b"]);
        assert!(!index.has_consumer("ns/a"));
        assert!(index.has_consumer("ns/b"));

        index.delete("ns/b");
        assert!(index.is_empty());
    }

    #[test]
    fn unknown_keys_are_empty() {
        let index = ReferenceIndex::default();
        assert!(!index.has("nope"));
        assert!(!index.has_consumer("nope"));
        assert!(index.consumers_of("nope").is_empty());
        assert!(index.refs_of("nope").is_empty());
        index.delete("nope");
    }

    #[test]
    fn replace_swaps_references() {
        let index = ReferenceIndex::default();
        index.insert("ns/route", ["ns/old"]);
        index.replace("ns/route", ["ns/new"]);
        assert!(!index.has("ns/old"));
        assert_eq!(index.consumers_of("ns/new"), vec!["ns/route"]);

        index.replace("ns/route", Vec::<String>::new());
        assert!(index.is_empty());
        assert!(!index.has_consumer("ns/route"));
    }
}
