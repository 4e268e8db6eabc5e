/// Metadata store: the single versioned blob shared by the whole cluster.
///
/// The value is only ever replaced as a whole. Readers get an `Arc` snapshot,
/// so a reader never sees a half-written value and never blocks a writer for
/// longer than a pointer swap.
use crate::types::Metadata;
use std::sync::{Arc, PoisonError, RwLock};

/// Holder for the cluster metadata.
#[derive(Debug, Default)]
pub struct MetadataStore {
    current: RwLock<Arc<Metadata>>,
}

impl MetadataStore {
    /// Create a store holding empty metadata with version `0`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp `data` with the current time and make it the stored value.
    ///
    /// This only updates local state; spreading it to the cluster is the
    /// caller's job (see [`GossipNode::publish`](crate::cluster::GossipNode::publish)).
    pub fn publish(&self, data: Vec<u8>) -> Metadata {
        let metadata = Metadata::new(data);
        self.replace(metadata.clone());
        metadata
    }

    /// The stored payload.
    pub fn read(&self) -> Vec<u8> {
        self.current().data.clone()
    }

    /// The stored value, including its version.
    pub fn current(&self) -> Arc<Metadata> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// The stored version.
    pub fn version(&self) -> i64 {
        self.current().update
    }

    /// Replace the stored value if `candidate` is strictly newer.
    ///
    /// The comparison and the swap happen under one write lock, so two racing
    /// candidates always leave the newer one in place.
    pub fn adopt_if_newer(&self, candidate: Metadata) -> bool {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if candidate.is_newer_than(&guard) {
            *guard = Arc::new(candidate);
            true
        } else {
            false
        }
    }

    fn replace(&self, metadata: Metadata) {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(metadata);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_starts_empty() {
        let store = MetadataStore::new();
        assert!(store.read().is_empty());
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn test_publish_stamps_version() {
        let store = MetadataStore::new();
        let published = store.publish(b"cfg-v1".to_vec());

        assert!(published.update > 0);
        assert_eq!(published.size, 6);
        assert_eq!(store.read(), b"cfg-v1");
        assert_eq!(store.version(), published.update);
    }

    #[test]
    fn test_adopt_only_strictly_newer() {
        let store = MetadataStore::new();
        assert!(store.adopt_if_newer(Metadata::with_update(b"a".to_vec(), 10)));
        assert!(!store.adopt_if_newer(Metadata::with_update(b"b".to_vec(), 10)));
        assert!(!store.adopt_if_newer(Metadata::with_update(b"c".to_vec(), 9)));
        assert_eq!(store.read(), b"a");
        assert!(store.adopt_if_newer(Metadata::with_update(b"d".to_vec(), 11)));
        assert_eq!(store.read(), b"d");
    }

    #[test]
    fn test_zero_version_never_adopted() {
        let store = MetadataStore::new();
        assert!(!store.adopt_if_newer(Metadata::default()));
    }

    #[test]
    fn test_concurrent_adopt_keeps_newest() {
        let store = Arc::new(MetadataStore::new());
        let handles: Vec<_> = (1..=8i64)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..500i64 {
                        let version = i * 8 + t;
                        store.adopt_if_newer(Metadata::with_update(version.to_string().into_bytes(), version));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.version(), 499 * 8 + 8);
    }

    proptest! {
        #[test]
        fn prop_greater_wins_regardless_of_order(a in 1i64..1_000_000, b in 1i64..1_000_000) {
            // Versions are assumed unique across publishers.
            prop_assume!(a != b);
            let ma = Metadata::with_update(b"a".to_vec(), a);
            let mb = Metadata::with_update(b"b".to_vec(), b);

            let forward = MetadataStore::new();
            forward.adopt_if_newer(ma.clone());
            forward.adopt_if_newer(mb.clone());

            let backward = MetadataStore::new();
            backward.adopt_if_newer(mb);
            backward.adopt_if_newer(ma);

            prop_assert_eq!(forward.version(), a.max(b));
            prop_assert_eq!(backward.version(), a.max(b));
            prop_assert_eq!(forward.read(), backward.read());
        }
    }
}
