/// Rotating batch-key allocator for the kernel fast path.
///
/// Keys live in `[100, 999]` so they always print as exactly three digits,
/// which is what lets the kernel program read them at a fixed payload offset.
/// `0` means "no batch" and is never handed out.
use std::sync::atomic::{AtomicU32, Ordering};

/// Smallest key handed out.
pub const MIN_BATCH_KEY: u16 = 100;

/// Largest key handed out.
pub const MAX_BATCH_KEY: u16 = 999;

/// Lock-free allocator for fast-path batch ids.
#[derive(Debug)]
pub struct KeyAllocator {
    value: AtomicU32,
}

impl KeyAllocator {
    /// Create an allocator whose first key is `MIN_BATCH_KEY + 1`.
    pub fn new() -> Self {
        Self {
            value: AtomicU32::new(MIN_BATCH_KEY as u32),
        }
    }

    /// Allocate the next key.
    ///
    /// Increments, and when the result passes `MAX_BATCH_KEY` tries to swap the
    /// counter back to `MIN_BATCH_KEY`. The caller that wins the swap gets
    /// `MIN_BATCH_KEY`; losers increment again and retry.
    pub fn next(&self) -> u16 {
        let mut next = self.value.fetch_add(1, Ordering::AcqRel) + 1;
        while next > MAX_BATCH_KEY as u32 {
            if self
                .value
                .compare_exchange(next, MIN_BATCH_KEY as u32, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return MIN_BATCH_KEY;
            }
            next = self.value.fetch_add(1, Ordering::AcqRel) + 1;
        }
        next as u16
    }

    /// Peek at the last allocated value.
    pub fn current(&self) -> u16 {
        self.value.load(Ordering::Acquire) as u16
    }
}

impl Default for KeyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_first_key() {
        let alloc = KeyAllocator::new();
        assert_eq!(alloc.current(), 100);
        assert_eq!(alloc.next(), 101);
        assert_eq!(alloc.next(), 102);
        assert_eq!(alloc.current(), 102);
    }

    #[test]
    fn test_wraps_after_999() {
        let alloc = KeyAllocator::new();
        let mut last = 0;
        for _ in 0..(999 - 100) {
            last = alloc.next();
        }
        assert_eq!(last, 999);
        assert_eq!(alloc.next(), 100);
        assert_eq!(alloc.next(), 101);
    }

    #[test]
    fn test_concurrent_keys_in_range() {
        let alloc = Arc::new(KeyAllocator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                std::thread::spawn(move || (0..5_000).map(|_| alloc.next()).collect::<Vec<_>>())
            })
            .collect();

        for handle in handles {
            for key in handle.join().unwrap() {
                assert!((MIN_BATCH_KEY..=MAX_BATCH_KEY).contains(&key), "key {key} out of range");
            }
        }
    }

    #[test]
    fn test_concurrent_keys_unique_within_one_lap() {
        // Fewer than 900 allocations cannot wrap onto each other.
        let alloc = Arc::new(KeyAllocator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                std::thread::spawn(move || (0..200).map(|_| alloc.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for key in handle.join().unwrap() {
                assert!(seen.insert(key), "duplicate key {key}");
            }
        }
        assert_eq!(seen.len(), 800);
    }

    proptest! {
        #[test]
        fn prop_never_zero_and_in_range(calls in 1usize..5_000) {
            let alloc = KeyAllocator::new();
            for _ in 0..calls {
                let key = alloc.next();
                prop_assert_ne!(key, 0);
                prop_assert!((MIN_BATCH_KEY..=MAX_BATCH_KEY).contains(&key));
            }
        }
    }
}
