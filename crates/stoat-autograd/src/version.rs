use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

// VersionCounter — Shared monotonic token for in-place mutation detection
//
// Every variable owns a counter; the tensor library bumps it whenever the
// underlying storage is mutated in place. A saved tensor records the value
// at save time and compares on unpack. Aliasing views share one counter,
// and `join_with` merges two previously independent counters so that all
// future increments are visible on both sides.

/// Handle to a shared monotonic version counter.
///
/// Cloning the handle aliases it: clones observe the same increments, and a
/// `join_with` through any clone affects all of them.
#[derive(Clone)]
pub struct VersionCounter {
    // Handle -> block indirection. Joining replaces the block, so every
    // handle sharing this counter switches together.
    block: Arc<RwLock<Arc<AtomicU64>>>,
}

impl VersionCounter {
    pub fn new() -> VersionCounter {
        VersionCounter {
            block: Arc::new(RwLock::new(Arc::new(AtomicU64::new(0)))),
        }
    }

    /// Record one in-place mutation. Returns the new version.
    pub fn bump(&self) -> u64 {
        self.block.read().unwrap().fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The current version.
    pub fn current(&self) -> u64 {
        self.block.read().unwrap().load(Ordering::SeqCst)
    }

    /// Make this counter alias `other`: from now on the two observe the
    /// same sequence of increments. Values recorded before the join keep
    /// their meaning — expectations are captured, not re-derived.
    pub fn join_with(&self, other: &VersionCounter) {
        let shared = other.block.read().unwrap().clone();
        *self.block.write().unwrap() = shared;
    }
}

impl Default for VersionCounter {
    fn default() -> Self {
        VersionCounter::new()
    }
}

impl std::fmt::Debug for VersionCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VersionCounter({})", self.current())
    }
}
