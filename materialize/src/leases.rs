//! Operator-visible registry of in-flight chunk leases.
//!
//! A lease marks a chunk as being worked on. Releasing a lease, even a forced
//! release of a stuck unit, never rolls back writes the unit already
//! committed; re-running a released chunk is safe because all writes go
//! through the id-keyed upsert.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use chrono::{DateTime, Utc};

use crate::chunks::ChunkRange;

/// A unique identifier for a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(transparent)]
pub struct LeaseId(u64);

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of one in-flight unit.
#[derive(Debug, Clone)]
pub struct LeaseInfo {
    pub id: LeaseId,
    pub table: String,
    pub range: ChunkRange,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    leases: Mutex<HashMap<u64, LeaseInfo>>,
    counter: AtomicU64,
}

/// Shared lease registry. Clones refer to the same instance.
#[derive(Clone, Default)]
pub struct LeaseRegistry {
    inner: Arc<Inner>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a unit of work; the lease is released when the guard drops.
    pub fn acquire(&self, table: &str, range: ChunkRange) -> LeaseGuard {
        let id = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        let info = LeaseInfo {
            id: LeaseId(id),
            table: table.to_owned(),
            range,
            acquired_at: Utc::now(),
        };
        self.inner
            .leases
            .lock()
            .expect("lease lock poisoned")
            .insert(id, info);
        LeaseGuard {
            registry: self.clone(),
            id,
        }
    }

    /// All currently held leases.
    pub fn in_flight(&self) -> Vec<LeaseInfo> {
        let mut leases: Vec<LeaseInfo> = self
            .inner
            .leases
            .lock()
            .expect("lease lock poisoned")
            .values()
            .cloned()
            .collect();
        leases.sort_by_key(|lease| lease.id.0);
        leases
    }

    /// Forcibly releases a stuck lease. Returns `false` when it was already
    /// gone. Partial writes of the unit stay committed.
    pub fn force_release(&self, id: LeaseId) -> bool {
        let released = self
            .inner
            .leases
            .lock()
            .expect("lease lock poisoned")
            .remove(&id.0)
            .is_some();
        if released {
            tracing::warn!(lease = %id, "lease forcibly released");
        }
        released
    }

    fn release(&self, id: u64) {
        self.inner
            .leases
            .lock()
            .expect("lease lock poisoned")
            .remove(&id);
    }
}

/// RAII handle for one lease.
pub struct LeaseGuard {
    registry: LeaseRegistry,
    id: u64,
}

impl LeaseGuard {
    pub fn id(&self) -> LeaseId {
        LeaseId(self.id)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range() -> ChunkRange {
        ChunkRange { start: 1, end: 100 }
    }

    #[test]
    fn guard_drop_releases_the_lease() {
        let registry = LeaseRegistry::new();

        {
            let _guard = registry.acquire("synapses", range());
            assert_eq!(registry.in_flight().len(), 1);
        }

        assert!(registry.in_flight().is_empty());
    }

    #[test]
    fn force_release_removes_a_held_lease() {
        let registry = LeaseRegistry::new();
        let guard = registry.acquire("synapses", range());

        assert!(registry.force_release(guard.id()));
        assert!(registry.in_flight().is_empty());
        // The guard's own drop is now a no-op.
        drop(guard);
        assert!(!registry.force_release(LeaseId(0)));
    }
}
