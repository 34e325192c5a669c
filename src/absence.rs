//! Absence Cache
//!
//! Remembers claimant UIDs confirmed absent by an authoritative NotFound, so
//! release passes for many objects pointing at the same vanished claimant
//! issue one read instead of many. Entries are never written from anything
//! weaker than a NotFound.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

use crate::domain::ports::{Object, ObjectKey, ObjectStore};
use crate::error::Result;
use crate::metrics;

/// Default number of remembered UIDs.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Outcome of a claimant lookup.
#[derive(Debug, Clone)]
pub enum Presence {
    /// The claimant with this UID no longer exists.
    Gone,
    /// An object exists under the claimant's name. Its UID may differ.
    Present(Box<Object>),
}

/// Bounded LRU of UIDs confirmed absent.
pub struct AbsenceCache {
    entries: Mutex<LruCache<String, ()>>,
}

impl AbsenceCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Whether `uid` is known absent. Refreshes its recency.
    pub fn contains(&self, uid: &str) -> bool {
        self.entries.lock().get(uid).is_some()
    }

    pub fn insert(&self, uid: impl Into<String>) {
        self.entries.lock().put(uid.into(), ());
    }

    /// Check whether the claimant `uid`, last seen at `key`, still exists.
    ///
    /// A cache hit answers without a read. On a miss the store is read
    /// directly; only NotFound is cached. Other errors propagate.
    pub async fn lookup_claimant(
        &self,
        store: &dyn ObjectStore,
        key: &ObjectKey,
        uid: &str,
    ) -> Result<Presence> {
        if self.contains(uid) {
            metrics::record_absence_lookup(true);
            trace!(claimant = %key, uid, "Absence cache hit");
            return Ok(Presence::Gone);
        }

        metrics::record_absence_lookup(false);
        match store.get(key).await {
            Ok(object) => Ok(Presence::Present(Box::new(object))),
            Err(e) if e.is_not_found() => {
                self.insert(uid);
                Ok(Presence::Gone)
            }
            Err(e) => Err(e),
        }
    }
}

impl Default for AbsenceCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for AbsenceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.lock();
        f.debug_struct("AbsenceCache")
            .field("len", &entries.len())
            .field("capacity", &entries.cap())
            .finish()
    }
}
