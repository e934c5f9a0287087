use std::num::NonZeroUsize;

use lru::LruCache;

use crate::error::Result;
use crate::event::{Event, EventId, Signature};

/// Default capacity of the shared signature cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Bounded LRU of `(event_id → signature)` pairs known to verify.
///
/// The cache is shared across relays: a popular event arriving from three
/// relays incurs at most one Schnorr verification.
pub struct SignatureCache {
    entries: LruCache<EventId, Signature>,
}

impl SignatureCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero capacity");
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// True iff the cache attests a prior successful verification of exactly
    /// this `(id, sig)` pair. A differing signature for a known id is a
    /// miss. A hit refreshes the entry to most-recently-used.
    pub fn is_verified(&mut self, id: &EventId, sig: &Signature) -> bool {
        match self.entries.get(id) {
            Some(known) => known == sig,
            None => false,
        }
    }

    /// Insert or refresh an entry, evicting the least-recently-used one when
    /// over capacity. Eviction is soft: logged, never surfaced.
    pub fn remember(&mut self, id: EventId, sig: Signature) {
        if let Some((evicted, _)) = self.entries.push(id, sig) {
            if evicted != id {
                log::debug!("signature cache full, evicted {evicted}");
            }
        }
    }

    /// Recompute the event id, verify the signature, and remember the pair
    /// on success.
    pub fn verify(&mut self, event: &Event) -> Result<()> {
        event.verify()?;
        self.remember(event.id, event.sig);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }
}
