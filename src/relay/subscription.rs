//! Logical subscriptions (application-visible) and the filter-fingerprint
//! grouping that decides which of them may share a wire subscription.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use crate::event::{Event, EventId};
use crate::filter::Filter;

use super::RelayUrl;

pub type SubscriptionId = String;

/// Options of a logical subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    /// Tear the subscription down once every relay has signalled EOSE.
    pub close_on_eose: bool,
    /// Re-issue the subscription after a relay reconnects.
    pub replay_on_reconnect: bool,
    /// Ring-buffer size of the event sink. A slow consumer loses the oldest
    /// buffered updates, never blocks the relay tasks.
    pub buffer_size: usize,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            close_on_eose: false,
            replay_on_reconnect: true,
            buffer_size: 1024,
        }
    }
}

/// What a subscription sink yields.
#[derive(Debug, Clone)]
pub enum SubscriptionUpdate {
    /// A (deduplicated) event that matched the subscription's filters.
    Event { relay: RelayUrl, event: Event },
    /// One relay exhausted its stored events for this subscription.
    EndOfStoredEvents { relay: RelayUrl },
    /// Terminal: closed explicitly or by the `close_on_eose` contract.
    Closed,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared state of one logical subscription.
///
/// Owned by the pool; relay tasks hold weak-style `Arc` references keyed by
/// the subscription id, so removal is O(1) and never leaves a dangling wire
/// subscription.
pub(crate) struct SubscriptionCore {
    id: SubscriptionId,
    filters: Vec<Filter>,
    options: SubscriptionOptions,
    tx: broadcast::Sender<SubscriptionUpdate>,
    seen: Mutex<HashSet<EventId>>,
    closed: AtomicBool,
    /// Relays expected to serve this subscription. Set by the pool before
    /// any relay task sees the subscription.
    registrations: AtomicUsize,
    /// Registrations that reached EOSE or went away for good.
    finished: AtomicUsize,
    dropped: AtomicU64,
}

impl SubscriptionCore {
    pub fn new(id: SubscriptionId, filters: Vec<Filter>, options: SubscriptionOptions) -> Arc<Self> {
        let (tx, _) = broadcast::channel(options.buffer_size.max(1));
        Arc::new(Self {
            id,
            filters,
            options,
            tx,
            seen: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            registrations: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn options(&self) -> &SubscriptionOptions {
        &self.options
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<SubscriptionUpdate> {
        self.tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Evaluate the original (pre-merge) filters, dedup by event id across
    /// every relay serving this subscription, and push to the sink.
    pub fn deliver(&self, relay: &RelayUrl, event: &Event) {
        if self.is_closed() {
            return;
        }
        if !self.filters.iter().any(|f| f.matches(event)) {
            return;
        }
        if !lock(&self.seen).insert(event.id) {
            return;
        }
        let _ = self.tx.send(SubscriptionUpdate::Event {
            relay: relay.clone(),
            event: event.clone(),
        });
    }

    /// Forward one relay's EOSE to the sink.
    pub fn notify_eose(&self, relay: &RelayUrl) {
        if self.is_closed() {
            return;
        }
        let _ = self.tx.send(SubscriptionUpdate::EndOfStoredEvents {
            relay: relay.clone(),
        });
    }

    /// Fix the number of relays this subscription fans out to, before any
    /// of them is told about it. A fast relay finishing early must not be
    /// able to complete the subscription while siblings are still
    /// registering.
    pub fn set_expected_registrations(&self, n: usize) {
        self.registrations.store(n, Ordering::SeqCst);
    }

    /// A relay added to the pool after the subscription was opened.
    pub fn add_expected_registration(&self) {
        self.registrations.fetch_add(1, Ordering::SeqCst);
    }

    /// A registration ended: EOSE consumed it (`close_on_eose`), the relay
    /// refused it, or the relay is gone for good.
    pub fn registration_finished(&self) {
        let finished = self.finished.fetch_add(1, Ordering::SeqCst) + 1;
        let registered = self.registrations.load(Ordering::SeqCst);
        if self.options.close_on_eose && finished >= registered {
            self.close();
        }
    }

    /// Idempotent; promptly stops delivery and emits the terminal update.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(SubscriptionUpdate::Closed);
        }
    }

    pub fn record_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Application handle to a logical subscription.
pub struct Subscription {
    core: Arc<SubscriptionCore>,
    rx: broadcast::Receiver<SubscriptionUpdate>,
    terminated: bool,
}

impl Subscription {
    pub(crate) fn new(core: Arc<SubscriptionCore>) -> Self {
        let rx = core.subscribe_updates();
        Self {
            core,
            rx,
            terminated: false,
        }
    }

    pub fn id(&self) -> &str {
        self.core.id()
    }

    pub fn filters(&self) -> &[Filter] {
        self.core.filters()
    }

    /// Next update, or `None` once the subscription has closed.
    ///
    /// When the consumer falls behind, the oldest buffered updates are
    /// dropped and counted; delivery then resumes with the newest.
    pub async fn recv(&mut self) -> Option<SubscriptionUpdate> {
        if self.terminated {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(SubscriptionUpdate::Closed) => {
                    self.terminated = true;
                    return Some(SubscriptionUpdate::Closed);
                }
                Ok(update) => return Some(update),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.core.record_dropped(n);
                    log::warn!(
                        "subscription {} dropped {n} updates (slow consumer)",
                        self.core.id()
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.terminated = true;
                    return None;
                }
            }
        }
    }

    /// Stop delivery to this subscription. Prefer
    /// [`RelayPool::unsubscribe`](super::RelayPool::unsubscribe), which also
    /// tears down the wire subscriptions.
    pub fn close(&self) {
        self.core.close();
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Updates lost to backpressure so far.
    pub fn dropped(&self) -> u64 {
        self.core.dropped()
    }
}

// ---------------------------------------------------------------------------
// Filter fingerprint + merge
// ---------------------------------------------------------------------------

/// The equivalence class deciding which logical subscriptions may share a
/// wire subscription: the sorted union of `kinds` (or "unbounded" if any
/// filter leaves kinds open), the `close_on_eose` flag, and a has-limit bit.
///
/// Filters are never merged across kind sets or `close_on_eose` boundaries,
/// and a filter carrying a `limit` never merges with anything: limits are
/// subscription-specific and merging would change server semantics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct FilterFingerprint {
    kinds: Option<Vec<u16>>,
    close_on_eose: bool,
    has_limit: bool,
}

impl FilterFingerprint {
    pub fn of(filters: &[Filter], close_on_eose: bool) -> Self {
        let has_limit = filters.iter().any(|f| f.limit.is_some());
        let kinds = if filters.iter().any(|f| f.kinds.is_none()) {
            None
        } else {
            let union: BTreeSet<u16> = filters
                .iter()
                .flat_map(|f| f.kinds.iter().flatten().copied())
                .collect();
            Some(union.into_iter().collect())
        };
        Self {
            kinds,
            close_on_eose,
            has_limit,
        }
    }

    pub fn has_limit(&self) -> bool {
        self.has_limit
    }

    pub fn close_on_eose(&self) -> bool {
        self.close_on_eose
    }
}

/// Merge the filter lists of a fingerprint group into the wire filter list.
///
/// Filters with equal kind sets collapse into one: `ids`, `authors` and
/// per-tag value sets become unions (a side that leaves the attribute
/// unconstrained wins), `since` takes the maximum and `until` the minimum
/// across members, and `limit` is absent (the group would not have formed
/// otherwise).
pub(crate) fn merge_filter_lists<'a, I>(lists: I) -> Vec<Filter>
where
    I: IntoIterator<Item = &'a [Filter]>,
{
    let mut merged: Vec<Filter> = Vec::new();
    for list in lists {
        for filter in list {
            match merged.iter_mut().find(|m| m.kinds == filter.kinds) {
                Some(into) => merge_into(into, filter),
                None => {
                    let mut fresh = filter.clone();
                    fresh.limit = None;
                    merged.push(fresh);
                }
            }
        }
    }
    merged
}

fn union_sets<T: Ord + Clone>(
    a: Option<BTreeSet<T>>,
    b: Option<&BTreeSet<T>>,
) -> Option<BTreeSet<T>> {
    match (a, b) {
        (Some(mut a), Some(b)) => {
            a.extend(b.iter().cloned());
            Some(a)
        }
        _ => None,
    }
}

fn merge_into(into: &mut Filter, from: &Filter) {
    into.ids = union_sets(into.ids.take(), from.ids.as_ref());
    into.authors = union_sets(into.authors.take(), from.authors.as_ref());
    into.since = match (into.since, from.since) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    into.until = match (into.until, from.until) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    into.limit = None;
    // A tag key constrains the merge only when every member constrains it.
    let mut tags = BTreeMap::new();
    for (key, values) in std::mem::take(&mut into.tags) {
        if let Some(other) = from.tags.get(&key) {
            let mut union = values;
            union.extend(other.iter().cloned());
            tags.insert(key, union);
        }
    }
    into.tags = tags;
}
