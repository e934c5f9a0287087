//! Top-level coordinator: the set of relays, the shared verification
//! sampler, and the subscribe/publish fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::filter::Filter;
use crate::transport::{Transport, WsTransport};
use crate::verification::{VerificationConfig, VerificationSampler};

use super::connection::{Relay, ReconnectPolicy};
use super::subscription::{
    Subscription, SubscriptionCore, SubscriptionId, SubscriptionOptions, SubscriptionUpdate,
};
use super::{RelayStatus, RelayUrl};

/// Pool-wide happenings, observable without polling.
#[derive(Debug, Clone)]
pub enum PoolNotification {
    /// A verified (or verification-skipped) event was delivered.
    Event { relay: RelayUrl, event: Event },
    /// Human-readable notice from a relay.
    Notice { relay: RelayUrl, message: String },
    /// A relay's connection state changed.
    Status {
        relay: RelayUrl,
        status: RelayStatus,
    },
    /// A relay was caught lying and blacklisted.
    RelayBlacklisted { relay: RelayUrl },
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Signature sampling policy (used by [`RelayPool::new`]; a sampler
    /// passed to [`RelayPool::with_sampler`] carries its own).
    pub verification: VerificationConfig,
    /// How long to wait for a relay's OK after publishing.
    pub publish_timeout: Duration,
    /// Ring-buffer size of the pool notification channel.
    pub notification_buffer: usize,
    /// First reconnect delay; doubles up to `reconnect_max_delay`.
    pub reconnect_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Cap on a single transport connect attempt.
    pub connect_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            verification: VerificationConfig::default(),
            publish_timeout: Duration::from_secs(10),
            notification_buffer: 256,
            reconnect_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A client over many untrusted relays.
///
/// Logical subscriptions fan out to every relay; inbound events pass the
/// shared [`VerificationSampler`] and are deduplicated per subscription
/// before delivery. Publishes report per-relay results.
pub struct RelayPool {
    transport: Arc<dyn Transport>,
    sampler: Arc<VerificationSampler>,
    options: PoolOptions,
    relays: Mutex<HashMap<RelayUrl, Relay>>,
    subscriptions: Mutex<HashMap<SubscriptionId, Arc<SubscriptionCore>>>,
    notifications: broadcast::Sender<PoolNotification>,
    next_subscription: AtomicU64,
}

impl RelayPool {
    /// Pool with the WebSocket transport and a sampler built from
    /// `options.verification`.
    pub fn new(options: PoolOptions) -> Self {
        let sampler = VerificationSampler::new(options.verification.clone());
        Self::with_transport(Arc::new(WsTransport), sampler, options)
    }

    /// Pool with a caller-built sampler (custom ratio policy or callbacks).
    pub fn with_sampler(sampler: VerificationSampler, options: PoolOptions) -> Self {
        Self::with_transport(Arc::new(WsTransport), sampler, options)
    }

    /// Fully custom construction; tests inject an in-memory transport here.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        sampler: VerificationSampler,
        options: PoolOptions,
    ) -> Self {
        let (notifications, _) = broadcast::channel(options.notification_buffer.max(1));
        Self {
            transport,
            sampler: Arc::new(sampler),
            options,
            relays: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            notifications,
            next_subscription: AtomicU64::new(0),
        }
    }

    /// New receiver of pool notifications.
    pub fn notifications(&self) -> broadcast::Receiver<PoolNotification> {
        self.notifications.subscribe()
    }

    pub fn sampler(&self) -> &VerificationSampler {
        &self.sampler
    }

    /// Add a relay and register every live subscription on it. Idempotent
    /// per normalized URL.
    pub async fn add_relay(&self, url: &str) -> Result<RelayUrl> {
        let url = RelayUrl::parse(url)?;
        if self.sampler.is_blacklisted(&url) {
            return Err(Error::Rejected(format!("relay {url} is blacklisted")));
        }
        let relay = {
            let mut relays = lock(&self.relays);
            if relays.contains_key(&url) {
                return Ok(url);
            }
            let relay = Relay::spawn(
                url.clone(),
                self.transport.clone(),
                self.sampler.clone(),
                self.notifications.clone(),
                ReconnectPolicy {
                    initial_delay: self.options.reconnect_delay,
                    max_delay: self.options.reconnect_max_delay,
                    connect_timeout: self.options.connect_timeout,
                },
            );
            relays.insert(url.clone(), relay.clone());
            relay
        };
        let cores: Vec<Arc<SubscriptionCore>> = lock(&self.subscriptions)
            .values()
            .filter(|c| !c.is_closed())
            .cloned()
            .collect();
        for core in cores {
            core.add_expected_registration();
            if !relay.subscribe(core.clone()).await {
                core.registration_finished();
            }
        }
        Ok(url)
    }

    /// Disconnect a relay and forget it.
    pub async fn remove_relay(&self, url: &str) -> Result<()> {
        let url = RelayUrl::parse(url)?;
        let relay = lock(&self.relays).remove(&url);
        match relay {
            Some(relay) => {
                relay.disconnect().await;
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    /// Current relays and their connection states.
    pub fn relays(&self) -> HashMap<RelayUrl, RelayStatus> {
        lock(&self.relays)
            .iter()
            .map(|(url, relay)| (url.clone(), relay.status()))
            .collect()
    }

    /// Open a logical subscription on every relay, with a generated id.
    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
        options: SubscriptionOptions,
    ) -> Subscription {
        let n = self.next_subscription.fetch_add(1, Ordering::Relaxed) + 1;
        self.subscribe_with_id(format!("sub{n}"), filters, options)
            .await
    }

    /// Open a logical subscription under a caller-chosen stable id.
    /// Re-using a live id closes the previous subscription first.
    pub async fn subscribe_with_id(
        &self,
        id: impl Into<SubscriptionId>,
        filters: Vec<Filter>,
        options: SubscriptionOptions,
    ) -> Subscription {
        let id = id.into();
        let core = SubscriptionCore::new(id.clone(), filters, options);
        // Attach the sink before any relay can deliver.
        let handle = Subscription::new(core.clone());
        let previous = lock(&self.subscriptions).insert(id.clone(), core.clone());
        if let Some(previous) = previous {
            previous.close();
            for relay in self.relay_handles() {
                relay.unsubscribe(id.clone()).await;
            }
        }
        let relays = self.relay_handles();
        // Fix the fan-out count up front: one relay finishing early must not
        // complete the subscription while the others are still registering.
        core.set_expected_registrations(relays.len());
        for relay in relays {
            if !relay.subscribe(core.clone()).await {
                core.registration_finished();
            }
        }
        handle
    }

    /// Close a logical subscription everywhere. Idempotent.
    pub async fn unsubscribe(&self, id: &str) {
        let core = lock(&self.subscriptions).remove(id);
        if let Some(core) = core {
            core.close();
        }
        for relay in self.relay_handles() {
            relay.unsubscribe(id.to_string()).await;
        }
    }

    /// Publish an event to every relay and report per-relay results.
    ///
    /// A publish may be partially successful: each relay independently
    /// accepts, rejects, or times out.
    pub async fn publish(&self, event: Event) -> HashMap<RelayUrl, Result<()>> {
        let relays = self.relay_handles();
        let timeout = self.options.publish_timeout;
        let sends = relays.into_iter().map(|relay| {
            let event = event.clone();
            async move {
                let url = relay.url().clone();
                let outcome = match relay.publish(event).await {
                    Ok(ack) => match tokio::time::timeout(timeout, ack).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(_)) => Err(Error::Cancelled),
                        Err(_) => Err(Error::Timeout),
                    },
                    Err(e) => Err(e),
                };
                (url, outcome)
            }
        });
        futures::future::join_all(sends).await.into_iter().collect()
    }

    /// One-shot: collect stored events matching `filters` from every relay,
    /// deduplicated, until each relay signals EOSE or the timeout fires.
    pub async fn fetch_events(&self, filters: Vec<Filter>, timeout: Duration) -> Vec<Event> {
        let options = SubscriptionOptions {
            close_on_eose: true,
            replay_on_reconnect: false,
            ..SubscriptionOptions::default()
        };
        let mut subscription = self.subscribe(filters, options).await;
        let id = subscription.id().to_string();
        let deadline = tokio::time::Instant::now() + timeout;

        let mut events = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, subscription.recv()).await {
                Ok(Some(SubscriptionUpdate::Event { event, .. })) => events.push(event),
                Ok(Some(SubscriptionUpdate::EndOfStoredEvents { .. })) => {}
                Ok(Some(SubscriptionUpdate::Closed)) | Ok(None) => break,
                Err(_) => break,
            }
        }
        self.unsubscribe(&id).await;
        events
    }

    /// Disconnect every relay. Subscriptions stay registered and resume if
    /// relays are added again.
    pub async fn disconnect(&self) {
        let relays: Vec<Relay> = lock(&self.relays).drain().map(|(_, r)| r).collect();
        for relay in relays {
            relay.disconnect().await;
        }
    }

    fn relay_handles(&self) -> Vec<Relay> {
        lock(&self.relays).values().cloned().collect()
    }
}
