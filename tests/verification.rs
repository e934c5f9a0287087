use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use starling_sdk::testing::{MemoryTransport, ServerEnd, forged_note, text_note};
use starling_sdk::{
    Error, Filter, Keys, PoolNotification, PoolOptions, RelayPool, RelayStatus,
    SubscriptionOptions, SubscriptionUpdate, VerificationConfig, VerificationSampler,
};
use tokio::sync::mpsc;

fn pool_options() -> PoolOptions {
    PoolOptions {
        publish_timeout: Duration::from_millis(500),
        reconnect_delay: Duration::from_millis(10),
        reconnect_max_delay: Duration::from_millis(50),
        ..PoolOptions::default()
    }
}

async fn accept_connection(accept: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    tokio::time::timeout(Duration::from_secs(5), accept.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("transport dropped")
}

async fn expect_notification<F>(
    notifications: &mut tokio::sync::broadcast::Receiver<PoolNotification>,
    mut predicate: F,
) -> PoolNotification
where
    F: FnMut(&PoolNotification) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let notification = notifications.recv().await.expect("notification stream");
            if predicate(&notification) {
                return notification;
            }
        }
    })
    .await
    .expect("timed out waiting for a notification")
}

#[tokio::test]
async fn evil_relay_is_blacklisted_and_disconnected() {
    let (transport, mut accept) = MemoryTransport::new();
    let invalid_seen = Arc::new(AtomicUsize::new(0));
    let sampler = VerificationSampler::new(VerificationConfig::default()).on_invalid_signature({
        let invalid_seen = invalid_seen.clone();
        move |_, _| {
            invalid_seen.fetch_add(1, Ordering::SeqCst);
        }
    });
    let pool = RelayPool::with_transport(transport, sampler, pool_options());
    let mut notifications = pool.notifications();

    let url = pool.add_relay("ws://evil.test").await.unwrap();
    let mut server = accept_connection(&mut accept).await;

    let mut sub = pool
        .subscribe(vec![Filter::new().kind(1)], SubscriptionOptions::default())
        .await;
    let (wire, _) = server.expect_req().await;

    let keys = Keys::generate();
    server.send_event(&wire, &forged_note(&keys, "lying"));

    expect_notification(&mut notifications, |n| {
        matches!(n, PoolNotification::RelayBlacklisted { .. })
    })
    .await;
    expect_notification(&mut notifications, |n| {
        matches!(
            n,
            PoolNotification::Status {
                status: RelayStatus::Terminated,
                ..
            }
        )
    })
    .await;

    assert_eq!(invalid_seen.load(Ordering::SeqCst), 1);
    assert!(pool.sampler().is_blacklisted(&url));
    assert_eq!(pool.sampler().stats(&url).unwrap().invalid, 1);

    // The forged event never reached the subscriber.
    let delivery = tokio::time::timeout(Duration::from_millis(200), sub.recv()).await;
    assert!(delivery.is_err(), "forged event was delivered: {delivery:?}");

    // A blacklisted relay cannot be re-added.
    assert!(matches!(
        pool.add_relay("ws://evil.test").await,
        Err(Error::Rejected(_))
    ));
}

#[tokio::test]
async fn malformed_event_frames_count_as_invalid_signatures() {
    let (transport, mut accept) = MemoryTransport::new();
    let pool = RelayPool::with_transport(
        transport,
        VerificationSampler::new(VerificationConfig::default()),
        pool_options(),
    );
    let mut notifications = pool.notifications();
    let url = pool.add_relay("ws://garbled.test").await.unwrap();
    let server = accept_connection(&mut accept).await;

    server.send_raw("[\"EVENT\",\"w1\",{\"id\":\"bogus\"}]");

    expect_notification(&mut notifications, |n| {
        matches!(n, PoolNotification::RelayBlacklisted { .. })
    })
    .await;
    assert!(pool.sampler().is_blacklisted(&url));
}

#[tokio::test]
async fn cross_relay_redundancy_amortizes_verification() {
    let (transport, mut accept) = MemoryTransport::new();
    let pool = RelayPool::with_transport(
        transport,
        VerificationSampler::new(VerificationConfig::default()),
        pool_options(),
    );
    let urls = [
        pool.add_relay("ws://relay-one.test").await.unwrap(),
        pool.add_relay("ws://relay-two.test").await.unwrap(),
        pool.add_relay("ws://relay-three.test").await.unwrap(),
    ];
    let mut servers = Vec::new();
    for _ in 0..3 {
        servers.push(accept_connection(&mut accept).await);
    }

    let mut sub = pool
        .subscribe(vec![Filter::new().kind(1)], SubscriptionOptions::default())
        .await;
    let mut wires = Vec::new();
    for server in &mut servers {
        wires.push(server.expect_req().await.0);
    }

    let keys = Keys::generate();
    let event = text_note(&keys, "popular");

    // First relay pays for the one Schnorr verification...
    servers[0].send_event(&wires[0], &event);
    assert!(matches!(
        sub.recv().await,
        Some(SubscriptionUpdate::Event { .. })
    ));

    // ...the other two hit the shared cache.
    servers[1].send_event(&wires[1], &event);
    servers[2].send_event(&wires[2], &event);
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let all_validated = urls
                .iter()
                .all(|u| pool.sampler().stats(u).is_some_and(|s| s.validated == 1));
            if all_validated {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("relays never recorded the cached event");

    assert_eq!(pool.sampler().verification_count(), 1);

    // Still exactly one delivery.
    let duplicate = tokio::time::timeout(Duration::from_millis(200), sub.recv()).await;
    assert!(duplicate.is_err());
}

#[tokio::test]
async fn skipped_verification_still_delivers_by_default() {
    let (transport, mut accept) = MemoryTransport::new();
    let pool = RelayPool::with_transport(
        transport,
        VerificationSampler::new(VerificationConfig {
            initial_ratio: 0.0,
            lowest_ratio: 0.0,
            ..VerificationConfig::default()
        }),
        pool_options(),
    );
    let url = pool.add_relay("ws://relay-one.test").await.unwrap();
    let mut server = accept_connection(&mut accept).await;

    let mut sub = pool
        .subscribe(vec![Filter::new().kind(1)], SubscriptionOptions::default())
        .await;
    let (wire, _) = server.expect_req().await;

    let keys = Keys::generate();
    server.send_event(&wire, &text_note(&keys, "unchecked"));

    assert!(matches!(
        sub.recv().await,
        Some(SubscriptionUpdate::Event { .. })
    ));
    assert_eq!(pool.sampler().verification_count(), 0);
    let stats = pool.sampler().stats(&url).unwrap();
    assert_eq!(stats.non_validated, 1);
    assert_eq!(stats.validated, 0);
}

#[tokio::test]
async fn strict_mode_holds_events_until_another_relay_corroborates() {
    let (transport, mut accept) = MemoryTransport::new();
    let pool = RelayPool::with_transport(
        transport,
        VerificationSampler::new(VerificationConfig {
            initial_ratio: 0.0,
            lowest_ratio: 0.0,
            strict: true,
            ..VerificationConfig::default()
        }),
        pool_options(),
    );
    pool.add_relay("ws://relay-one.test").await.unwrap();
    pool.add_relay("ws://relay-two.test").await.unwrap();
    let mut r1 = accept_connection(&mut accept).await;
    let mut r2 = accept_connection(&mut accept).await;

    let mut sub = pool
        .subscribe(vec![Filter::new().kind(1)], SubscriptionOptions::default())
        .await;
    let (w1, _) = r1.expect_req().await;
    let (w2, _) = r2.expect_req().await;

    let keys = Keys::generate();
    let event = text_note(&keys, "held");

    // First sighting is withheld.
    r1.send_event(&w1, &event);
    let held = tokio::time::timeout(Duration::from_millis(200), sub.recv()).await;
    assert!(held.is_err(), "uncorroborated event was delivered");

    // A second relay corroborates: one forced verification, then delivery.
    r2.send_event(&w2, &event);
    match sub.recv().await.expect("corroborated delivery") {
        SubscriptionUpdate::Event {
            event: received, ..
        } => assert_eq!(received, event),
        other => panic!("expected an event, got {other:?}"),
    }
    assert_eq!(pool.sampler().verification_count(), 1);
}
