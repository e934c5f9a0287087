//! Starling SDK: a client for federated, signed-event publish/subscribe
//! networks (the Nostr protocol family) and the companion Blossom blob
//! store.
//!
//! The SDK connects to many untrusted relays in parallel, publishes signed
//! events, maintains long-lived filtered subscriptions, merges event
//! streams with deduplication, and protects the application from relays
//! that deliver events with invalid signatures by sampling Schnorr
//! verification across relays.

pub mod blossom;
pub mod error;
pub mod event;
pub mod filter;
pub mod keys;
pub mod message;
pub mod relay;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;
pub mod verification;

// Core types
pub use error::{Error, Result};
pub use event::{Event, EventBuilder, EventId, PublicKey, Signature, Tag, kind, unix_now};
pub use filter::Filter;
pub use keys::{Keys, Signer};
pub use message::{ClientMessage, RelayMessage, parse_relay_message};

// Relay pool
pub use relay::{
    PoolNotification, PoolOptions, Relay, RelayPool, RelayStatus, RelayUrl, Subscription,
    SubscriptionId, SubscriptionOptions, SubscriptionUpdate,
};

// Verification
pub use verification::{
    RelayStats, SignatureCache, Verification, VerificationConfig, VerificationSampler,
};

// Transport seam
pub use transport::{Transport, TransportSink, TransportStream, WsTransport};

// Blob store
pub use blossom::{
    BlobDescriptor, BlossomClient, ServerDescriptor, authorization_header, delete_authorization,
    list_authorization, upload_authorization,
};
