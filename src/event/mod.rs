//! Signed event model (NIP-01).
//!
//! An [`Event`] is immutable after signing: its `id` is the SHA-256 of the
//! canonical serialization `[0, pubkey, created_at, kind, tags, content]`
//! and `sig` is a BIP-340 Schnorr signature over the raw 32-byte id under
//! `pubkey`.

mod builder;
mod tag;
mod types;

pub use builder::EventBuilder;
pub use tag::Tag;
pub use types::{EventId, PublicKey, Signature, unix_now};

use std::sync::OnceLock;

use secp256k1::{Message, Secp256k1, VerifyOnly, XOnlyPublicKey, schnorr};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Well-known event kinds used by this crate.
pub mod kind {
    /// Profile metadata.
    pub const METADATA: u16 = 0;
    /// Plain text note.
    pub const TEXT_NOTE: u16 = 1;
    /// NIP-42 client authentication.
    pub const CLIENT_AUTH: u16 = 22242;
    /// Blossom blob-store HTTP authorization.
    pub const BLOB_AUTHORIZATION: u16 = 24242;
}

fn verifier() -> &'static Secp256k1<VerifyOnly> {
    static SECP: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::verification_only)
}

/// A signed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub pubkey: PublicKey,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: Signature,
}

impl Event {
    /// Derive the canonical id for the given event fields.
    ///
    /// The canonical form is the minimal JSON of
    /// `[0, pubkey, created_at, kind, tags, content]`: no insignificant
    /// whitespace, non-ASCII emitted verbatim, `/` unescaped.
    pub fn compute_id(
        pubkey: &PublicKey,
        created_at: u64,
        kind: u16,
        tags: &[Tag],
        content: &str,
    ) -> EventId {
        let canonical = serde_json::to_string(&(0u8, pubkey, created_at, kind, tags, content))
            .expect("event fields serialize to JSON");
        EventId::from_bytes(Sha256::digest(canonical.as_bytes()).into())
    }

    /// Check that `id` matches the hashed contents and that `sig` is a valid
    /// BIP-340 signature over `id` under `pubkey`.
    pub fn verify(&self) -> Result<()> {
        let expected = Self::compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        if expected != self.id {
            return Err(Error::InvalidEventId);
        }
        let message = Message::from_digest(self.id.to_bytes());
        let signature = schnorr::Signature::from_slice(&self.sig.to_bytes())
            .map_err(|_| Error::InvalidSignature)?;
        let xonly = XOnlyPublicKey::from_slice(&self.pubkey.to_bytes())
            .map_err(|_| Error::InvalidSignature)?;
        verifier()
            .verify_schnorr(&signature, &message, &xonly)
            .map_err(|_| Error::InvalidSignature)
    }

    /// Extract the values of every tag named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.name() == Some(name))
            .filter_map(|t| t.value())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::ProtocolFrame(format!("event: {e}")))
    }

    pub fn as_json(&self) -> String {
        serde_json::to_string(self).expect("event serializes to JSON")
    }
}
