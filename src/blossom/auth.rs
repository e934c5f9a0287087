//! Time-bound signed authorization events (kind 24242) for the blob store.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::Result;
use crate::event::{Event, EventBuilder, Tag, kind};
use crate::keys::Signer;

/// Authorization for uploading a blob of `size` bytes with the given hash.
pub fn upload_authorization(
    signer: &dyn Signer,
    sha256_hex: &str,
    size: u64,
    mime: Option<&str>,
    expiration: Option<u64>,
) -> Result<Event> {
    let mut builder = EventBuilder::new(kind::BLOB_AUTHORIZATION, "Upload blob")
        .tag(Tag::new(["t", "upload"]))
        .tag(Tag::new(["x", sha256_hex]))
        .tag(Tag::new(["size".to_string(), size.to_string()]));
    if let Some(mime) = mime {
        builder = builder.tag(Tag::new(["type", mime]));
    }
    if let Some(expiration) = expiration {
        builder = builder.tag(Tag::new(["expiration".to_string(), expiration.to_string()]));
    }
    builder.sign(signer)
}

/// Authorization for deleting the blob with the given hash.
pub fn delete_authorization(signer: &dyn Signer, sha256_hex: &str) -> Result<Event> {
    EventBuilder::new(kind::BLOB_AUTHORIZATION, "Delete blob")
        .tag(Tag::new(["t", "delete"]))
        .tag(Tag::new(["x", sha256_hex]))
        .sign(signer)
}

/// Authorization for listing the signer's blobs.
pub fn list_authorization(
    signer: &dyn Signer,
    since: Option<u64>,
    until: Option<u64>,
) -> Result<Event> {
    let mut builder =
        EventBuilder::new(kind::BLOB_AUTHORIZATION, "List blobs").tag(Tag::new(["t", "list"]));
    if let Some(since) = since {
        builder = builder.tag(Tag::new(["since".to_string(), since.to_string()]));
    }
    if let Some(until) = until {
        builder = builder.tag(Tag::new(["until".to_string(), until.to_string()]));
    }
    builder.sign(signer)
}

/// `Authorization` header value: `Nostr <base64(event json)>`.
pub fn authorization_header(event: &Event) -> String {
    format!("Nostr {}", BASE64.encode(event.as_json()))
}
