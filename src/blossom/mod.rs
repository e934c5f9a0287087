//! Companion content-addressed blob store (Blossom).
//!
//! Blobs are addressed by the SHA-256 of their bytes; mutating operations
//! are authorized by signed kind-24242 events carried in the
//! `Authorization` HTTP header.

mod auth;
mod client;

pub use auth::{
    authorization_header, delete_authorization, list_authorization, upload_authorization,
};
pub use client::BlossomClient;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Discovery document path.
pub const WELL_KNOWN_PATH: &str = ".well-known/blossom";

/// Lower-case hex SHA-256 of a byte string.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Server self-description served at [`WELL_KNOWN_PATH`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepts_mime_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_upload_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror_url: Option<String>,
}

/// What the server knows about one stored blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobDescriptor {
    pub url: String,
    pub sha256: String,
    pub size: u64,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default)]
    pub uploaded: u64,
}
