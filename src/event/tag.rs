use serde::{Deserialize, Serialize};

use super::types::{EventId, PublicKey};

/// An ordered sequence of strings; the first element is the tag name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(Vec<String>);

impl Tag {
    /// Build a tag from raw parts.
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(values.into_iter().map(Into::into).collect())
    }

    /// `["e", <event id hex>]`
    pub fn event(id: EventId) -> Self {
        Self(vec!["e".to_string(), id.to_hex()])
    }

    /// `["p", <pubkey hex>]`
    pub fn pubkey(pk: PublicKey) -> Self {
        Self(vec!["p".to_string(), pk.to_hex()])
    }

    /// `["t", <hashtag>]`
    pub fn hashtag(value: impl Into<String>) -> Self {
        Self(vec!["t".to_string(), value.into()])
    }

    /// `["d", <identifier>]`
    pub fn identifier(value: impl Into<String>) -> Self {
        Self(vec!["d".to_string(), value.into()])
    }

    /// Tag name, if the tag is non-empty.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First value after the name.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}
