use crate::error::Result;
use crate::keys::Signer;

use super::tag::Tag;
use super::types::unix_now;
use super::Event;

/// Assembles the signable fields of an event, then derives the id and signs.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    kind: u16,
    content: String,
    tags: Vec<Tag>,
    created_at: Option<u64>,
}

impl EventBuilder {
    pub fn new(kind: u16, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            tags: Vec::new(),
            created_at: None,
        }
    }

    pub fn tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
        self.tags.extend(tags);
        self
    }

    /// Pin `created_at` instead of using the current time.
    pub fn created_at(mut self, timestamp: u64) -> Self {
        self.created_at = Some(timestamp);
        self
    }

    /// Derive the canonical id and produce a signed event.
    pub fn sign(self, signer: &dyn Signer) -> Result<Event> {
        let pubkey = signer.public_key();
        let created_at = self.created_at.unwrap_or_else(unix_now);
        let id = Event::compute_id(&pubkey, created_at, self.kind, &self.tags, &self.content);
        let sig = signer.sign_digest(&id.to_bytes())?;
        Ok(Event {
            id,
            pubkey,
            created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig,
        })
    }
}
