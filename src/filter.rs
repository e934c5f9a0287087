//! Server-side event predicates (NIP-01 filters) and client-side matching.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::event::{Event, EventId, PublicKey};

/// A predicate over events. An event matches iff every specified attribute
/// matches. `limit` is a hint to the server and never participates in
/// client-side matching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<BTreeSet<EventId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<BTreeSet<PublicKey>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<BTreeSet<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Tag filters keyed by their wire name (`"#e"`, `"#p"`, ...).
    #[serde(flatten)]
    pub tags: BTreeMap<String, BTreeSet<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: EventId) -> Self {
        self.ids.get_or_insert_with(BTreeSet::new).insert(id);
        self
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = EventId>) -> Self {
        self.ids.get_or_insert_with(BTreeSet::new).extend(ids);
        self
    }

    pub fn author(mut self, author: PublicKey) -> Self {
        self.authors.get_or_insert_with(BTreeSet::new).insert(author);
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = PublicKey>) -> Self {
        self.authors.get_or_insert_with(BTreeSet::new).extend(authors);
        self
    }

    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.get_or_insert_with(BTreeSet::new).insert(kind);
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds.get_or_insert_with(BTreeSet::new).extend(kinds);
        self
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Accept events carrying a tag `letter` whose value is in the given set.
    pub fn custom_tag<I, S>(mut self, letter: char, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(format!("#{letter}"))
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// `#t` shorthand.
    pub fn hashtag(self, value: impl Into<String>) -> Self {
        self.custom_tag('t', [value.into()])
    }

    /// `#e` shorthand.
    pub fn event(self, id: EventId) -> Self {
        self.custom_tag('e', [id.to_hex()])
    }

    /// `#p` shorthand.
    pub fn pubkey(self, pk: PublicKey) -> Self {
        self.custom_tag('p', [pk.to_hex()])
    }

    /// Client-side match: every specified attribute must hold.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (key, accepted) in &self.tags {
            let Some(name) = key.strip_prefix('#') else {
                continue;
            };
            let found = event
                .tags
                .iter()
                .filter(|t| t.name() == Some(name))
                .filter_map(|t| t.value())
                .any(|v| accepted.contains(v));
            if !found {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventBuilder, Tag, kind};
    use crate::keys::Keys;

    fn tagged_note(keys: &Keys, created_at: u64, tags: Vec<Tag>) -> Event {
        EventBuilder::new(kind::TEXT_NOTE, "note")
            .created_at(created_at)
            .tags(tags)
            .sign(keys)
            .unwrap()
    }

    #[test]
    fn empty_filter_matches_everything() {
        let keys = Keys::generate();
        let event = tagged_note(&keys, 100, vec![]);
        assert!(Filter::new().matches(&event));
    }

    #[test]
    fn kind_and_author_must_both_match() {
        let keys = Keys::generate();
        let event = tagged_note(&keys, 100, vec![]);

        assert!(Filter::new().kind(1).author(keys.public_key()).matches(&event));
        assert!(!Filter::new().kind(2).author(keys.public_key()).matches(&event));
        assert!(
            !Filter::new()
                .kind(1)
                .author(Keys::generate().public_key())
                .matches(&event)
        );
    }

    #[test]
    fn created_at_range_is_inclusive() {
        let keys = Keys::generate();
        let event = tagged_note(&keys, 1000, vec![]);

        assert!(Filter::new().since(1000).matches(&event));
        assert!(Filter::new().until(1000).matches(&event));
        assert!(!Filter::new().since(1001).matches(&event));
        assert!(!Filter::new().until(999).matches(&event));
    }

    #[test]
    fn tag_match_requires_membership() {
        let keys = Keys::generate();
        let event = tagged_note(&keys, 100, vec![Tag::hashtag("rust"), Tag::hashtag("nostr")]);

        assert!(Filter::new().hashtag("rust").matches(&event));
        assert!(
            Filter::new()
                .custom_tag('t', ["go", "nostr"])
                .matches(&event)
        );
        assert!(!Filter::new().hashtag("zig").matches(&event));
        // No "e" tags on the event at all.
        assert!(
            !Filter::new()
                .event(EventId::from_bytes([0x22; 32]))
                .matches(&event)
        );
    }

    #[test]
    fn limit_does_not_affect_matching() {
        let keys = Keys::generate();
        let event = tagged_note(&keys, 100, vec![]);
        assert!(Filter::new().limit(0).matches(&event));
    }

    #[test]
    fn wire_form_uses_hash_prefixed_tag_keys() {
        let filter = Filter::new()
            .kind(1)
            .hashtag("starling")
            .since(1000)
            .limit(10);
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json["kinds"], serde_json::json!([1]));
        assert_eq!(json["#t"], serde_json::json!(["starling"]));
        assert_eq!(json["since"], serde_json::json!(1000));
        assert_eq!(json["limit"], serde_json::json!(10));
        assert!(json.get("ids").is_none());

        let parsed: Filter = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, filter);
    }
}
