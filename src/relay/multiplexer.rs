//! Per-relay subscription multiplexer.
//!
//! Groups logical subscriptions by filter fingerprint into wire
//! subscriptions, computes the merged wire filters, routes inbound events
//! and EOSE back to members, and replays wire subscriptions across
//! reconnects. Pure state machine: methods return the control frames to
//! transmit; the connection task owns the transport.

use std::collections::HashMap;
use std::sync::Arc;

use crate::filter::Filter;
use crate::message::ClientMessage;

use super::RelayUrl;
use super::subscription::{
    FilterFingerprint, SubscriptionCore, SubscriptionId, merge_filter_lists,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireState {
    Pending,
    Running,
}

struct WireSubscription {
    id: String,
    seq: u64,
    fingerprint: FilterFingerprint,
    members: Vec<SubscriptionId>,
    merged: Vec<Filter>,
    state: WireState,
}

struct MemberEntry {
    core: Arc<SubscriptionCore>,
    wire_id: String,
}

pub(crate) struct Multiplexer {
    relay: RelayUrl,
    connected: bool,
    next_seq: u64,
    wires: HashMap<String, WireSubscription>,
    /// Mergeable groups only; limit-carrying wire subscriptions never join.
    groups: HashMap<FilterFingerprint, String>,
    members: HashMap<SubscriptionId, MemberEntry>,
}

impl Multiplexer {
    pub fn new(relay: RelayUrl) -> Self {
        Self {
            relay,
            connected: false,
            next_seq: 0,
            wires: HashMap::new(),
            groups: HashMap::new(),
            members: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Register a logical subscription: join the wire group with the same
    /// fingerprint, or open a fresh pending wire subscription.
    pub fn register(&mut self, core: Arc<SubscriptionCore>) -> Vec<ClientMessage> {
        let id = core.id().to_string();
        if self.members.contains_key(&id) || core.is_closed() {
            return Vec::new();
        }
        let fingerprint = FilterFingerprint::of(core.filters(), core.options().close_on_eose);

        let joinable = if fingerprint.has_limit() {
            None
        } else {
            self.groups.get(&fingerprint).cloned()
        };

        match joinable {
            Some(wire_id) => {
                self.members.insert(
                    id.clone(),
                    MemberEntry {
                        core,
                        wire_id: wire_id.clone(),
                    },
                );
                if let Some(wire) = self.wires.get_mut(&wire_id) {
                    wire.members.push(id);
                }
                self.recompute_merged(&wire_id);
                if self.connected {
                    // Widening the union: re-issue REQ under the same wire id.
                    self.issue(&wire_id)
                } else {
                    Vec::new()
                }
            }
            None => {
                let wire_id = self.fresh_wire_id();
                let wire = WireSubscription {
                    id: wire_id.clone(),
                    seq: self.next_seq,
                    fingerprint: fingerprint.clone(),
                    members: vec![id.clone()],
                    merged: core.filters().to_vec(),
                    state: WireState::Pending,
                };
                self.members.insert(
                    id,
                    MemberEntry {
                        core,
                        wire_id: wire_id.clone(),
                    },
                );
                if !fingerprint.has_limit() {
                    self.groups.insert(fingerprint, wire_id.clone());
                }
                self.wires.insert(wire_id.clone(), wire);
                if self.connected { self.issue(&wire_id) } else { Vec::new() }
            }
        }
    }

    /// Detach a logical subscription. An emptied wire subscription is closed
    /// on the relay; a still-populated one keeps running with its existing
    /// (slightly over-wide) filters to avoid server-observable churn.
    pub fn remove(&mut self, id: &str) -> Vec<ClientMessage> {
        let Some(entry) = self.members.remove(id) else {
            return Vec::new();
        };
        entry.core.registration_finished();
        let wire_id = entry.wire_id;
        let Some(wire) = self.wires.get_mut(&wire_id) else {
            return Vec::new();
        };
        wire.members.retain(|m| m != id);
        if wire.members.is_empty() {
            let was_running = wire.state == WireState::Running;
            self.drop_wire(&wire_id);
            if self.connected && was_running {
                return vec![ClientMessage::Close {
                    subscription_id: wire_id,
                }];
            }
        } else {
            self.recompute_merged(&wire_id);
        }
        Vec::new()
    }

    /// Transport came up: evict members that opted out of replay, re-form
    /// their groups, and re-issue every pending wire subscription in
    /// insertion order under its original wire id.
    pub fn prepare_replay(&mut self) -> Vec<ClientMessage> {
        let evict: Vec<SubscriptionId> = self
            .members
            .iter()
            .filter(|(_, e)| !e.core.options().replay_on_reconnect || e.core.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        for id in evict {
            // Not connected yet, so no CLOSE frames are produced here.
            self.remove(&id);
        }
        self.connected = true;

        let mut pending: Vec<&WireSubscription> = self
            .wires
            .values()
            .filter(|w| w.state == WireState::Pending)
            .collect();
        pending.sort_by_key(|w| w.seq);
        let frames: Vec<ClientMessage> = pending
            .iter()
            .map(|w| ClientMessage::Req {
                subscription_id: w.id.clone(),
                filters: w.merged.clone(),
            })
            .collect();
        for wire in self.wires.values_mut() {
            wire.state = WireState::Running;
        }
        frames
    }

    /// Transport went down: preserve wire subscriptions for replay.
    pub fn on_disconnected(&mut self) {
        self.connected = false;
        for wire in self.wires.values_mut() {
            wire.state = WireState::Pending;
        }
    }

    /// Member cores of a wire subscription, for event delivery.
    pub fn route(&self, wire_id: &str) -> Vec<Arc<SubscriptionCore>> {
        let Some(wire) = self.wires.get(wire_id) else {
            return Vec::new();
        };
        wire.members
            .iter()
            .filter_map(|id| self.members.get(id))
            .map(|e| e.core.clone())
            .collect()
    }

    /// Relay flushed its stored events for a wire subscription: forward the
    /// signal to every member; a `close_on_eose` group is then closed and
    /// destroyed.
    pub fn handle_eose(&mut self, wire_id: &str) -> Vec<ClientMessage> {
        let Some(wire) = self.wires.get(wire_id) else {
            return Vec::new();
        };
        let member_ids = wire.members.clone();
        let close_group = wire.fingerprint.close_on_eose();

        for id in &member_ids {
            if let Some(entry) = self.members.get(id) {
                entry.core.notify_eose(&self.relay);
            }
        }
        if !close_group {
            return Vec::new();
        }
        for id in &member_ids {
            if let Some(entry) = self.members.remove(id) {
                entry.core.registration_finished();
            }
        }
        self.drop_wire(wire_id);
        if self.connected {
            vec![ClientMessage::Close {
                subscription_id: wire_id.to_string(),
            }]
        } else {
            Vec::new()
        }
    }

    /// Relay refused or tore down a wire subscription.
    pub fn handle_closed(&mut self, wire_id: &str, reason: &str) {
        let Some(wire) = self.wires.get(wire_id) else {
            return;
        };
        log::warn!(
            "relay {} closed subscription {wire_id}: {reason}",
            self.relay
        );
        let member_ids = wire.members.clone();
        for id in member_ids {
            if let Some(entry) = self.members.remove(&id) {
                entry.core.registration_finished();
            }
        }
        self.drop_wire(wire_id);
    }

    /// The relay is gone for good: finish every registration.
    pub fn terminate(&mut self) {
        for entry in self.members.values() {
            entry.core.registration_finished();
        }
        self.members.clear();
        self.wires.clear();
        self.groups.clear();
    }

    // --- internal ---

    fn fresh_wire_id(&mut self) -> String {
        self.next_seq += 1;
        format!("s{}", self.next_seq)
    }

    fn issue(&mut self, wire_id: &str) -> Vec<ClientMessage> {
        match self.wires.get_mut(wire_id) {
            Some(wire) => {
                wire.state = WireState::Running;
                vec![ClientMessage::Req {
                    subscription_id: wire.id.clone(),
                    filters: wire.merged.clone(),
                }]
            }
            None => Vec::new(),
        }
    }

    fn recompute_merged(&mut self, wire_id: &str) {
        let Some(wire) = self.wires.get(wire_id) else {
            return;
        };
        let merged = if wire.members.len() == 1 {
            self.members
                .get(&wire.members[0])
                .map(|e| e.core.filters().to_vec())
                .unwrap_or_default()
        } else {
            let lists: Vec<&[Filter]> = wire
                .members
                .iter()
                .filter_map(|id| self.members.get(id))
                .map(|e| e.core.filters())
                .collect();
            merge_filter_lists(lists)
        };
        if let Some(wire) = self.wires.get_mut(wire_id) {
            wire.merged = merged;
        }
    }

    fn drop_wire(&mut self, wire_id: &str) {
        if let Some(wire) = self.wires.remove(wire_id) {
            if self.groups.get(&wire.fingerprint).map(String::as_str) == Some(wire_id) {
                self.groups.remove(&wire.fingerprint);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PublicKey;
    use crate::filter::Filter;
    use crate::relay::subscription::SubscriptionOptions;

    fn relay() -> RelayUrl {
        RelayUrl::parse("wss://relay.example.com").unwrap()
    }

    fn core(
        id: &str,
        filters: Vec<Filter>,
        options: SubscriptionOptions,
    ) -> Arc<SubscriptionCore> {
        SubscriptionCore::new(id.to_string(), filters, options)
    }

    fn req_ids(frames: &[ClientMessage]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|f| match f {
                ClientMessage::Req {
                    subscription_id, ..
                } => Some(subscription_id.clone()),
                _ => None,
            })
            .collect()
    }

    fn author(byte: u8) -> PublicKey {
        PublicKey::from_bytes([byte; 32])
    }

    #[test]
    fn same_fingerprint_shares_one_wire_subscription() {
        let mut mux = Multiplexer::new(relay());
        mux.prepare_replay(); // connected, nothing to replay

        let frames = mux.register(core(
            "a",
            vec![Filter::new().kind(1).author(author(1))],
            SubscriptionOptions::default(),
        ));
        assert_eq!(req_ids(&frames), ["s1"]);

        let frames = mux.register(core(
            "b",
            vec![Filter::new().kind(1).author(author(2))],
            SubscriptionOptions::default(),
        ));
        // Joining the group re-issues the same wire id with the union.
        assert_eq!(req_ids(&frames), ["s1"]);
        match &frames[0] {
            ClientMessage::Req { filters, .. } => {
                assert_eq!(filters.len(), 1);
                let authors = filters[0].authors.as_ref().unwrap();
                assert_eq!(authors.len(), 2);
            }
            other => panic!("expected REQ, got {other:?}"),
        }
    }

    #[test]
    fn limit_forces_a_separate_wire_subscription() {
        let mut mux = Multiplexer::new(relay());
        mux.prepare_replay();

        mux.register(core(
            "a",
            vec![Filter::new().kind(1)],
            SubscriptionOptions::default(),
        ));
        let frames = mux.register(core(
            "c",
            vec![Filter::new().kind(1).limit(10)],
            SubscriptionOptions::default(),
        ));
        assert_eq!(req_ids(&frames), ["s2"]);
        // And the limit survives on its own wire.
        match &frames[0] {
            ClientMessage::Req { filters, .. } => assert_eq!(filters[0].limit, Some(10)),
            other => panic!("expected REQ, got {other:?}"),
        }
    }

    #[test]
    fn removal_of_last_member_closes_the_wire() {
        let mut mux = Multiplexer::new(relay());
        mux.prepare_replay();
        mux.register(core(
            "a",
            vec![Filter::new().kind(1)],
            SubscriptionOptions::default(),
        ));

        let frames = mux.remove("a");
        assert_eq!(
            frames,
            [ClientMessage::Close {
                subscription_id: "s1".to_string()
            }]
        );
        assert!(mux.is_empty());
    }

    #[test]
    fn removal_from_populated_group_sends_nothing() {
        let mut mux = Multiplexer::new(relay());
        mux.prepare_replay();
        mux.register(core(
            "a",
            vec![Filter::new().kind(1).author(author(1))],
            SubscriptionOptions::default(),
        ));
        mux.register(core(
            "b",
            vec![Filter::new().kind(1).author(author(2))],
            SubscriptionOptions::default(),
        ));

        // Policy: keep the over-wide subscription running, no churn.
        assert!(mux.remove("a").is_empty());
        assert_eq!(mux.route("s1").len(), 1);
    }

    #[test]
    fn eose_closes_a_close_on_eose_group() {
        let mut mux = Multiplexer::new(relay());
        mux.prepare_replay();
        let options = SubscriptionOptions {
            close_on_eose: true,
            ..SubscriptionOptions::default()
        };
        let c = core("a", vec![Filter::new().kind(1)], options);
        mux.register(c.clone());

        let frames = mux.handle_eose("s1");
        assert_eq!(
            frames,
            [ClientMessage::Close {
                subscription_id: "s1".to_string()
            }]
        );
        assert!(mux.is_empty());
        assert!(c.is_closed());
    }

    #[test]
    fn eose_keeps_persistent_groups_running() {
        let mut mux = Multiplexer::new(relay());
        mux.prepare_replay();
        let c = core(
            "a",
            vec![Filter::new().kind(1)],
            SubscriptionOptions::default(),
        );
        mux.register(c.clone());

        assert!(mux.handle_eose("s1").is_empty());
        assert!(!c.is_closed());
        assert_eq!(mux.route("s1").len(), 1);
    }

    #[test]
    fn reconnect_replays_same_wire_ids_in_insertion_order() {
        let mut mux = Multiplexer::new(relay());
        mux.prepare_replay();
        mux.register(core(
            "a",
            vec![Filter::new().kind(1)],
            SubscriptionOptions::default(),
        ));
        mux.register(core(
            "b",
            vec![Filter::new().kind(2)],
            SubscriptionOptions::default(),
        ));

        mux.on_disconnected();
        let frames = mux.prepare_replay();
        assert_eq!(req_ids(&frames), ["s1", "s2"]);
    }

    #[test]
    fn replay_evicts_non_replaying_members() {
        let mut mux = Multiplexer::new(relay());
        mux.prepare_replay();
        mux.register(core(
            "keep",
            vec![Filter::new().kind(1)],
            SubscriptionOptions::default(),
        ));
        mux.register(core(
            "drop",
            vec![Filter::new().kind(2)],
            SubscriptionOptions {
                replay_on_reconnect: false,
                ..SubscriptionOptions::default()
            },
        ));

        mux.on_disconnected();
        let frames = mux.prepare_replay();
        assert_eq!(req_ids(&frames), ["s1"]);
        assert!(mux.route("s2").is_empty());
    }

    #[test]
    fn closed_by_relay_finishes_members() {
        let mut mux = Multiplexer::new(relay());
        mux.prepare_replay();
        let options = SubscriptionOptions {
            close_on_eose: true,
            ..SubscriptionOptions::default()
        };
        let c = core("a", vec![Filter::new().kind(1)], options);
        mux.register(c.clone());

        mux.handle_closed("s1", "error: unsupported filter");
        assert!(mux.is_empty());
        // The registration ended without EOSE, which completes the
        // close_on_eose contract for this (single-relay) subscription.
        assert!(c.is_closed());
    }
}
