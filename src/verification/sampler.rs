use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use lru::LruCache;
use rand::Rng;

use crate::event::{Event, EventId, Signature};
use crate::relay::RelayUrl;

use super::cache::{DEFAULT_CACHE_CAPACITY, SignatureCache};

/// Validations before the adaptive ratio starts decaying.
const WARMUP_VALIDATIONS: u64 = 10;

/// Decay constant of the default ratio policy.
const RATIO_DECAY: f64 = 0.01;

/// Outcome of considering one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// Schnorr-verified just now.
    Valid,
    /// Hash or signature mismatch, or the relay is blacklisted.
    Invalid,
    /// The Bernoulli sample chose not to verify.
    Skipped,
    /// The shared cache attests a prior verification of this `(id, sig)`.
    Cached,
}

/// Sampling policy knobs.
#[derive(Debug, Clone)]
pub struct VerificationConfig {
    /// Starting and warm-up verification probability.
    pub initial_ratio: f64,
    /// Floor of the adaptive ratio. Setting both ratios to 0 disables
    /// verification entirely.
    pub lowest_ratio: f64,
    /// Blacklist and disconnect a relay on its first invalid signature.
    pub auto_blacklist: bool,
    /// Capacity of the shared signature cache.
    pub cache_capacity: usize,
    /// Hold skipped events until another relay delivers the same
    /// `(id, sig)`, then force one verification.
    pub strict: bool,
    /// Deliver events whose verification was skipped. Sampling is a cost
    /// amortization, not a gate; ignored (events held) in strict mode.
    pub deliver_on_skip: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            initial_ratio: 1.0,
            lowest_ratio: 0.1,
            auto_blacklist: true,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            strict: false,
            deliver_on_skip: true,
        }
    }
}

/// Per-relay signature statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayStats {
    pub validated: u64,
    pub non_validated: u64,
    pub invalid: u64,
    pub current_ratio: f64,
}

type RatioFn = dyn Fn(&RelayUrl, u64, u64) -> f64 + Send + Sync;
type InvalidSignatureFn = dyn Fn(&Event, &RelayUrl) + Send + Sync;
type RelayBlacklistedFn = dyn Fn(&RelayUrl) + Send + Sync;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decides per event whether to verify, tracks per-relay trust, and
/// blacklists relays caught delivering invalid signatures.
///
/// Shared by every relay task of a pool; all state is interior-mutable and
/// serialized per owner (cache, stats, blacklist, sightings).
pub struct VerificationSampler {
    config: VerificationConfig,
    ratio_fn: Option<Box<RatioFn>>,
    on_invalid_signature: Option<Box<InvalidSignatureFn>>,
    on_relay_blacklisted: Option<Box<RelayBlacklistedFn>>,
    cache: Mutex<SignatureCache>,
    stats: Mutex<HashMap<RelayUrl, RelayStats>>,
    blacklist: RwLock<HashSet<RelayUrl>>,
    /// Strict mode: first sighting of a skipped `(id, sig)` per relay.
    sightings: Mutex<LruCache<(EventId, Signature), RelayUrl>>,
    schnorr_verifications: AtomicU64,
}

impl VerificationSampler {
    pub fn new(config: VerificationConfig) -> Self {
        let cache = SignatureCache::new(config.cache_capacity);
        let sightings_capacity =
            NonZeroUsize::new(config.cache_capacity.max(1)).expect("non-zero capacity");
        Self {
            config,
            ratio_fn: None,
            on_invalid_signature: None,
            on_relay_blacklisted: None,
            cache: Mutex::new(cache),
            stats: Mutex::new(HashMap::new()),
            blacklist: RwLock::new(HashSet::new()),
            sightings: Mutex::new(LruCache::new(sightings_capacity)),
            schnorr_verifications: AtomicU64::new(0),
        }
    }

    /// Replace the default ratio policy. The returned value is clamped to
    /// `[0, 1]` by the sampler.
    pub fn ratio_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&RelayUrl, u64, u64) -> f64 + Send + Sync + 'static,
    {
        self.ratio_fn = Some(Box::new(f));
        self
    }

    /// Invoked with `(event, relay)` when a relay delivers an event whose
    /// signature fails verification.
    pub fn on_invalid_signature<F>(mut self, f: F) -> Self
    where
        F: Fn(&Event, &RelayUrl) + Send + Sync + 'static,
    {
        self.on_invalid_signature = Some(Box::new(f));
        self
    }

    /// Invoked when a relay is added to the blacklist.
    pub fn on_relay_blacklisted<F>(mut self, f: F) -> Self
    where
        F: Fn(&RelayUrl) + Send + Sync + 'static,
    {
        self.on_relay_blacklisted = Some(Box::new(f));
        self
    }

    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    /// Consider one inbound event from `relay` and emit a verdict.
    pub fn inspect(&self, relay: &RelayUrl, event: &Event) -> Verification {
        if self.is_blacklisted(relay) {
            return Verification::Invalid;
        }

        if lock(&self.cache).is_verified(&event.id, &event.sig) {
            // Attested elsewhere already; counts as validated for this relay
            // but does not touch the adaptive ratio.
            self.record_cached(relay);
            return Verification::Cached;
        }

        let ratio = self.current_ratio(relay).clamp(0.0, 1.0);
        if !rand::thread_rng().gen_bool(ratio) {
            if self.config.strict && self.corroborated(relay, event) {
                return self.verify_now(relay, event);
            }
            self.record_skipped(relay);
            return Verification::Skipped;
        }

        self.verify_now(relay, event)
    }

    /// Verify immediately, bypassing the sampling decision. The way out of
    /// strict mode's hold when no second relay ever corroborates.
    pub fn force_verify(&self, relay: &RelayUrl, event: &Event) -> Verification {
        if self.is_blacklisted(relay) {
            return Verification::Invalid;
        }
        if lock(&self.cache).is_verified(&event.id, &event.sig) {
            self.record_cached(relay);
            return Verification::Cached;
        }
        self.verify_now(relay, event)
    }

    /// Whether the multiplexer should hand the event to subscribers.
    pub fn should_deliver(&self, verdict: Verification) -> bool {
        match verdict {
            Verification::Valid | Verification::Cached => true,
            Verification::Skipped => self.config.deliver_on_skip && !self.config.strict,
            Verification::Invalid => false,
        }
    }

    /// A relay sent a frame that claims an event but does not parse. Treated
    /// exactly like an invalid signature for trust purposes; there is no
    /// event value to hand the invalid-signature callback.
    ///
    /// Returns true if the relay is (now) blacklisted.
    pub fn record_malformed(&self, relay: &RelayUrl) -> bool {
        log::warn!("relay {relay} sent a malformed event frame");
        lock(&self.stats)
            .entry(relay.clone())
            .or_insert_with(|| self.fresh_stats())
            .invalid += 1;
        if self.config.auto_blacklist {
            self.blacklist(relay);
        }
        self.is_blacklisted(relay)
    }

    /// Add a relay to the blacklist. Idempotent; fires the callback once.
    pub fn blacklist(&self, relay: &RelayUrl) {
        let inserted = self
            .blacklist
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(relay.clone());
        if inserted {
            log::warn!("relay {relay} blacklisted");
            if let Some(cb) = &self.on_relay_blacklisted {
                cb(relay);
            }
        }
    }

    pub fn is_blacklisted(&self, relay: &RelayUrl) -> bool {
        self.blacklist
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(relay)
    }

    pub fn blacklisted_relays(&self) -> Vec<RelayUrl> {
        self.blacklist
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Stats snapshot for one relay, if it has been seen.
    pub fn stats(&self, relay: &RelayUrl) -> Option<RelayStats> {
        lock(&self.stats).get(relay).cloned()
    }

    /// Total Schnorr verifications performed since construction.
    pub fn verification_count(&self) -> u64 {
        self.schnorr_verifications.load(Ordering::Relaxed)
    }

    pub fn cache_len(&self) -> usize {
        lock(&self.cache).len()
    }

    pub fn clear_cache(&self) {
        lock(&self.cache).clear();
    }

    // --- internal ---

    fn fresh_stats(&self) -> RelayStats {
        RelayStats {
            current_ratio: self.config.initial_ratio,
            ..RelayStats::default()
        }
    }

    fn current_ratio(&self, relay: &RelayUrl) -> f64 {
        lock(&self.stats)
            .get(relay)
            .map(|s| s.current_ratio)
            .unwrap_or(self.config.initial_ratio)
    }

    fn verify_now(&self, relay: &RelayUrl, event: &Event) -> Verification {
        self.schnorr_verifications.fetch_add(1, Ordering::Relaxed);
        let outcome = lock(&self.cache).verify(event);
        match outcome {
            Ok(()) => {
                self.record_verified(relay);
                Verification::Valid
            }
            Err(e) => {
                log::warn!("relay {relay} delivered event {} that fails verification: {e}", event.id);
                self.record_invalid(relay, event);
                Verification::Invalid
            }
        }
    }

    /// Strict mode: true when a *different* relay has already shown us this
    /// `(id, sig)`, which is the cue to pay for one real verification.
    fn corroborated(&self, relay: &RelayUrl, event: &Event) -> bool {
        let key = (event.id, event.sig);
        let mut sightings = lock(&self.sightings);
        match sightings.get(&key) {
            Some(first) if first != relay => {
                sightings.pop(&key);
                true
            }
            Some(_) => false,
            None => {
                sightings.push(key, relay.clone());
                false
            }
        }
    }

    fn record_cached(&self, relay: &RelayUrl) {
        let mut stats = lock(&self.stats);
        let entry = stats
            .entry(relay.clone())
            .or_insert_with(|| self.fresh_stats());
        entry.validated += 1;
    }

    fn record_verified(&self, relay: &RelayUrl) {
        let mut stats = lock(&self.stats);
        let entry = stats
            .entry(relay.clone())
            .or_insert_with(|| self.fresh_stats());
        entry.validated += 1;
        self.update_ratio(relay, entry);
    }

    fn record_skipped(&self, relay: &RelayUrl) {
        let mut stats = lock(&self.stats);
        let entry = stats
            .entry(relay.clone())
            .or_insert_with(|| self.fresh_stats());
        entry.non_validated += 1;
        self.update_ratio(relay, entry);
    }

    fn record_invalid(&self, relay: &RelayUrl, event: &Event) {
        {
            let mut stats = lock(&self.stats);
            stats
                .entry(relay.clone())
                .or_insert_with(|| self.fresh_stats())
                .invalid += 1;
        }
        if let Some(cb) = &self.on_invalid_signature {
            cb(event, relay);
        }
        if self.config.auto_blacklist {
            self.blacklist(relay);
        }
    }

    fn update_ratio(&self, relay: &RelayUrl, entry: &mut RelayStats) {
        entry.current_ratio = match &self.ratio_fn {
            Some(f) => f(relay, entry.validated, entry.non_validated).clamp(0.0, 1.0),
            None => default_ratio(&self.config, entry.validated),
        };
    }
}

/// Default adaptive policy: hold `initial_ratio` through warm-up, then decay
/// exponentially in the number of validated events, floored at
/// `lowest_ratio`.
fn default_ratio(config: &VerificationConfig, validated: u64) -> f64 {
    if validated < WARMUP_VALIDATIONS {
        config.initial_ratio
    } else {
        (config.initial_ratio * (-RATIO_DECAY * validated as f64).exp()).max(config.lowest_ratio)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::event::{EventBuilder, kind};
    use crate::keys::Keys;

    fn relay(n: u8) -> RelayUrl {
        RelayUrl::parse(&format!("wss://relay{n}.example.com")).unwrap()
    }

    fn note(keys: &Keys, n: u64) -> Event {
        EventBuilder::new(kind::TEXT_NOTE, format!("note {n}"))
            .created_at(1_700_000_000 + n)
            .sign(keys)
            .unwrap()
    }

    fn evil_note(keys: &Keys, n: u64) -> Event {
        let mut event = note(keys, n);
        let mut bytes = event.sig.to_bytes();
        bytes[0] ^= 0x01;
        event.sig = Signature::from_bytes(bytes);
        event
    }

    #[test]
    fn warmup_holds_initial_ratio() {
        let sampler = VerificationSampler::new(VerificationConfig::default());
        let keys = Keys::generate();
        let r = relay(1);
        for n in 0..WARMUP_VALIDATIONS - 1 {
            assert_eq!(sampler.inspect(&r, &note(&keys, n)), Verification::Valid);
            assert_eq!(sampler.stats(&r).unwrap().current_ratio, 1.0);
        }
    }

    #[test]
    fn ratio_decays_after_warmup() {
        let config = VerificationConfig::default();
        let sampler = VerificationSampler::new(config.clone());
        let keys = Keys::generate();
        let r = relay(1);
        let n = 25u64;
        for i in 0..n {
            assert_eq!(
                sampler.force_verify(&r, &note(&keys, i)),
                Verification::Valid
            );
        }
        let stats = sampler.stats(&r).unwrap();
        assert_eq!(stats.validated, n);
        let expected =
            (config.initial_ratio * (-RATIO_DECAY * n as f64).exp()).max(config.lowest_ratio);
        assert_eq!(stats.current_ratio, expected);
    }

    #[test]
    fn ratio_never_drops_below_floor() {
        let sampler = VerificationSampler::new(VerificationConfig {
            lowest_ratio: 0.5,
            ..VerificationConfig::default()
        });
        let keys = Keys::generate();
        let r = relay(1);
        // exp(-0.01 * 200) ≈ 0.135, well below the floor.
        for i in 0..200 {
            sampler.force_verify(&r, &note(&keys, i));
        }
        assert_eq!(sampler.stats(&r).unwrap().current_ratio, 0.5);
    }

    #[test]
    fn zero_ratios_disable_verification() {
        let sampler = VerificationSampler::new(VerificationConfig {
            initial_ratio: 0.0,
            lowest_ratio: 0.0,
            ..VerificationConfig::default()
        });
        let keys = Keys::generate();
        let r = relay(1);
        for i in 0..5 {
            assert_eq!(sampler.inspect(&r, &note(&keys, i)), Verification::Skipped);
        }
        assert_eq!(sampler.verification_count(), 0);
        let stats = sampler.stats(&r).unwrap();
        assert_eq!(stats.non_validated, 5);
        assert_eq!(stats.validated, 0);
        assert!(sampler.should_deliver(Verification::Skipped));
    }

    #[test]
    fn cross_relay_delivery_verifies_once() {
        let sampler = VerificationSampler::new(VerificationConfig::default());
        let keys = Keys::generate();
        let event = note(&keys, 0);

        assert_eq!(sampler.inspect(&relay(1), &event), Verification::Valid);
        assert_eq!(sampler.inspect(&relay(2), &event), Verification::Cached);
        assert_eq!(sampler.inspect(&relay(3), &event), Verification::Cached);

        assert_eq!(sampler.verification_count(), 1);
        for n in 1..=3 {
            assert_eq!(sampler.stats(&relay(n)).unwrap().validated, 1);
        }
    }

    #[test]
    fn cached_hits_do_not_move_the_ratio() {
        let sampler = VerificationSampler::new(VerificationConfig::default());
        let keys = Keys::generate();
        // Warm relay 1 past the warm-up threshold so its ratio has decayed.
        for i in 0..20 {
            sampler.inspect(&relay(1), &note(&keys, i));
        }
        let decayed = sampler.stats(&relay(1)).unwrap().current_ratio;
        assert!(decayed < 1.0);

        // Replaying an already-cached event keeps the ratio untouched.
        let event = note(&keys, 5);
        assert_eq!(sampler.inspect(&relay(1), &event), Verification::Cached);
        assert_eq!(sampler.stats(&relay(1)).unwrap().current_ratio, decayed);
    }

    #[test]
    fn invalid_signature_blacklists_and_rejects_followups() {
        let invalid_seen = Arc::new(AtomicUsize::new(0));
        let blacklisted = Arc::new(AtomicUsize::new(0));
        let sampler = VerificationSampler::new(VerificationConfig::default())
            .on_invalid_signature({
                let invalid_seen = invalid_seen.clone();
                move |_, _| {
                    invalid_seen.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_relay_blacklisted({
                let blacklisted = blacklisted.clone();
                move |_| {
                    blacklisted.fetch_add(1, Ordering::SeqCst);
                }
            });

        let keys = Keys::generate();
        let r = relay(1);
        assert_eq!(sampler.inspect(&r, &evil_note(&keys, 0)), Verification::Invalid);
        assert_eq!(invalid_seen.load(Ordering::SeqCst), 1);
        assert_eq!(blacklisted.load(Ordering::SeqCst), 1);
        assert!(sampler.is_blacklisted(&r));

        // A perfectly valid event is now rejected without verification.
        let before = sampler.verification_count();
        assert_eq!(sampler.inspect(&r, &note(&keys, 1)), Verification::Invalid);
        assert_eq!(sampler.verification_count(), before);
    }

    #[test]
    fn auto_blacklist_can_be_disabled() {
        let sampler = VerificationSampler::new(VerificationConfig {
            auto_blacklist: false,
            ..VerificationConfig::default()
        });
        let keys = Keys::generate();
        let r = relay(1);
        assert_eq!(sampler.inspect(&r, &evil_note(&keys, 0)), Verification::Invalid);
        assert!(!sampler.is_blacklisted(&r));
        assert_eq!(sampler.inspect(&r, &note(&keys, 1)), Verification::Valid);
    }

    #[test]
    fn malformed_frames_count_like_invalid_signatures() {
        let sampler = VerificationSampler::new(VerificationConfig::default());
        let r = relay(1);
        assert!(sampler.record_malformed(&r));
        assert!(sampler.is_blacklisted(&r));
        assert_eq!(sampler.stats(&r).unwrap().invalid, 1);
    }

    #[test]
    fn strict_mode_holds_until_corroborated() {
        let sampler = VerificationSampler::new(VerificationConfig {
            initial_ratio: 0.0,
            lowest_ratio: 0.0,
            strict: true,
            ..VerificationConfig::default()
        });
        let keys = Keys::generate();
        let event = note(&keys, 0);

        // First sighting: held.
        assert_eq!(sampler.inspect(&relay(1), &event), Verification::Skipped);
        assert!(!sampler.should_deliver(Verification::Skipped));
        // Same relay again: still no corroboration.
        assert_eq!(sampler.inspect(&relay(1), &event), Verification::Skipped);
        // A second relay corroborates: one forced verification.
        assert_eq!(sampler.inspect(&relay(2), &event), Verification::Valid);
        assert_eq!(sampler.verification_count(), 1);
        // Everyone else hits the cache.
        assert_eq!(sampler.inspect(&relay(3), &event), Verification::Cached);
    }

    #[test]
    fn force_verify_bypasses_sampling() {
        let sampler = VerificationSampler::new(VerificationConfig {
            initial_ratio: 0.0,
            lowest_ratio: 0.0,
            strict: true,
            ..VerificationConfig::default()
        });
        let keys = Keys::generate();
        let event = note(&keys, 0);
        let r = relay(1);

        assert_eq!(sampler.inspect(&r, &event), Verification::Skipped);
        assert_eq!(sampler.force_verify(&r, &event), Verification::Valid);
        assert_eq!(sampler.stats(&r).unwrap().validated, 1);
        // Now attested for everyone.
        assert_eq!(sampler.inspect(&relay(2), &event), Verification::Cached);
    }

    #[test]
    fn custom_ratio_fn_overrides_default_and_is_clamped() {
        // The custom policy sees both counters; returned values outside
        // [0, 1] are clamped.
        let sampler = VerificationSampler::new(VerificationConfig::default())
            .ratio_fn(|_, validated, non_validated| {
                if validated + non_validated >= 3 { 3.0 } else { 0.25 }
            });
        let keys = Keys::generate();
        let r = relay(1);
        sampler.inspect(&r, &note(&keys, 0));
        assert_eq!(sampler.stats(&r).unwrap().current_ratio, 0.25);
        // Both the verify and the skip path feed the policy, so after three
        // observations the ratio flips to the (clamped) 1.0.
        for i in 1..3 {
            sampler.inspect(&r, &note(&keys, i));
        }
        assert_eq!(sampler.stats(&r).unwrap().current_ratio, 1.0);
    }
}
