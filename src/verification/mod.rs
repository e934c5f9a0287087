//! Signature verification: the shared cross-relay cache and the sampling
//! policy that decides, per inbound event, whether to pay for a Schnorr
//! verification at all.

pub(crate) mod cache;
pub(crate) mod sampler;

pub use cache::SignatureCache;
pub use sampler::{
    RelayStats, Verification, VerificationConfig, VerificationSampler,
};
