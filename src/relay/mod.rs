//! Relay-side machinery: URL normalization, connection state, the
//! per-relay subscription multiplexer, and the connection task.

pub(crate) mod connection;
pub(crate) mod multiplexer;
pub mod pool;
pub(crate) mod subscription;

pub use connection::Relay;
pub use pool::{PoolNotification, PoolOptions, RelayPool};
pub use subscription::{Subscription, SubscriptionId, SubscriptionOptions, SubscriptionUpdate};

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;

use crate::error::Error;

/// A normalized relay URL: lower-cased scheme and host, trailing slashes
/// stripped. Identifies a relay everywhere in the crate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelayUrl(String);

impl RelayUrl {
    pub fn parse(input: &str) -> Result<Self, Error> {
        let url = Url::parse(input).map_err(|e| Error::InvalidUrl(format!("{input}: {e}")))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(Error::InvalidUrl(format!(
                    "{input}: unsupported scheme {other:?}"
                )));
            }
        }
        if url.host_str().is_none() {
            return Err(Error::InvalidUrl(format!("{input}: missing host")));
        }
        let mut normalized = url.to_string();
        while normalized.ends_with('/') {
            normalized.pop();
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RelayUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Self::parse(s)
    }
}

impl Serialize for RelayUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RelayUrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(D::Error::custom)
    }
}

/// Connection state of a relay, published through a `watch` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Gone for good: explicitly removed or blacklisted.
    Terminated,
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelayStatus::Disconnected => "disconnected",
            RelayStatus::Connecting => "connecting",
            RelayStatus::Connected => "connected",
            RelayStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}
