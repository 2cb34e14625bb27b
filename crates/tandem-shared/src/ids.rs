use serde::{Deserialize, Serialize};

use crate::constants::KDF_CONTEXT_CHANNEL_ID;

/// Opaque account identifier for one party, as issued by the auth provider.
///
/// The engine never interprets the contents; it only compares ids and feeds
/// them into the channel-id derivation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(8);
        &self.0[..end]
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The conversation between exactly two parties.
///
/// Derived deterministically from the unordered pair of party ids, so both
/// devices compute the same channel without coordination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChannelId(pub String);

impl ChannelId {
    /// Derive the channel id for a pair of parties.
    ///
    /// The two ids are sorted before hashing, so `for_pair(a, b)` and
    /// `for_pair(b, a)` agree.
    pub fn for_pair(a: &UserId, b: &UserId) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_CHANNEL_ID);
        hasher.update(lo.as_str().as_bytes());
        hasher.update(&[0x1f]);
        hasher.update(hi.as_str().as_bytes());
        let hash = hasher.finalize();
        Self(hex::encode(&hash.as_bytes()[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
