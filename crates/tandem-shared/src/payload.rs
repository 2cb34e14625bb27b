//! The plaintext message body carried inside every envelope's ciphertext.
//!
//! Encoded as JSON rather than a fixed binary layout: unknown fields from a
//! newer app version must not break an older reader, because a version
//! mismatch only triggers a re-bootstrap, never a decode failure.

use serde::{Deserialize, Serialize};

/// What kind of content the payload value holds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Text,
    Emoji,
    Gif,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Text => "text",
            PayloadKind::Emoji => "emoji",
            PayloadKind::Gif => "gif",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(PayloadKind::Text),
            "emoji" => Some(PayloadKind::Emoji),
            "gif" => Some(PayloadKind::Gif),
            _ => None,
        }
    }
}

/// Decrypted message content plus the sender-assigned timestamp.
///
/// `sent_at_ms` inside the payload is authoritative for ordering; the
/// envelope-level timestamp is relay-visible coarse time only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessagePayload {
    pub kind: PayloadKind,
    pub value: String,
    /// Display hint for hidden-until-tapped messages. Not a security
    /// boundary; the value is encrypted either way.
    pub is_secret: bool,
    pub sent_at_ms: i64,
}

impl MessagePayload {
    /// Serialize to the bytes that get encrypted.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from freshly decrypted bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
