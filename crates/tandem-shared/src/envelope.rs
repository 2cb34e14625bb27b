use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::UserId;

/// The encrypted, transport-level representation of one message.
///
/// This is all the relay ever sees: routing ids and an opaque ciphertext.
/// The envelope id equals the message id, so deduplication works before
/// decryption.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CloudEnvelope {
    pub id: Uuid,
    pub sender: UserId,
    pub recipient: UserId,
    /// `nonce || ciphertext` sealed by the channel cipher.
    pub ciphertext: Vec<u8>,
    /// Relay-visible coarse timestamp, in seconds. The authoritative
    /// millisecond timestamp travels inside the ciphertext.
    pub sent_at_secs: i64,
}

impl CloudEnvelope {
    /// Serialize to binary (bincode).
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}
