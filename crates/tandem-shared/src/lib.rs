//! # tandem-shared
//!
//! Types shared across the Tandem engine: party/channel identifiers, the
//! plaintext message payload and its codec, the transport envelope, and the
//! pairwise encryption capability used to seal payloads end to end.
//!
//! Everything here is deliberately transport- and storage-agnostic; the
//! store and sync crates build on these types without adding coupling
//! between each other.

pub mod constants;
pub mod crypto;
pub mod envelope;
pub mod ids;
pub mod payload;
pub mod time;

mod error;

pub use crypto::{ChannelCipher, PairwiseCipher, SymmetricKey};
pub use envelope::CloudEnvelope;
pub use error::CipherError;
pub use ids::{ChannelId, UserId};
pub use payload::{MessagePayload, PayloadKind};
