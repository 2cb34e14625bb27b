/// XChaCha20-Poly1305 nonce length in bytes, prepended to every ciphertext.
pub const NONCE_SIZE: usize = 24;

/// BLAKE3 KDF context for deriving a per-channel message key from the
/// x25519 shared secret. Changing this string rotates every derived key.
pub const KDF_CONTEXT_CHANNEL_KEY: &str = "tandem 2025-07 channel message key";

/// BLAKE3 KDF context for deriving the deterministic channel id from the
/// two party ids.
pub const KDF_CONTEXT_CHANNEL_ID: &str = "tandem 2025-07 channel id";
