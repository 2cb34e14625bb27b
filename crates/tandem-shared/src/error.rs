use thiserror::Error;

/// Failures from the pairwise encryption capability.
///
/// The split into recoverable and permanent variants drives the engine's
/// decrypt-retry behavior: recoverable failures get exactly one shared-key
/// re-establishment attempt, permanent ones are surfaced immediately.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// AEAD tag verification failed: wrong key or tampered ciphertext.
    #[error("authentication failed: wrong key or tampered ciphertext")]
    AuthenticationFailed,

    /// Ciphertext too short to contain a nonce, or otherwise unparseable.
    #[error("malformed ciphertext")]
    MalformedCiphertext,

    /// No shared key has been established for this partner yet.
    #[error("no shared key established for partner")]
    MissingSharedKey,

    /// The local identity secret is absent; nothing can be derived.
    #[error("local identity key is missing")]
    MissingIdentityKey,

    /// The partner public key is unusable (wrong length or a low-order
    /// point producing a non-contributory shared secret).
    #[error("partner public key is invalid")]
    InvalidPartnerKey,
}

impl CipherError {
    /// Whether a shared-key re-establishment may fix this failure.
    ///
    /// Key-establishment races produce `AuthenticationFailed` (stale key)
    /// and `MissingSharedKey`; both heal once the partner's current key is
    /// observed. Identity problems never do.
    pub fn is_recoverable(&self) -> bool {
        match self {
            CipherError::AuthenticationFailed
            | CipherError::MalformedCiphertext
            | CipherError::MissingSharedKey => true,
            CipherError::MissingIdentityKey | CipherError::InvalidPartnerKey => false,
        }
    }
}
