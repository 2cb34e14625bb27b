//! Pairwise message encryption: x25519 key agreement, BLAKE3 key
//! derivation with domain separation, XChaCha20-Poly1305 sealing.
//!
//! Ciphertext framing is `nonce || ciphertext` with a 24-byte random nonce.
//! Key material is mutable shared state (establishment can race with
//! decryption), so the engine guards implementations behind a mutex.

use std::collections::HashMap;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::{KDF_CONTEXT_CHANNEL_KEY, NONCE_SIZE};
use crate::error::CipherError;
use crate::ids::{ChannelId, UserId};

pub type SymmetricKey = [u8; 32];

/// The encryption capability the sync engine consumes.
///
/// One implementation per channel session; partner ids are passed
/// explicitly so a future multi-partner holder stays possible.
pub trait ChannelCipher: Send {
    /// Seal a plaintext for the partner.
    ///
    /// Fails with [`CipherError::MissingIdentityKey`] when no shared key
    /// exists: sending before pairing completed is a pairing-state
    /// problem, not a transient race.
    fn encrypt(&self, plaintext: &[u8], partner: &UserId) -> Result<Vec<u8>, CipherError>;

    /// Open a ciphertext from the partner.
    ///
    /// A missing shared key here is [`CipherError::MissingSharedKey`]
    /// (recoverable): inbound traffic can legitimately arrive before the
    /// local side finished key establishment.
    fn decrypt(&self, ciphertext: &[u8], partner: &UserId) -> Result<Vec<u8>, CipherError>;

    /// Run key agreement against a partner public key and install the
    /// derived message key. Also records the key as last-observed.
    fn establish_shared_key(
        &mut self,
        partner_public: &[u8],
        partner: &UserId,
    ) -> Result<(), CipherError>;

    /// Record a partner public key seen out-of-band (profile sync,
    /// pairing refresh) without deriving yet.
    fn observe_partner_key(&mut self, partner: &UserId, public: [u8; 32]);

    /// The most recently observed partner public key, used by the
    /// one-shot decrypt recovery path.
    fn observed_partner_key(&self, partner: &UserId) -> Option<[u8; 32]>;
}

/// Production [`ChannelCipher`]: one local x25519 identity, one derived
/// message key per partner, channel-separated via the KDF context.
pub struct PairwiseCipher {
    local_secret: StaticSecret,
    channel: ChannelId,
    shared: HashMap<UserId, SymmetricKey>,
    observed: HashMap<UserId, [u8; 32]>,
}

impl PairwiseCipher {
    pub fn new(local_secret: StaticSecret, channel: ChannelId) -> Self {
        Self {
            local_secret,
            channel,
            shared: HashMap::new(),
            observed: HashMap::new(),
        }
    }

    /// Fresh random identity, mainly for tests and first-run setup.
    pub fn generate(channel: ChannelId) -> Self {
        Self::new(StaticSecret::random_from_rng(rand::rngs::OsRng), channel)
    }

    /// The local public key to share with the partner.
    pub fn public_key(&self) -> [u8; 32] {
        PublicKey::from(&self.local_secret).to_bytes()
    }
}

impl ChannelCipher for PairwiseCipher {
    fn encrypt(&self, plaintext: &[u8], partner: &UserId) -> Result<Vec<u8>, CipherError> {
        let key = self
            .shared
            .get(partner)
            .ok_or(CipherError::MissingIdentityKey)?;

        let cipher = XChaCha20Poly1305::new(key.into());
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CipherError::AuthenticationFailed)?;

        let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    fn decrypt(&self, ciphertext: &[u8], partner: &UserId) -> Result<Vec<u8>, CipherError> {
        if ciphertext.len() < NONCE_SIZE {
            return Err(CipherError::MalformedCiphertext);
        }
        let key = self
            .shared
            .get(partner)
            .ok_or(CipherError::MissingSharedKey)?;

        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_SIZE);
        let cipher = XChaCha20Poly1305::new(key.into());
        let nonce = XNonce::from_slice(nonce_bytes);

        cipher
            .decrypt(nonce, sealed)
            .map_err(|_| CipherError::AuthenticationFailed)
    }

    fn establish_shared_key(
        &mut self,
        partner_public: &[u8],
        partner: &UserId,
    ) -> Result<(), CipherError> {
        let public: [u8; 32] = partner_public
            .try_into()
            .map_err(|_| CipherError::InvalidPartnerKey)?;

        let secret = self.local_secret.diffie_hellman(&PublicKey::from(public));
        // Low-order points yield an all-zero shared secret; reject them.
        if !secret.was_contributory() {
            return Err(CipherError::InvalidPartnerKey);
        }

        let key = derive_message_key(secret.as_bytes(), &self.channel);
        self.shared.insert(partner.clone(), key);
        self.observed.insert(partner.clone(), public);
        Ok(())
    }

    fn observe_partner_key(&mut self, partner: &UserId, public: [u8; 32]) {
        self.observed.insert(partner.clone(), public);
    }

    fn observed_partner_key(&self, partner: &UserId) -> Option<[u8; 32]> {
        self.observed.get(partner).copied()
    }
}

/// BLAKE3 KDF: shared secret + channel id, domain-separated so the same
/// pair of parties gets distinct keys per channel context.
fn derive_message_key(shared_secret: &[u8], channel: &ChannelId) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_CHANNEL_KEY);
    hasher.update(shared_secret);
    hasher.update(channel.as_str().as_bytes());
    let hash = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash.as_bytes()[..32]);
    key
}
