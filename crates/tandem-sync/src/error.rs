use tandem_shared::CipherError;
use tandem_store::StoreError;
use thiserror::Error;

use crate::transport::TransportError;

/// Everything that can go wrong while syncing a channel.
///
/// The two crypto variants split [`CipherError`] by whether a later key
/// re-establishment can fix the failure. Payload codec failures are grouped
/// with the recoverable class: the envelope authenticated, so the bytes are
/// genuine even when this build cannot read them.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("local store failure: {0}")]
    Storage(#[from] StoreError),

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("recoverable decryption failure: {0}")]
    RecoverableCrypto(CipherError),

    #[error("permanent decryption failure: {0}")]
    PermanentCrypto(CipherError),

    #[error("payload codec failure: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("policy violation: {0}")]
    Policy(String),
}

impl SyncError {
    pub fn from_cipher(err: CipherError) -> Self {
        if err.is_recoverable() {
            SyncError::RecoverableCrypto(err)
        } else {
            SyncError::PermanentCrypto(err)
        }
    }

    /// True for failures that a one-shot key re-establishment may clear.
    pub fn is_recoverable_crypto(&self) -> bool {
        matches!(
            self,
            SyncError::RecoverableCrypto(_) | SyncError::Payload(_)
        )
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::Storage(_) => ErrorCategory::Storage,
            SyncError::Transport(_) => ErrorCategory::Transport,
            SyncError::RecoverableCrypto(_) | SyncError::Payload(_) => {
                ErrorCategory::RecoverableCrypto
            }
            SyncError::PermanentCrypto(_) => ErrorCategory::PermanentCrypto,
            SyncError::Policy(_) => ErrorCategory::Policy,
        }
    }
}

/// Coarse error class, used as the throttle key when surfacing errors
/// so one sustained outage produces one notification per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Storage,
    Transport,
    RecoverableCrypto,
    PermanentCrypto,
    Policy,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Storage => "storage",
            ErrorCategory::Transport => "transport",
            ErrorCategory::RecoverableCrypto => "recoverable_crypto",
            ErrorCategory::PermanentCrypto => "permanent_crypto",
            ErrorCategory::Policy => "policy",
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
