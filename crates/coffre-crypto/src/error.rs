use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Typed failures surfaced to the collaborating layers (shell, WebDAV, mount).
///
/// MAC and SIV tag mismatches are never swallowed or downgraded; key-unwrap
/// integrity failures are reported as [`CryptoError::WrongPassword`] because a
/// wrong KEK is by far their most likely cause.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("wrong password")]
    WrongPassword,

    #[error("decryption failed: {0}")]
    DecryptFailed(String),

    #[error("MAC authentication failed: {context}")]
    MacAuthFailed { context: String },

    #[error("unsupported vault version {stored} (this build supports version {supported})")]
    UnsupportedVault { stored: u32, supported: u32 },

    #[error("unsupported master key length {stored} bits (maximum {max_allowed})")]
    UnsupportedKeyLength { stored: u32, max_allowed: u32 },

    #[error("encryption failed: {0}")]
    EncryptFailed(String),

    #[error("invalid key file: {0}")]
    InvalidKeyFile(String),

    #[error("cryptor has been destroyed")]
    Destroyed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
