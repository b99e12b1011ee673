//! Key derivation: scrypt passphrase → key-encryption key

use scrypt::Params;
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};

/// Length of the random scrypt salt written to the key file.
pub const SALT_LEN: usize = 8;

/// scrypt cost parameters for KDF. Persisted in the key file so that older
/// vaults keep unlocking after the defaults change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScryptParams {
    /// CPU/memory cost N; must be a power of two (default: 2^14)
    pub cost_param: u32,
    /// Block size r (default: 8)
    pub block_size: u32,
}

impl Default for ScryptParams {
    fn default() -> Self {
        Self {
            cost_param: 1 << 14,
            block_size: 8,
        }
    }
}

/// Derive a key-encryption key of `key_len` bytes from a passphrase.
///
/// Parallelism is fixed at 1. The salt does not need to be secret and is
/// stored alongside the wrapped keys. Parameters can arrive from an untrusted
/// key file, so invalid values are an error rather than a panic.
pub fn derive_kek(
    passphrase: &SecretString,
    salt: &[u8],
    params: &ScryptParams,
    key_len: usize,
) -> CryptoResult<Zeroizing<Vec<u8>>> {
    if params.cost_param < 2 || !params.cost_param.is_power_of_two() {
        return Err(CryptoError::InvalidKeyFile(format!(
            "scrypt cost parameter {} is not a power of two",
            params.cost_param
        )));
    }
    let log_n = params.cost_param.trailing_zeros() as u8;
    let scrypt_params = Params::new(log_n, params.block_size, 1, key_len)
        .map_err(|e| CryptoError::InvalidKeyFile(format!("invalid scrypt parameters: {e}")))?;

    let mut kek = Zeroizing::new(vec![0u8; key_len]);
    scrypt::scrypt(
        passphrase.expose_secret().as_bytes(),
        salt,
        &scrypt_params,
        &mut kek,
    )
    .map_err(|e| CryptoError::InvalidKeyFile(format!("scrypt output length: {e}")))?;

    Ok(kek)
}
