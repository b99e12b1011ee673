//! The long-lived master key pair of a vault

use rand::RngCore;
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};
use crate::MASTER_KEY_LEN;

/// A vault's key pair: a 256-bit AES key for content and filename encryption
/// and a 256-bit HMAC-SHA256 key for authentication.
///
/// Both keys are zeroized on drop. [`MasterKeys::destroy`] zeroizes eagerly;
/// afterwards every accessor fails with [`CryptoError::Destroyed`]. The two
/// keys are always destroyed together.
pub struct MasterKeys {
    primary: [u8; MASTER_KEY_LEN],
    mac: [u8; MASTER_KEY_LEN],
    destroyed: bool,
}

impl MasterKeys {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let mut primary = [0u8; MASTER_KEY_LEN];
        let mut mac = [0u8; MASTER_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut primary);
        rand::thread_rng().fill_bytes(&mut mac);
        Self {
            primary,
            mac,
            destroyed: false,
        }
    }

    pub(crate) fn from_raw(primary: [u8; MASTER_KEY_LEN], mac: [u8; MASTER_KEY_LEN]) -> Self {
        Self {
            primary,
            mac,
            destroyed: false,
        }
    }

    /// The AES master key.
    pub fn primary(&self) -> CryptoResult<&[u8; MASTER_KEY_LEN]> {
        if self.destroyed {
            return Err(CryptoError::Destroyed);
        }
        Ok(&self.primary)
    }

    /// The HMAC master key.
    pub fn mac(&self) -> CryptoResult<&[u8; MASTER_KEY_LEN]> {
        if self.destroyed {
            return Err(CryptoError::Destroyed);
        }
        Ok(&self.mac)
    }

    /// Both keys at once; the common case for SIV and file operations.
    pub fn pair(&self) -> CryptoResult<(&[u8; MASTER_KEY_LEN], &[u8; MASTER_KEY_LEN])> {
        if self.destroyed {
            return Err(CryptoError::Destroyed);
        }
        Ok((&self.primary, &self.mac))
    }

    /// Zeroize both keys. Idempotent.
    pub fn destroy(&mut self) {
        self.primary.zeroize();
        self.mac.zeroize();
        self.destroyed = true;
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl Drop for MasterKeys {
    fn drop(&mut self) {
        self.primary.zeroize();
        self.mac.zeroize();
    }
}

impl std::fmt::Debug for MasterKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKeys")
            .field("primary", &"[REDACTED]")
            .field("mac", &"[REDACTED]")
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_differ() {
        let keys = MasterKeys::generate();
        assert_ne!(
            keys.primary().unwrap(),
            keys.mac().unwrap(),
            "primary and mac keys must be independent"
        );

        let other = MasterKeys::generate();
        assert_ne!(keys.primary().unwrap(), other.primary().unwrap());
    }

    #[test]
    fn test_destroy_zeroizes_and_rejects() {
        let mut keys = MasterKeys::from_raw([0xAA; MASTER_KEY_LEN], [0xBB; MASTER_KEY_LEN]);
        keys.destroy();

        assert!(keys.is_destroyed());
        assert!(matches!(keys.primary(), Err(CryptoError::Destroyed)));
        assert!(matches!(keys.mac(), Err(CryptoError::Destroyed)));
        assert!(matches!(keys.pair(), Err(CryptoError::Destroyed)));
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let mut keys = MasterKeys::generate();
        keys.destroy();
        keys.destroy();
        assert!(keys.is_destroyed());
    }

    #[test]
    fn test_debug_redacts_key_material() {
        let keys = MasterKeys::from_raw([0x42; MASTER_KEY_LEN], [0x43; MASTER_KEY_LEN]);
        let debug = format!("{keys:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("42"), "debug output must not leak key bytes");
    }
}
