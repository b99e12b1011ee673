//! Wrapped master-key persistence
//!
//! The key file is a small JSON document that survives password changes:
//!
//! ```json
//! {
//!   "version": 3,
//!   "scryptSalt": "5ZqBK7OZ9hs=",
//!   "scryptCostParam": 16384,
//!   "scryptBlockSize": 8,
//!   "keyLength": 256,
//!   "primaryMasterKey": "…",
//!   "hMacMasterKey": "…"
//! }
//! ```
//!
//! Both master keys are wrapped with AES Key Wrap (RFC 3394) under a KEK
//! derived from the password via scrypt. The wrap's integrity check doubles
//! as the password check.

use std::io::{Read, Write};

use aes_kw::KekAes256;
use rand::RngCore;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};
use crate::kdf::{self, ScryptParams};
use crate::masterkey::MasterKeys;
use crate::{MASTER_KEY_LEN, VAULT_VERSION};

/// Maximum master key length this build supports, in bits.
///
/// Rust always provides 256-bit AES, so unlike JVM deployments there is no
/// policy-dependent degradation: vaults are created with 256-bit keys and
/// anything else is rejected.
pub const MAX_KEY_LENGTH_BITS: u32 = 256;

/// RFC 3394 wrapping adds one 8-byte integrity block.
const WRAPPED_KEY_LEN: usize = MASTER_KEY_LEN + 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyFile {
    pub version: u32,
    #[serde(with = "b64")]
    pub scrypt_salt: Vec<u8>,
    pub scrypt_cost_param: u32,
    pub scrypt_block_size: u32,
    pub key_length: u32,
    #[serde(with = "b64")]
    pub primary_master_key: Vec<u8>,
    #[serde(rename = "hMacMasterKey", with = "b64")]
    pub hmac_master_key: Vec<u8>,
}

impl KeyFile {
    /// Wrap `keys` under a KEK derived from `password` with a fresh salt.
    pub fn seal(
        keys: &MasterKeys,
        password: &SecretString,
        params: &ScryptParams,
    ) -> CryptoResult<Self> {
        let mut salt = vec![0u8; kdf::SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);

        let kek_bytes = kdf::derive_kek(password, &salt, params, MASTER_KEY_LEN)?;
        let kek = kek_from_bytes(&kek_bytes);

        let mut wrapped_primary = [0u8; WRAPPED_KEY_LEN];
        let mut wrapped_mac = [0u8; WRAPPED_KEY_LEN];
        kek.wrap(keys.primary()?, &mut wrapped_primary)
            .map_err(|e| CryptoError::EncryptFailed(format!("master key wrap: {e}")))?;
        kek.wrap(keys.mac()?, &mut wrapped_mac)
            .map_err(|e| CryptoError::EncryptFailed(format!("master key wrap: {e}")))?;

        Ok(Self {
            version: VAULT_VERSION,
            scrypt_salt: salt,
            scrypt_cost_param: params.cost_param,
            scrypt_block_size: params.block_size,
            key_length: (MASTER_KEY_LEN * 8) as u32,
            primary_master_key: wrapped_primary.to_vec(),
            hmac_master_key: wrapped_mac.to_vec(),
        })
    }

    /// Unwrap the master keys with `password`.
    ///
    /// Version and key-length checks run before the expensive KDF. A failed
    /// integrity check during unwrap means the KEK was wrong and is reported
    /// as [`CryptoError::WrongPassword`].
    pub fn unseal(&self, password: &SecretString) -> CryptoResult<MasterKeys> {
        if self.version != VAULT_VERSION {
            return Err(CryptoError::UnsupportedVault {
                stored: self.version,
                supported: VAULT_VERSION,
            });
        }
        if self.key_length != MAX_KEY_LENGTH_BITS {
            return Err(CryptoError::UnsupportedKeyLength {
                stored: self.key_length,
                max_allowed: MAX_KEY_LENGTH_BITS,
            });
        }
        if self.primary_master_key.len() != WRAPPED_KEY_LEN
            || self.hmac_master_key.len() != WRAPPED_KEY_LEN
        {
            return Err(CryptoError::InvalidKeyFile(
                "wrapped master key has unexpected length".into(),
            ));
        }

        let params = ScryptParams {
            cost_param: self.scrypt_cost_param,
            block_size: self.scrypt_block_size,
        };
        let kek_bytes = kdf::derive_kek(password, &self.scrypt_salt, &params, MASTER_KEY_LEN)?;
        let kek = kek_from_bytes(&kek_bytes);

        let mut primary = [0u8; MASTER_KEY_LEN];
        let mut mac = [0u8; MASTER_KEY_LEN];
        kek.unwrap(&self.primary_master_key, &mut primary)
            .map_err(|_| CryptoError::WrongPassword)?;
        if kek.unwrap(&self.hmac_master_key, &mut mac).is_err() {
            primary.zeroize();
            return Err(CryptoError::WrongPassword);
        }

        Ok(MasterKeys::from_raw(primary, mac))
    }

    pub fn to_writer<W: Write>(&self, mut out: W) -> CryptoResult<()> {
        serde_json::to_writer(&mut out, self)
            .map_err(|e| CryptoError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        out.flush()?;
        Ok(())
    }

    /// Parse a key file. The input is buffered first so transport errors stay
    /// distinguishable from malformed JSON.
    pub fn from_reader<R: Read>(mut input: R) -> CryptoResult<Self> {
        let mut buf = Vec::new();
        input.read_to_end(&mut buf)?;
        serde_json::from_slice(&buf).map_err(|e| CryptoError::InvalidKeyFile(e.to_string()))
    }
}

/// Re-wrap the master keys from `input` under `new_password`.
///
/// Reads a key file, unwraps with `old_password`, and writes a fresh key file
/// (new salt, same cost parameters) to `output`. Encrypted file content stays
/// valid because the master keys themselves do not change.
pub fn change_password<R: Read, W: Write>(
    input: R,
    output: W,
    old_password: &SecretString,
    new_password: &SecretString,
) -> CryptoResult<()> {
    let keyfile = KeyFile::from_reader(input)?;
    let params = ScryptParams {
        cost_param: keyfile.scrypt_cost_param,
        block_size: keyfile.scrypt_block_size,
    };
    let keys = keyfile.unseal(old_password)?;
    KeyFile::seal(&keys, new_password, &params)?.to_writer(output)
}

fn kek_from_bytes(bytes: &[u8]) -> KekAes256 {
    let mut key = [0u8; MASTER_KEY_LEN];
    key.copy_from_slice(bytes);
    let kek = KekAes256::from(key);
    key.zeroize();
    kek
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
