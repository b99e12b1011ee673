//! Deterministic filename and directory-id encryption (AES-SIV)
//!
//! Filenames need deterministic encryption: a directory listing must map a
//! cleartext name to the same ciphertext on every call, or lookups would have
//! to trial-decrypt the whole directory. AES-SIV provides determinism with
//! authentication. Ciphertexts go through an unpadded upper-case base32
//! alphabet, which keeps them valid path segments on every filesystem.

use aes_siv::aead::generic_array::GenericArray;
use aes_siv::aead::KeyInit;
use aes_siv::siv::Aes256Siv;
use data_encoding::BASE32_NOPAD;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};
use crate::MASTER_KEY_LEN;

/// No associated data: filename encryption is keyed by the master keys alone.
const NO_HEADERS: [&[u8]; 0] = [];

/// Build the 64-byte SIV key from the vault's key pair.
///
/// RFC 5297 key order: the S2V (MAC) half first, the CTR half second.
fn siv_cipher(primary: &[u8; MASTER_KEY_LEN], mac: &[u8; MASTER_KEY_LEN]) -> Aes256Siv {
    let mut key = Zeroizing::new([0u8; 2 * MASTER_KEY_LEN]);
    key[..MASTER_KEY_LEN].copy_from_slice(mac);
    key[MASTER_KEY_LEN..].copy_from_slice(primary);
    Aes256Siv::new(GenericArray::from_slice(&key[..]))
}

/// Encrypt a filename. Equal inputs yield equal outputs.
pub fn encrypt_filename(
    primary: &[u8; MASTER_KEY_LEN],
    mac: &[u8; MASTER_KEY_LEN],
    cleartext_name: &str,
) -> CryptoResult<String> {
    let ciphertext = siv_cipher(primary, mac)
        .encrypt(NO_HEADERS, cleartext_name.as_bytes())
        .map_err(|_| CryptoError::EncryptFailed("SIV filename encryption".into()))?;
    Ok(BASE32_NOPAD.encode(&ciphertext))
}

/// Decrypt a filename. Bad encoding, a SIV tag mismatch, and invalid UTF-8
/// all surface as [`CryptoError::DecryptFailed`].
pub fn decrypt_filename(
    primary: &[u8; MASTER_KEY_LEN],
    mac: &[u8; MASTER_KEY_LEN],
    ciphertext_name: &str,
) -> CryptoResult<String> {
    let ciphertext = BASE32_NOPAD
        .decode(ciphertext_name.as_bytes())
        .map_err(|e| CryptoError::DecryptFailed(format!("filename encoding: {e}")))?;
    let cleartext = siv_cipher(primary, mac)
        .decrypt(NO_HEADERS, &ciphertext)
        .map_err(|_| CryptoError::DecryptFailed("filename SIV tag mismatch".into()))?;
    String::from_utf8(cleartext)
        .map_err(|_| CryptoError::DecryptFailed("filename is not valid UTF-8".into()))
}

/// Encrypt a directory id into its on-disk path.
///
/// The SIV ciphertext is hashed with SHA-256 before encoding, so the path has
/// a fixed length and a uniform distribution; the two-character shard prefix
/// bounds per-directory fan-out in the vault's storage tree.
pub fn encrypt_directory_path(
    primary: &[u8; MASTER_KEY_LEN],
    mac: &[u8; MASTER_KEY_LEN],
    directory_id: &str,
    path_sep: char,
) -> CryptoResult<String> {
    let ciphertext = siv_cipher(primary, mac)
        .encrypt(NO_HEADERS, directory_id.as_bytes())
        .map_err(|_| CryptoError::EncryptFailed("SIV directory id encryption".into()))?;
    let hashed = Sha256::digest(&ciphertext);
    let encoded = BASE32_NOPAD.encode(&hashed);
    Ok(format!("{}{}{}", &encoded[..2], path_sep, &encoded[2..]))
}
