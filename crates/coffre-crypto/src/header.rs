//! Encrypted file header
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0      | 16   | Header IV (CBC IV; also bound into every content MAC) |
//! | 16     | 8    | Content nonce (upper half of the CTR counter block) |
//! | 24     | 48   | AES-256-CBC(primary, IV) of length ‖ file key, PKCS#7 |
//! | 72     | 32   | HMAC-SHA256(mac, header[0..72]) |
//!
//! The sensitive block carries the true plaintext length (the ciphertext may
//! be longer because of small-file padding) and the per-file content key.
//! Verification is MAC-then-decrypt with a constant-time comparison.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::Mac;
use subtle::ConstantTimeEq;
use tracing::warn;
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};
use crate::{hmac_sha256, AES_BLOCK_LEN, FILE_KEY_LEN, FILE_NONCE_LEN, HEADER_LEN, MAC_LEN, MASTER_KEY_LEN};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Bytes covered by the header MAC.
const MAC_PAYLOAD_LEN: usize = HEADER_LEN - MAC_LEN;
/// Cleartext sensitive block: u64 length ‖ 32-byte file key.
const SENSITIVE_LEN: usize = 8 + FILE_KEY_LEN;
/// PKCS#7 rounds the 40 sensitive bytes up to three AES blocks.
const SENSITIVE_CT_LEN: usize = 48;

/// A decrypted file header.
pub struct FileHeader {
    pub iv: [u8; AES_BLOCK_LEN],
    pub nonce: [u8; FILE_NONCE_LEN],
    /// True plaintext length as recorded at encryption time.
    pub content_length: u64,
    pub file_key: Zeroizing<[u8; FILE_KEY_LEN]>,
}

impl std::fmt::Debug for FileHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHeader")
            .field("content_length", &self.content_length)
            .field("file_key", &"[REDACTED]")
            .finish()
    }
}

/// Assemble and encrypt a 104-byte header.
pub fn encrypt_header(
    primary: &[u8; MASTER_KEY_LEN],
    mac_key: &[u8; MASTER_KEY_LEN],
    iv: &[u8; AES_BLOCK_LEN],
    nonce: &[u8; FILE_NONCE_LEN],
    content_length: u64,
    file_key: &[u8; FILE_KEY_LEN],
) -> CryptoResult<[u8; HEADER_LEN]> {
    let mut sensitive = Zeroizing::new([0u8; SENSITIVE_LEN]);
    sensitive[..8].copy_from_slice(&content_length.to_be_bytes());
    sensitive[8..].copy_from_slice(file_key);

    let ciphertext = Aes256CbcEnc::new(primary.into(), iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(&sensitive[..]);
    debug_assert_eq!(ciphertext.len(), SENSITIVE_CT_LEN);

    let mut header = [0u8; HEADER_LEN];
    header[..AES_BLOCK_LEN].copy_from_slice(iv);
    header[AES_BLOCK_LEN..24].copy_from_slice(nonce);
    header[24..MAC_PAYLOAD_LEN].copy_from_slice(&ciphertext);

    let mut mac = hmac_sha256(mac_key);
    mac.update(&header[..MAC_PAYLOAD_LEN]);
    header[MAC_PAYLOAD_LEN..].copy_from_slice(&mac.finalize().into_bytes());
    Ok(header)
}

/// Verify the header MAC in constant time.
pub fn verify_header_mac(
    mac_key: &[u8; MASTER_KEY_LEN],
    header: &[u8; HEADER_LEN],
) -> CryptoResult<()> {
    let mut mac = hmac_sha256(mac_key);
    mac.update(&header[..MAC_PAYLOAD_LEN]);
    let computed = mac.finalize().into_bytes();
    if bool::from(computed.as_slice().ct_eq(&header[MAC_PAYLOAD_LEN..])) {
        Ok(())
    } else {
        warn!("header MAC verification failed");
        Err(CryptoError::MacAuthFailed {
            context: "header".into(),
        })
    }
}

/// Decrypt a header.
///
/// With `authenticate`, the MAC is checked before the CBC block is touched.
/// Without it, corrupt ciphertext can still surface as a padding failure,
/// which is reported as `DecryptFailed` rather than trusted.
pub fn decrypt_header(
    primary: &[u8; MASTER_KEY_LEN],
    mac_key: &[u8; MASTER_KEY_LEN],
    header: &[u8; HEADER_LEN],
    authenticate: bool,
) -> CryptoResult<FileHeader> {
    if authenticate {
        verify_header_mac(mac_key, header)?;
    }

    let mut iv = [0u8; AES_BLOCK_LEN];
    iv.copy_from_slice(&header[..AES_BLOCK_LEN]);
    let mut nonce = [0u8; FILE_NONCE_LEN];
    nonce.copy_from_slice(&header[AES_BLOCK_LEN..24]);

    let sensitive = Aes256CbcDec::new(primary.into(), (&iv).into())
        .decrypt_padded_vec_mut::<Pkcs7>(&header[24..MAC_PAYLOAD_LEN])
        .map_err(|_| CryptoError::DecryptFailed("header padding".into()))?;
    let sensitive = Zeroizing::new(sensitive);
    if sensitive.len() != SENSITIVE_LEN {
        return Err(CryptoError::DecryptFailed(
            "header payload has unexpected length".into(),
        ));
    }

    let mut length_bytes = [0u8; 8];
    length_bytes.copy_from_slice(&sensitive[..8]);
    let mut file_key = Zeroizing::new([0u8; FILE_KEY_LEN]);
    file_key.copy_from_slice(&sensitive[8..]);

    Ok(FileHeader {
        iv,
        nonce,
        content_length: u64::from_be_bytes(length_bytes),
        file_key,
    })
}
