//! coffre-crypto: client-side encryption engine for Coffre vaults
//!
//! A vault is a directory tree of encrypted files and encrypted names plus
//! one key file. This crate implements everything cryptographic about it;
//! mounting, WebDAV, and UI live in other crates.
//!
//! Key hierarchy:
//! ```text
//! Password ──scrypt──▶ KEK
//!   └── AES Key Wrap of the two master keys, persisted as JSON
//! Master keys (generated once per vault)
//!   ├── primary: AES-256 — header CBC block, filename AES-SIV (CTR half)
//!   └── mac:     HMAC-SHA256 — header MAC, content block MACs, SIV (S2V half)
//! File key (random per file, carried inside the encrypted header)
//!   └── AES-256-CTR over the file content
//! ```
//!
//! Encrypted file layout:
//! ```text
//! [104-byte header][ct block 0 ≤32 KiB][MAC 0][ct block 1][MAC 1]…
//! MAC i = HMAC-SHA256(mac, header IV ‖ be64(i) ‖ ct block i)
//! ```
//! Binding the header IV into every block MAC pins blocks to their file;
//! binding the index pins them to their position.

pub mod content;
pub mod cryptor;
pub mod error;
pub mod header;
pub mod kdf;
pub mod keyfile;
pub mod masterkey;
pub mod names;
pub mod obfuscate;
pub mod worker;

pub use content::SeekableSink;
pub use cryptor::Cryptor;
pub use error::{CryptoError, CryptoResult};
pub use kdf::ScryptParams;
pub use keyfile::{change_password, KeyFile};
pub use masterkey::MasterKeys;

/// AES block length in bytes.
pub const AES_BLOCK_LEN: usize = 16;

/// Master keys are 256-bit.
pub const MASTER_KEY_LEN: usize = 32;

/// HMAC-SHA256 output length.
pub const MAC_LEN: usize = 32;

/// Plaintext bytes covered by one content MAC.
pub const CONTENT_MAC_BLOCK: usize = 32 * 1024;

/// Encrypted file header length.
pub const HEADER_LEN: usize = 104;

/// Per-file content key length.
pub const FILE_KEY_LEN: usize = 32;

/// Content nonce length (upper half of the CTR counter block).
pub const FILE_NONCE_LEN: usize = 8;

/// Key file format version produced and accepted by this crate.
pub const VAULT_VERSION: u32 = 3;

/// AES-256-CTR with a big-endian 128-bit counter block.
pub(crate) type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

pub(crate) type HmacSha256 = hmac::Hmac<sha2::Sha256>;

/// HMAC-SHA256 keyed with a master key. Every platform HMAC accepts 32-byte
/// keys, so construction cannot fail.
pub(crate) fn hmac_sha256(key: &[u8; MASTER_KEY_LEN]) -> HmacSha256 {
    use hmac::Mac;
    HmacSha256::new_from_slice(key).expect("HMAC-SHA256 accepts keys of any length")
}

/// CTR counter block for a content block: nonce ‖ big-endian offset of the
/// block's first AES block within the file.
pub(crate) fn ctr_iv(nonce: &[u8; FILE_NONCE_LEN], block_index: u64) -> [u8; AES_BLOCK_LEN] {
    let mut iv = [0u8; AES_BLOCK_LEN];
    iv[..FILE_NONCE_LEN].copy_from_slice(nonce);
    let counter = block_index * (CONTENT_MAC_BLOCK / AES_BLOCK_LEN) as u64;
    iv[FILE_NONCE_LEN..].copy_from_slice(&counter.to_be_bytes());
    iv
}
