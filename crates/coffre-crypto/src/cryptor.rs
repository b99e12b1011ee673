//! The vault cryptor: facade over key, name, and content operations
//!
//! A cryptor starts out with freshly generated master keys (so a new vault
//! can be persisted immediately), replaces them on a successful
//! `decrypt_master_key`, and rejects everything after `destroy`. A failed
//! unlock leaves the current keys untouched.

use std::io::{Read, Seek, Write};

use secrecy::SecretString;
use tracing::debug;

use crate::content::{self, SeekableSink};
use crate::error::CryptoResult;
use crate::kdf::ScryptParams;
use crate::keyfile::KeyFile;
use crate::masterkey::MasterKeys;
use crate::names;

pub struct Cryptor {
    keys: MasterKeys,
    scrypt: ScryptParams,
}

impl Cryptor {
    /// A cryptor with freshly generated master keys.
    pub fn new() -> Self {
        Self::with_scrypt_params(ScryptParams::default())
    }

    /// A fresh cryptor with explicit scrypt cost parameters.
    pub fn with_scrypt_params(scrypt: ScryptParams) -> Self {
        Self {
            keys: MasterKeys::generate(),
            scrypt,
        }
    }

    /// Wrap the master keys under `password` and write the key file JSON.
    pub fn encrypt_master_key<W: Write>(&self, out: W, password: &SecretString) -> CryptoResult<()> {
        KeyFile::seal(&self.keys, password, &self.scrypt)?.to_writer(out)
    }

    /// Replace the master keys with the pair unwrapped from a key file.
    ///
    /// On any failure — wrong password, unsupported version or key length,
    /// malformed file — the cryptor keeps its current keys.
    pub fn decrypt_master_key<R: Read>(
        &mut self,
        input: R,
        password: &SecretString,
    ) -> CryptoResult<()> {
        let keyfile = KeyFile::from_reader(input)?;
        self.keys = keyfile.unseal(password)?;
        debug!("master keys unwrapped from key file");
        Ok(())
    }

    /// Deterministically encrypt a filename.
    pub fn encrypt_filename(&self, cleartext_name: &str) -> CryptoResult<String> {
        let (primary, mac) = self.keys.pair()?;
        names::encrypt_filename(primary, mac, cleartext_name)
    }

    pub fn decrypt_filename(&self, ciphertext_name: &str) -> CryptoResult<String> {
        let (primary, mac) = self.keys.pair()?;
        names::decrypt_filename(primary, mac, ciphertext_name)
    }

    /// Encrypt a directory id into its sharded on-disk path, using the
    /// caller's native path separator.
    pub fn encrypt_directory_path(
        &self,
        directory_id: &str,
        path_sep: char,
    ) -> CryptoResult<String> {
        let (primary, mac) = self.keys.pair()?;
        names::encrypt_directory_path(primary, mac, directory_id, path_sep)
    }

    /// Encrypt `input` into `sink`; returns the true plaintext length.
    pub fn encrypt_file<R, W>(&self, input: R, sink: &mut W) -> CryptoResult<u64>
    where
        R: Read,
        W: SeekableSink + Send,
    {
        content::encrypt_file(&self.keys, input, sink)
    }

    /// Decrypt all of `source` into `out`; returns bytes written.
    pub fn decrypt_file<R, W>(
        &self,
        source: &mut R,
        out: &mut W,
        authenticate: bool,
    ) -> CryptoResult<u64>
    where
        R: Read + Seek,
        W: Write + Send,
    {
        content::decrypt_file(&self.keys, source, out, authenticate)
    }

    /// Decrypt `length` plaintext bytes starting at byte `pos`.
    pub fn decrypt_range<R, W>(
        &self,
        source: &mut R,
        out: &mut W,
        pos: u64,
        length: u64,
        authenticate: bool,
    ) -> CryptoResult<u64>
    where
        R: Read + Seek,
        W: Write,
    {
        content::decrypt_range(&self.keys, source, out, pos, length, authenticate)
    }

    /// The plaintext length recorded in the file header, or `None` when the
    /// source is too short to carry one.
    pub fn decrypted_content_length<R>(&self, source: &mut R) -> CryptoResult<Option<u64>>
    where
        R: Read + Seek,
    {
        content::decrypted_content_length(&self.keys, source)
    }

    /// Zeroize the master keys. Idempotent; all later operations fail.
    pub fn destroy(&mut self) {
        self.keys.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.keys.is_destroyed()
    }
}

impl Default for Cryptor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CryptoError;

    fn fast_cryptor() -> Cryptor {
        Cryptor::with_scrypt_params(ScryptParams {
            cost_param: 4,
            block_size: 8,
        })
    }

    #[test]
    fn test_destroyed_cryptor_rejects_operations() {
        let mut cryptor = fast_cryptor();
        cryptor.destroy();

        assert!(cryptor.is_destroyed());
        assert!(matches!(
            cryptor.encrypt_filename("a.txt"),
            Err(CryptoError::Destroyed)
        ));
        assert!(matches!(
            cryptor.encrypt_master_key(Vec::new(), &SecretString::from("pw")),
            Err(CryptoError::Destroyed)
        ));
        let mut sink = std::io::Cursor::new(Vec::new());
        assert!(matches!(
            cryptor.encrypt_file(&b"data"[..], &mut sink),
            Err(CryptoError::Destroyed)
        ));
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let mut cryptor = fast_cryptor();
        cryptor.destroy();
        cryptor.destroy();
        assert!(cryptor.is_destroyed());
    }

    #[test]
    fn test_failed_unlock_preserves_keys() {
        let mut cryptor = fast_cryptor();
        let before = cryptor.encrypt_filename("witness.txt").unwrap();

        let mut keyfile = Vec::new();
        fast_cryptor()
            .encrypt_master_key(&mut keyfile, &SecretString::from("hunter2"))
            .unwrap();

        let result = cryptor.decrypt_master_key(&keyfile[..], &SecretString::from("Hunter2"));
        assert!(matches!(result, Err(CryptoError::WrongPassword)));

        let after = cryptor.encrypt_filename("witness.txt").unwrap();
        assert_eq!(before, after, "failed unlock must not replace the keys");
    }

    #[test]
    fn test_successful_unlock_replaces_keys() {
        let source = fast_cryptor();
        let password = SecretString::from("open sesame");
        let mut keyfile = Vec::new();
        source.encrypt_master_key(&mut keyfile, &password).unwrap();

        let mut other = fast_cryptor();
        assert_ne!(
            source.encrypt_filename("f").unwrap(),
            other.encrypt_filename("f").unwrap()
        );

        other.decrypt_master_key(&keyfile[..], &password).unwrap();
        assert_eq!(
            source.encrypt_filename("f").unwrap(),
            other.encrypt_filename("f").unwrap(),
            "unlocked cryptor must share the source's keys"
        );
    }
}
