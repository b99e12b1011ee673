//! Encrypted file content operations
//!
//! On-disk layout: 104-byte header, then one `(≤32 KiB ciphertext ‖ 32-byte
//! MAC)` frame per content block. Full-file encryption and decryption fan out
//! to the worker pipeline; range reads are single-threaded because a seek
//! already bounds the work.

use std::io::{self, Read, Seek, SeekFrom, Write};

use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::Mac;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};
use crate::header::{self, FileHeader};
use crate::masterkey::MasterKeys;
use crate::obfuscate::{LengthLimitingWriter, LengthObfuscatingReader};
use crate::worker::{
    self, BlocksData, DecryptProcessor, EncryptProcessor, OfferOutcome, MAX_BLOCKS_PER_BATCH,
    OFFER_TIMEOUT,
};
use crate::{
    ctr_iv, hmac_sha256, Aes256Ctr, AES_BLOCK_LEN, CONTENT_MAC_BLOCK, FILE_KEY_LEN,
    FILE_NONCE_LEN, HEADER_LEN, MAC_LEN,
};

/// A ciphertext frame on disk: one content block plus its MAC.
const FRAME_LEN: usize = CONTENT_MAC_BLOCK + MAC_LEN;

/// Ciphertext sinks must be seekable and truncatable. Files and in-memory
/// cursors both qualify.
pub trait SeekableSink: Write + Seek {
    /// Discard any existing content.
    fn truncate(&mut self) -> io::Result<()>;
}

impl SeekableSink for std::fs::File {
    fn truncate(&mut self) -> io::Result<()> {
        self.set_len(0)
    }
}

impl SeekableSink for io::Cursor<Vec<u8>> {
    fn truncate(&mut self) -> io::Result<()> {
        self.get_mut().clear();
        self.set_position(0);
        Ok(())
    }
}

impl<S: SeekableSink + ?Sized> SeekableSink for &mut S {
    fn truncate(&mut self) -> io::Result<()> {
        (**self).truncate()
    }
}

/// Encrypt `input` into `sink` and return the true plaintext length.
///
/// The header slot is reserved up front and written last: the plaintext
/// length is only known once the (possibly padded) input is exhausted.
pub(crate) fn encrypt_file<R, W>(keys: &MasterKeys, input: R, sink: &mut W) -> CryptoResult<u64>
where
    R: Read,
    W: SeekableSink + Send,
{
    let (primary, mac_key) = keys.pair()?;

    sink.truncate()?;
    sink.seek(SeekFrom::Start(0))?;
    sink.write_all(&[0u8; HEADER_LEN])?;

    let mut rng = rand::thread_rng();
    let mut iv = [0u8; AES_BLOCK_LEN];
    rng.fill_bytes(&mut iv);
    let mut nonce = [0u8; FILE_NONCE_LEN];
    rng.fill_bytes(&mut nonce);
    let mut file_key = Zeroizing::new([0u8; FILE_KEY_LEN]);
    rng.fill_bytes(&mut file_key[..]);
    let mut pad = [0u8; 16];
    rng.fill_bytes(&mut pad);

    let mut reader = LengthObfuscatingReader::new(input, pad);

    let processors: Vec<EncryptProcessor> = (0..worker_count())
        .map(|_| EncryptProcessor::new(&file_key, mac_key, iv, nonce))
        .collect();

    worker::run_pipeline(processors, sink, |queue| {
        produce_batches(&mut reader, queue, CONTENT_MAC_BLOCK, || {
            CryptoError::EncryptFailed("worker pipeline stalled writing ciphertext".into())
        })
    })?;

    let plaintext_len = reader.real_input_length();
    let header_bytes =
        header::encrypt_header(primary, mac_key, &iv, &nonce, plaintext_len, &file_key)?;
    sink.seek(SeekFrom::Start(0))?;
    sink.write_all(&header_bytes)?;
    sink.flush()?;

    debug!(bytes = plaintext_len, "file encrypted");
    Ok(plaintext_len)
}

/// Decrypt all of `source` into `out`; returns the number of plaintext bytes
/// delivered. With `authenticate`, every block MAC is verified before its
/// ciphertext is decrypted.
pub(crate) fn decrypt_file<R, W>(
    keys: &MasterKeys,
    source: &mut R,
    out: &mut W,
    authenticate: bool,
) -> CryptoResult<u64>
where
    R: Read + Seek,
    W: Write + Send,
{
    let (_, mac_key) = keys.pair()?;
    let file_header = read_header(keys, source, authenticate)?;

    let processors: Vec<DecryptProcessor> = (0..worker_count())
        .map(|_| {
            DecryptProcessor::new(
                &file_header.file_key,
                mac_key,
                file_header.iv,
                file_header.nonce,
                authenticate,
            )
        })
        .collect();

    source.seek(SeekFrom::Start(HEADER_LEN as u64))?;
    let mut limiter = LengthLimitingWriter::new(out, file_header.content_length);
    worker::run_pipeline(processors, &mut limiter, |queue| {
        produce_batches(source, queue, FRAME_LEN, || {
            CryptoError::DecryptFailed("worker pipeline stalled writing plaintext".into())
        })
    })?;

    limiter.flush()?;
    let written = limiter.bytes_written();
    debug!(bytes = written, "file decrypted");
    Ok(written)
}

/// Decrypt `length` plaintext bytes starting at `pos`.
///
/// Seeks straight to the first covering block and decrypts forward on the
/// calling thread. The caller must stay within the declared content length.
pub(crate) fn decrypt_range<R, W>(
    keys: &MasterKeys,
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
    let (_, mac_key) = keys.pair()?;
    let file_header = read_header(keys, source, authenticate)?;

    let end = pos
        .checked_add(length)
        .filter(|&end| end <= file_header.content_length);
    if end.is_none() {
        return Err(CryptoError::DecryptFailed(format!(
            "range {pos}+{length} exceeds content length {}",
            file_header.content_length
        )));
    }

    let start_block = pos / CONTENT_MAC_BLOCK as u64;
    let start_byte = HEADER_LEN as u64 + start_block * FRAME_LEN as u64;
    let mut offset_in_block = (pos - start_block * CONTENT_MAC_BLOCK as u64) as usize;

    source.seek(SeekFrom::Start(start_byte))?;
    let iv = ctr_iv(&file_header.nonce, start_block);
    let mut cipher = Aes256Ctr::new((&*file_header.file_key).into(), (&iv).into());
    let hmac = hmac_sha256(mac_key);

    let mut written = 0u64;
    let mut block = start_block;
    let mut frame = vec![0u8; FRAME_LEN];
    while written < length {
        let n = read_full(source, &mut frame)?;
        if n == 0 {
            break;
        }
        if n < MAC_LEN {
            return Err(CryptoError::DecryptFailed(format!(
                "content block {block} is truncated, missing MAC"
            )));
        }
        let (ciphertext, stored_mac) = frame[..n].split_at(n - MAC_LEN);

        if authenticate {
            let mut mac = hmac.clone();
            mac.update(&file_header.iv);
            mac.update(&block.to_be_bytes());
            mac.update(ciphertext);
            if !bool::from(mac.finalize().into_bytes().as_slice().ct_eq(stored_mac)) {
                return Err(CryptoError::MacAuthFailed {
                    context: format!("content block {block}"),
                });
            }
        }

        let mut plaintext = ciphertext.to_vec();
        cipher.apply_keystream(&mut plaintext);

        let skip = offset_in_block.min(plaintext.len());
        offset_in_block = 0;
        let available = &plaintext[skip..];
        let take = (length - written).min(available.len() as u64) as usize;
        out.write_all(&available[..take])?;
        written += take as u64;
        block += 1;
    }

    Ok(written)
}

/// Cheap length probe: reads only the header. Returns `None` when the source
/// is shorter than a header; the header MAC is always verified.
pub(crate) fn decrypted_content_length<R>(
    keys: &MasterKeys,
    source: &mut R,
) -> CryptoResult<Option<u64>>
where
    R: Read + Seek,
{
    let (primary, mac_key) = keys.pair()?;

    source.seek(SeekFrom::Start(0))?;
    let mut buf = [0u8; HEADER_LEN];
    let n = read_full(source, &mut buf)?;
    if n != HEADER_LEN {
        return Ok(None);
    }
    let file_header = header::decrypt_header(primary, mac_key, &buf, true)?;
    Ok(Some(file_header.content_length))
}

fn read_header<R: Read + Seek>(
    keys: &MasterKeys,
    source: &mut R,
    authenticate: bool,
) -> CryptoResult<FileHeader> {
    let (primary, mac_key) = keys.pair()?;
    source.seek(SeekFrom::Start(0))?;
    let mut buf = [0u8; HEADER_LEN];
    let n = read_full(source, &mut buf)?;
    if n != HEADER_LEN {
        return Err(CryptoError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "failed to read file header",
        )));
    }
    header::decrypt_header(primary, mac_key, &buf, authenticate)
}

/// Read batches of `unit`-sized blocks, ramping the batch size up to
/// [`MAX_BLOCKS_PER_BATCH`], and feed them to the queue in block order.
fn produce_batches<R: Read>(
    reader: &mut R,
    queue: &worker::WorkQueue,
    unit: usize,
    stall_error: impl Fn() -> CryptoError,
) -> CryptoResult<()> {
    let mut first_block = 0u64;
    let mut batch_blocks = 0usize;
    loop {
        if batch_blocks < MAX_BLOCKS_PER_BATCH {
            batch_blocks += 1;
        }
        let capacity = batch_blocks * unit;
        let mut buf = vec![0u8; capacity];
        let n = read_full(reader, &mut buf)?;
        if n == 0 {
            return Ok(());
        }
        buf.truncate(n);

        let block_count = n.div_ceil(unit);
        let batch = BlocksData {
            data: buf,
            first_block,
            block_count,
        };
        match queue.offer(batch, OFFER_TIMEOUT) {
            OfferOutcome::Accepted => {}
            OfferOutcome::Closed => return Ok(()),
            OfferOutcome::TimedOut => return Err(stall_error()),
        }

        if n < capacity {
            return Ok(());
        }
        first_block += block_count as u64;
    }
}

/// Fill `buf` as far as possible; EOF may leave it short.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
