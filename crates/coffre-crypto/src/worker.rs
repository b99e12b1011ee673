//! Parallel block pipeline with ordered commits
//!
//! `encrypt_file` and `decrypt_file` split work into batches of consecutive
//! content blocks. A pool of OS threads pulls batches from a bounded queue
//! and runs the ciphers concurrently, but output is committed to the sink
//! strictly in block-index order: a worker holds its finished batch until the
//! shared commit counter reaches its first block, writes under the lock, then
//! advances the counter and wakes the other workers.
//!
//! The producer's enqueue is bounded. If the queue stays full past the
//! timeout the pipeline reports a stall instead of truncating the stream.
//! The first worker error wins; remaining batches are drained unprocessed.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::Duration;

use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::Mac;
use subtle::ConstantTimeEq;
use tracing::warn;
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};
use crate::{
    ctr_iv, hmac_sha256, Aes256Ctr, HmacSha256, AES_BLOCK_LEN, CONTENT_MAC_BLOCK, FILE_KEY_LEN,
    FILE_NONCE_LEN, MAC_LEN, MASTER_KEY_LEN,
};

/// How long the producer waits for queue space before declaring a stall.
pub(crate) const OFFER_TIMEOUT: Duration = Duration::from_secs(1);

/// Batches ramp up from one block to this many per enqueue, amortizing queue
/// contention while keeping per-batch memory bounded.
pub(crate) const MAX_BLOCKS_PER_BATCH: usize = 64;

/// A run of consecutive content blocks read from the input.
pub(crate) struct BlocksData {
    pub data: Vec<u8>,
    pub first_block: u64,
    pub block_count: usize,
}

/// One direction of the pipeline. A processor owns its copy of the file key
/// and a keyed HMAC; `process` turns a batch into the bytes to commit.
pub(crate) trait BlockProcessor: Send {
    fn process(&mut self, batch: &BlocksData) -> CryptoResult<Vec<u8>>;
}

/// Encrypts plaintext batches into `ciphertext ‖ MAC` frames.
pub(crate) struct EncryptProcessor {
    file_key: Zeroizing<[u8; FILE_KEY_LEN]>,
    header_iv: [u8; AES_BLOCK_LEN],
    nonce: [u8; FILE_NONCE_LEN],
    hmac: HmacSha256,
}

impl EncryptProcessor {
    pub fn new(
        file_key: &[u8; FILE_KEY_LEN],
        mac_key: &[u8; MASTER_KEY_LEN],
        header_iv: [u8; AES_BLOCK_LEN],
        nonce: [u8; FILE_NONCE_LEN],
    ) -> Self {
        Self {
            file_key: Zeroizing::new(*file_key),
            header_iv,
            nonce,
            hmac: hmac_sha256(mac_key),
        }
    }
}

impl BlockProcessor for EncryptProcessor {
    fn process(&mut self, batch: &BlocksData) -> CryptoResult<Vec<u8>> {
        let iv = ctr_iv(&self.nonce, batch.first_block);
        let mut cipher = Aes256Ctr::new((&*self.file_key).into(), (&iv).into());

        let mut out = Vec::with_capacity(batch.data.len() + batch.block_count * MAC_LEN);
        for (i, chunk) in batch.data.chunks(CONTENT_MAC_BLOCK).enumerate() {
            let block = batch.first_block + i as u64;
            let mut ciphertext = chunk.to_vec();
            cipher.apply_keystream(&mut ciphertext);

            let mut mac = self.hmac.clone();
            mac.update(&self.header_iv);
            mac.update(&block.to_be_bytes());
            mac.update(&ciphertext);

            out.extend_from_slice(&ciphertext);
            out.extend_from_slice(&mac.finalize().into_bytes());
        }
        Ok(out)
    }
}

/// Verifies and decrypts `ciphertext ‖ MAC` frames back into plaintext.
pub(crate) struct DecryptProcessor {
    file_key: Zeroizing<[u8; FILE_KEY_LEN]>,
    header_iv: [u8; AES_BLOCK_LEN],
    nonce: [u8; FILE_NONCE_LEN],
    hmac: HmacSha256,
    authenticate: bool,
}

impl DecryptProcessor {
    pub fn new(
        file_key: &[u8; FILE_KEY_LEN],
        mac_key: &[u8; MASTER_KEY_LEN],
        header_iv: [u8; AES_BLOCK_LEN],
        nonce: [u8; FILE_NONCE_LEN],
        authenticate: bool,
    ) -> Self {
        Self {
            file_key: Zeroizing::new(*file_key),
            header_iv,
            nonce,
            hmac: hmac_sha256(mac_key),
            authenticate,
        }
    }
}

impl BlockProcessor for DecryptProcessor {
    fn process(&mut self, batch: &BlocksData) -> CryptoResult<Vec<u8>> {
        let iv = ctr_iv(&self.nonce, batch.first_block);
        let mut cipher = Aes256Ctr::new((&*self.file_key).into(), (&iv).into());

        let mut out = Vec::with_capacity(batch.data.len());
        for (i, frame) in batch.data.chunks(CONTENT_MAC_BLOCK + MAC_LEN).enumerate() {
            let block = batch.first_block + i as u64;
            if frame.len() < MAC_LEN {
                return Err(CryptoError::DecryptFailed(format!(
                    "content block {block} is truncated, missing MAC"
                )));
            }
            let (ciphertext, stored_mac) = frame.split_at(frame.len() - MAC_LEN);

            if self.authenticate {
                let mut mac = self.hmac.clone();
                mac.update(&self.header_iv);
                mac.update(&block.to_be_bytes());
                mac.update(ciphertext);
                if !bool::from(mac.finalize().into_bytes().as_slice().ct_eq(stored_mac)) {
                    warn!(block, "content MAC verification failed");
                    return Err(CryptoError::MacAuthFailed {
                        context: format!("content block {block}"),
                    });
                }
            }

            let start = out.len();
            out.extend_from_slice(ciphertext);
            cipher.apply_keystream(&mut out[start..]);
        }
        Ok(out)
    }
}

/// Producer-side result of a bounded enqueue.
pub(crate) enum OfferOutcome {
    Accepted,
    /// The pipeline shut down (worker failure); stop producing.
    Closed,
    /// The queue stayed full past the timeout.
    TimedOut,
}

struct QueueState {
    items: VecDeque<BlocksData>,
    closed: bool,
}

/// Fixed-capacity batch queue shared between the producer and the pool.
pub(crate) struct WorkQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl WorkQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn offer(&self, batch: BlocksData, timeout: Duration) -> OfferOutcome {
        let state = self.state.lock().expect("work queue lock poisoned");
        let (mut state, wait) = self
            .not_full
            .wait_timeout_while(state, timeout, |s| {
                !s.closed && s.items.len() >= self.capacity
            })
            .expect("work queue lock poisoned");
        if state.closed {
            return OfferOutcome::Closed;
        }
        if wait.timed_out() {
            return OfferOutcome::TimedOut;
        }
        state.items.push_back(batch);
        self.not_empty.notify_one();
        OfferOutcome::Accepted
    }

    /// Worker side; `None` once the queue is closed and drained.
    fn take(&self) -> Option<BlocksData> {
        let state = self.state.lock().expect("work queue lock poisoned");
        let mut state = self
            .not_empty
            .wait_while(state, |s| s.items.is_empty() && !s.closed)
            .expect("work queue lock poisoned");
        let item = state.items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    fn close(&self) {
        let mut state = self.state.lock().expect("work queue lock poisoned");
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

struct CommitState {
    current_block: u64,
    aborted: bool,
}

/// The shared `(current_block, condvar)` pair enforcing commit order.
struct CommitGate {
    state: Mutex<CommitState>,
    advanced: Condvar,
}

impl CommitGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(CommitState {
                current_block: 0,
                aborted: false,
            }),
            advanced: Condvar::new(),
        }
    }

    /// Block until `first_block` is next to commit; false when aborted.
    fn await_turn(&self, first_block: u64) -> bool {
        let state = self.state.lock().expect("commit gate lock poisoned");
        let state = self
            .advanced
            .wait_while(state, |s| !s.aborted && s.current_block != first_block)
            .expect("commit gate lock poisoned");
        !state.aborted
    }

    fn advance(&self, blocks: usize) {
        let mut state = self.state.lock().expect("commit gate lock poisoned");
        state.current_block += blocks as u64;
        self.advanced.notify_all();
    }

    fn abort(&self) {
        let mut state = self.state.lock().expect("commit gate lock poisoned");
        state.aborted = true;
        self.advanced.notify_all();
    }
}

/// Drive a full pipeline: spawn one worker per processor, run `produce` on
/// the calling thread to feed the queue, then join the pool.
///
/// The first worker error takes precedence over a producer error, matching
/// the "surface the first failure, drain the rest" contract.
pub(crate) fn run_pipeline<P, W, F>(processors: Vec<P>, sink: &mut W, produce: F) -> CryptoResult<()>
where
    P: BlockProcessor,
    W: Write + Send + ?Sized,
    F: FnOnce(&WorkQueue) -> CryptoResult<()>,
{
    let queue = WorkQueue::new(processors.len().max(2));
    let gate = CommitGate::new();
    let failure: Mutex<Option<CryptoError>> = Mutex::new(None);
    let sink = Mutex::new(sink);

    let produced = thread::scope(|scope| {
        for mut processor in processors {
            let queue = &queue;
            let gate = &gate;
            let failure = &failure;
            let sink = &sink;
            scope.spawn(move || worker_loop(&mut processor, queue, gate, failure, sink));
        }
        let result = produce(&queue);
        queue.close();
        result
    });

    if let Some(err) = failure.into_inner().expect("failure slot lock poisoned") {
        return Err(err);
    }
    produced
}

fn worker_loop<P: BlockProcessor, W: Write + ?Sized>(
    processor: &mut P,
    queue: &WorkQueue,
    gate: &CommitGate,
    failure: &Mutex<Option<CryptoError>>,
    sink: &Mutex<&mut W>,
) {
    while let Some(batch) = queue.take() {
        if failure.lock().expect("failure slot lock poisoned").is_some() {
            // drain mode: the pipeline already failed
            continue;
        }

        let out = match processor.process(&batch) {
            Ok(out) => out,
            Err(err) => {
                record_failure(failure, err);
                gate.abort();
                queue.close();
                continue;
            }
        };

        if !gate.await_turn(batch.first_block) {
            continue;
        }
        let committed = sink
            .lock()
            .expect("sink lock poisoned")
            .write_all(&out);
        match committed {
            Ok(()) => gate.advance(batch.block_count),
            Err(err) => {
                record_failure(failure, err.into());
                gate.abort();
                queue.close();
            }
        }
    }
}

fn record_failure(failure: &Mutex<Option<CryptoError>>, err: CryptoError) {
    let mut slot = failure.lock().expect("failure slot lock poisoned");
    if slot.is_none() {
        *slot = Some(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Passes batch data through unchanged; optionally fails on one block.
    struct PassthroughProcessor {
        fail_at: Option<u64>,
    }

    impl BlockProcessor for PassthroughProcessor {
        fn process(&mut self, batch: &BlocksData) -> CryptoResult<Vec<u8>> {
            if let Some(block) = self.fail_at {
                let range = batch.first_block..batch.first_block + batch.block_count as u64;
                if range.contains(&block) {
                    return Err(CryptoError::DecryptFailed(format!(
                        "injected failure at block {block}"
                    )));
                }
            }
            Ok(batch.data.clone())
        }
    }

    fn feed_batches(queue: &WorkQueue, batches: Vec<Vec<u8>>) -> CryptoResult<()> {
        let mut first_block = 0u64;
        for data in batches {
            let block_count = data.len(); // one byte per "block" in these tests
            let batch = BlocksData {
                data,
                first_block,
                block_count,
            };
            first_block += block_count as u64;
            match queue.offer(batch, OFFER_TIMEOUT) {
                OfferOutcome::Accepted => {}
                OfferOutcome::Closed => break,
                OfferOutcome::TimedOut => {
                    return Err(CryptoError::EncryptFailed("stalled".into()))
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_output_is_committed_in_order() {
        // enough batches that out-of-order commits would be near-certain
        // if the gate were broken
        let batches: Vec<Vec<u8>> = (0..200u16)
            .map(|i| vec![(i % 251) as u8; 3])
            .collect();
        let expected: Vec<u8> = batches.iter().flatten().copied().collect();

        let processors = (0..4)
            .map(|_| PassthroughProcessor { fail_at: None })
            .collect();
        let mut sink = Vec::new();
        run_pipeline(processors, &mut sink, |queue| {
            feed_batches(queue, batches.clone())
        })
        .unwrap();

        assert_eq!(sink, expected);
    }

    #[test]
    fn test_single_worker_pipeline() {
        let batches = vec![vec![1u8, 2, 3], vec![4, 5], vec![6]];
        let processors = vec![PassthroughProcessor { fail_at: None }];
        let mut sink = Vec::new();
        run_pipeline(processors, &mut sink, |queue| feed_batches(queue, batches)).unwrap();
        assert_eq!(sink, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_worker_error_is_surfaced() {
        let batches: Vec<Vec<u8>> = (0..50u8).map(|i| vec![i; 2]).collect();
        let processors = (0..4)
            .map(|_| PassthroughProcessor { fail_at: Some(20) })
            .collect();

        let mut sink = Vec::new();
        let result = run_pipeline(processors, &mut sink, |queue| {
            feed_batches(queue, batches)
        });

        match result {
            Err(CryptoError::DecryptFailed(msg)) => {
                assert!(msg.contains("injected failure"), "unexpected error: {msg}")
            }
            other => panic!("expected injected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_input_produces_empty_output() {
        let processors = (0..2)
            .map(|_| PassthroughProcessor { fail_at: None })
            .collect();
        let mut sink = Vec::new();
        run_pipeline(processors, &mut sink, |_queue| Ok(())).unwrap();
        assert!(sink.is_empty());
    }
}
