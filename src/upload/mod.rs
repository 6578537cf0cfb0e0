//! Resumable chunked uploads.
//!
//! [`ResumableUpload`] is a single-writer streaming sink over a
//! pre-minted resumable session URL. Writes fill a 256 KiB split buffer;
//! full blocks travel over a bounded channel to one background worker,
//! which aggregates up to 64 of them into a single `Content-Range` PUT.
//! [`close`](ResumableUpload::close) flushes the tail block and waits for
//! the worker; afterwards either every byte is durably uploaded or the
//! worker's error is surfaced.

mod chunk;

use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::net::HttpClient;
use crate::retry::RetrySettings;

use chunk::ChunkUploader;
pub use chunk::{ProgressFn, BLOCK_SIZE, MAX_CHUNK_GROUP};

/// Retry budget for each chunk PUT and each status query.
const UPLOAD_MAX_TRIES: u32 = 10;

/// A unit of upload: one block's bytes plus the terminal marker. All
/// non-terminal blocks are exactly [`BLOCK_SIZE`] long; the terminal block
/// may be shorter or empty.
struct Block {
    data: Bytes,
    last: bool,
}

type ErrorLatch = Arc<Mutex<Option<Error>>>;

/// Streaming writer for a GCS-style resumable upload session.
///
/// Single-producer: one caller writes, one background worker uploads.
/// After the worker records an error, every subsequent `write` and the
/// final `close` surface that same error; no further bytes are accepted.
/// Dropping the writer without closing abandons the session without
/// finalizing it.
pub struct ResumableUpload {
    split: BytesMut,
    blocks: Option<mpsc::Sender<Block>>,
    cancel: watch::Sender<bool>,
    error: ErrorLatch,
    worker: Option<JoinHandle<()>>,
    progress: chunk::ProgressSlot,
}

impl ResumableUpload {
    /// Start a session against `upload_url` with the default transport.
    #[cfg(feature = "reqwest")]
    pub fn new(upload_url: impl Into<String>) -> Self {
        Self::with_client(upload_url, crate::net::ReqwestClient::new())
    }

    /// Start a session with a caller-supplied transport. Spawns the
    /// worker task immediately.
    pub fn with_client<C>(upload_url: impl Into<String>, client: C) -> Self
    where
        C: HttpClient + 'static,
    {
        let (blocks_tx, blocks_rx) = mpsc::channel(MAX_CHUNK_GROUP);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let error: ErrorLatch = Arc::new(Mutex::new(None));
        let progress: chunk::ProgressSlot = Arc::new(Mutex::new(None));

        let uploader = ChunkUploader::new(
            upload_url.into(),
            client,
            RetrySettings::default().max_tries(UPLOAD_MAX_TRIES),
            progress.clone(),
        );
        let worker = tokio::spawn(run_worker(blocks_rx, cancel_rx, uploader, error.clone()));

        Self {
            split: BytesMut::with_capacity(BLOCK_SIZE),
            blocks: Some(blocks_tx),
            cancel: cancel_tx,
            error,
            worker: Some(worker),
            progress,
        }
    }

    /// Observe upload progress as a count of bytes sent so far. Counts
    /// are monotonically non-decreasing.
    pub fn set_progress_listener(&self, listener: impl Fn(u64) + Send + Sync + 'static) {
        *self.progress.lock().unwrap() = Some(Arc::new(listener));
    }

    /// Buffer `buf`, flushing full blocks to the worker. Returns the
    /// number of bytes accepted (always `buf.len()` unless the upload has
    /// failed).
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if let Some(e) = self.latched() {
            self.signal_cancel();
            return Err(e);
        }
        if self.blocks.is_none() {
            return Err(Error::Canceled);
        }

        let mut written = 0;
        while written < buf.len() {
            let avail = BLOCK_SIZE - self.split.len();
            if avail == 0 {
                self.flush_block(false).await?;
                continue;
            }
            let n = avail.min(buf.len() - written);
            self.split.extend_from_slice(&buf[written..written + n]);
            written += n;
        }

        Ok(written)
    }

    /// Flush the tail block, signal no more input, and wait for the
    /// worker to drain. Surfaces the worker's error, if any.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(e) = self.latched() {
            self.signal_cancel();
            return Err(e);
        }
        if self.blocks.is_none() {
            // already closed cleanly
            return Ok(());
        }

        let flushed = self.flush_block(true).await;
        self.blocks = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }

        if let Some(e) = self.latched() {
            return Err(e);
        }
        flushed
    }

    async fn flush_block(&mut self, last: bool) -> Result<()> {
        let block = Block {
            data: self.split.split().freeze(),
            last,
        };
        let Some(blocks) = &self.blocks else {
            return Err(self.latched().unwrap_or(Error::Canceled));
        };
        if blocks.send(block).await.is_err() {
            // worker is gone; its error, if it managed to record one, is
            // the real story
            let e = self.latched().unwrap_or(Error::Canceled);
            self.signal_cancel();
            return Err(e);
        }
        Ok(())
    }

    fn latched(&self) -> Option<Error> {
        self.error.lock().unwrap().clone()
    }

    fn signal_cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

impl Drop for ResumableUpload {
    fn drop(&mut self) {
        // dropping without close(): stop the worker instead of letting the
        // closed channel read as a terminal flush
        if self.blocks.is_some() {
            self.signal_cancel();
        }
    }
}

/// The single consumer: receive one block (or cancel, or end of input),
/// opportunistically aggregate more, PUT, repeat. The terminal PUT is the
/// only one sent with the last flag.
async fn run_worker<C: HttpClient>(
    mut blocks: mpsc::Receiver<Block>,
    mut cancel: watch::Receiver<bool>,
    mut uploader: ChunkUploader<C>,
    error: ErrorLatch,
) {
    let mut send_buf = BytesMut::with_capacity(MAX_CHUNK_GROUP * BLOCK_SIZE);

    'scan: loop {
        let mut group = 0usize;

        if send_buf.is_empty() {
            tokio::select! {
                _ = cancel.changed() => return,
                block = blocks.recv() => match block {
                    // a closed channel with cancel raised is an abandoned
                    // upload, not a flush
                    None if *cancel.borrow() => return,
                    None => break 'scan,
                    Some(block) => {
                        send_buf.extend_from_slice(&block.data);
                        group += 1;
                        if block.last {
                            break 'scan;
                        }
                    }
                }
            }
        }

        // gather whatever else is already queued
        while group < MAX_CHUNK_GROUP {
            if *cancel.borrow() {
                return;
            }
            match blocks.try_recv() {
                Ok(block) => {
                    send_buf.extend_from_slice(&block.data);
                    group += 1;
                    if block.last {
                        break 'scan;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if *cancel.borrow() {
                        return;
                    }
                    break 'scan;
                }
            }
        }

        debug!(blocks = group, bytes = send_buf.len(), "uploading chunk group");
        if let Err(e) = uploader.put(send_buf.split().freeze(), false).await {
            warn!(error = %e, "upload failed");
            *error.lock().unwrap() = Some(e);
            return;
        }
    }

    debug!(bytes = send_buf.len(), "uploading final chunk group");
    if let Err(e) = uploader.put(send_buf.split().freeze(), true).await {
        warn!(error = %e, "final upload failed");
        *error.lock().unwrap() = Some(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_constants_line_up() {
        assert_eq!(BLOCK_SIZE, 256 * 1024);
        assert_eq!(MAX_CHUNK_GROUP * BLOCK_SIZE, 16 * 1024 * 1024);
    }
}
