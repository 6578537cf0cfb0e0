//! One `Content-Range` PUT at a time.
//!
//! [`ChunkUploader`] owns the committed offset of a resumable upload
//! session and pushes buffers at it, absorbing partial commits: when the
//! server acknowledges fewer bytes than were sent, the committed prefix is
//! kept and the tail is resent.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes};
use futures_util::stream;
use tracing::debug;

use crate::error::{Error, Result, ServerCode};
use crate::net::{BodyStream, HttpClient, ResponseMeta};
use crate::neterr::is_network_error;
use crate::retry::{RetryContext, RetrySettings};

/// Resumable upload granularity. Every non-terminal PUT carries a
/// multiple of this.
pub const BLOCK_SIZE: usize = 256 * 1024;

/// Largest number of blocks aggregated into one PUT (64 blocks = 16 MiB).
pub const MAX_CHUNK_GROUP: usize = 64;

/// Slice size for streaming a PUT body out, and the progress granularity.
const SEND_SLICE: usize = 64 * 1024;

pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;
pub(crate) type ProgressSlot = Arc<Mutex<Option<ProgressFn>>>;

/// Outcome classification of a resumable-upload PUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GcsStatus {
    /// Upload complete; only valid on the terminal PUT.
    Complete,
    /// Resume incomplete; a `Range` response header reports the committed
    /// prefix.
    Resume,
    /// Ambiguous server-side condition; issue a status query.
    NeedQuery,
    Error,
}

pub(crate) fn interpret_status(status: u16) -> GcsStatus {
    match status {
        200 | 201 => GcsStatus::Complete,
        308 => GcsStatus::Resume,
        500..=599 => GcsStatus::NeedQuery,
        _ => GcsStatus::Error,
    }
}

/// A committed byte range, end-exclusive.
///
/// The wire carries an inclusive last byte (`Range: bytes=0-1023` means
/// 1024 bytes); parsing normalizes to an exclusive end so arithmetic on
/// committed counts stays plain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Lenient parse of a committed-range header. Accepts `bytes=a-b`,
/// `bytes a-b`, and `a-b/total`; anything else fails cleanly.
pub(crate) fn parse_range_header(value: &str) -> Result<ByteRange> {
    let bad = || Error::Protocol(format!("malformed range header {value:?}"));

    let v = value.trim();
    let v = match v.strip_prefix("bytes") {
        Some(rest) => rest.trim_start_matches(['=', ' ']),
        None => v,
    };
    let v = v.split('/').next().unwrap_or_default().trim();

    let (start, last) = v.split_once('-').ok_or_else(bad)?;
    let start: u64 = start.trim().parse().map_err(|_| bad())?;
    let last: u64 = last.trim().parse().map_err(|_| bad())?;
    if last < start {
        return Err(bad());
    }
    Ok(ByteRange {
        start,
        end: last + 1,
    })
}

/// Outcome of one PUT attempt, before retry policy is applied.
enum PutOutcome {
    /// The whole buffer was committed.
    Accepted,
    /// Only the first `n` bytes were committed (possibly zero); resend the
    /// rest.
    Committed(u64),
    /// Transport failure; retriable.
    Net(Error),
    Fatal(Error),
}

pub(crate) struct ChunkUploader<C> {
    upload_url: String,
    client: C,
    /// Bytes the server has durably acknowledged.
    offset: u64,
    retry: RetrySettings,
    progress: ProgressSlot,
    /// High-water mark so progress callbacks stay monotonic across
    /// partial-commit resends.
    reported: Arc<AtomicU64>,
}

impl<C: HttpClient> ChunkUploader<C> {
    pub(crate) fn new(
        upload_url: String,
        client: C,
        retry: RetrySettings,
        progress: ProgressSlot,
    ) -> Self {
        Self {
            upload_url,
            client,
            offset: 0,
            retry,
            progress,
            reported: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Upload `buf`, which on a non-terminal call must be a whole number
    /// of blocks. Advances the committed offset by `buf.len()` on success.
    pub(crate) async fn put(&mut self, mut buf: Bytes, last: bool) -> Result<()> {
        let mut retry = RetryContext::new(self.retry.clone());

        while retry.should_try() {
            match self.try_put(buf.clone(), last).await {
                PutOutcome::Accepted => {
                    self.offset += buf.len() as u64;
                    return Ok(());
                }
                PutOutcome::Committed(n) => {
                    self.offset += n;
                    buf.advance(n as usize);
                    retry
                        .retry(Error::Protocol(format!(
                            "server committed {n} of {} bytes",
                            buf.len() as u64 + n
                        )))
                        .await;
                }
                PutOutcome::Net(e) => retry.retry(e).await,
                PutOutcome::Fatal(e) => return Err(e),
            }
        }

        Err(retry.into_exhausted())
    }

    async fn try_put(&self, buf: Bytes, last: bool) -> PutOutcome {
        let len = buf.len() as u64;
        if !last && buf.len() % BLOCK_SIZE != 0 {
            return PutOutcome::Fatal(Error::Protocol(format!(
                "non-terminal upload of {len} bytes is not a multiple of the {BLOCK_SIZE} block size"
            )));
        }

        let content_range = if last {
            let total = self.offset + len;
            if len == 0 {
                // finalize an upload whose size is an exact multiple of
                // the block group
                format!("bytes */{total}")
            } else {
                format!("bytes {}-{}/{}", self.offset, self.offset + len - 1, total)
            }
        } else {
            format!("bytes {}-{}/*", self.offset, self.offset + len - 1)
        };

        debug!(len, last, %content_range, "uploading chunk");

        let response = self
            .client
            .put(
                &self.upload_url,
                &[("content-range".to_string(), content_range)],
                self.progress_body(buf),
                len,
            )
            .await;
        let mut meta = match response {
            Ok(r) => r.meta,
            Err(e) if is_network_error(&e) => return PutOutcome::Net(e),
            Err(e) => return PutOutcome::Fatal(e),
        };
        let mut status = interpret_status(meta.status);
        // a 308 without the committed-range header is not a usable resume
        // ack; ask the server where things stand, same as for a 5xx
        if status == GcsStatus::Resume && meta.header("range").is_none() {
            status = GcsStatus::NeedQuery;
        }
        if status == GcsStatus::NeedQuery {
            debug!(status = meta.status, "need to query upload status");
            meta = match self.query_status().await {
                Ok(m) => m,
                Err(e) => return PutOutcome::Fatal(e),
            };
            if interpret_status(meta.status) == GcsStatus::Resume {
                status = GcsStatus::Resume;
            } else {
                return PutOutcome::Fatal(Error::Protocol(format!(
                    "expected upload status, got HTTP {}",
                    meta.status
                )));
            }
        }

        match status {
            GcsStatus::Complete if last => {
                debug!("upload complete");
                PutOutcome::Accepted
            }
            GcsStatus::Complete => PutOutcome::Fatal(Error::Protocol(format!(
                "got HTTP {} on a non-terminal upload",
                meta.status
            ))),
            GcsStatus::Resume => self.interpret_resume(&meta, len),
            _ => PutOutcome::Fatal(Error::Server {
                host: self.host(),
                status: meta.status,
                message: format!("HTTP {} while uploading", meta.status),
                code: ServerCode::Unknown,
            }),
        }
    }

    /// Decode a resume acknowledgement against what was just sent. The
    /// headerless case is only reachable with a queried response, where a
    /// bare 308 means the server holds nothing yet.
    fn interpret_resume(&self, meta: &ResponseMeta, sent: u64) -> PutOutcome {
        let expected = self.offset + sent;
        let Some(header) = meta.header("range") else {
            debug!("nothing committed yet, retrying whole buffer");
            return PutOutcome::Committed(0);
        };
        let committed = match parse_range_header(header) {
            Ok(r) => r,
            Err(e) => return PutOutcome::Fatal(e),
        };
        if committed.start != 0 {
            return PutOutcome::Fatal(Error::Protocol(format!(
                "committed range does not start at zero: {committed}"
            )));
        }

        if committed.end == expected {
            debug!(blocks = sent / BLOCK_SIZE as u64, "commit succeeded");
            return PutOutcome::Accepted;
        }
        if committed.end < self.offset {
            return PutOutcome::Fatal(Error::Protocol(format!(
                "server lost acknowledged bytes: committed {committed}, offset {}",
                self.offset
            )));
        }
        if committed.end > expected {
            return PutOutcome::Fatal(Error::Protocol(format!(
                "server committed past what was sent: {committed}, expected end {expected}"
            )));
        }

        let delta = committed.end - self.offset;
        if delta > 0 {
            debug!(delta, sent, "commit partially succeeded");
        } else {
            debug!("commit failed, retrying whole buffer");
        }
        PutOutcome::Committed(delta)
    }

    /// `PUT` with `Content-Range: bytes */*` until the server reports the
    /// committed range.
    async fn query_status(&self) -> Result<ResponseMeta> {
        debug!("querying upload status");
        let mut retry = RetryContext::new(self.retry.clone());

        while retry.should_try() {
            match self.try_query_status().await {
                Ok(meta) => return Ok(meta),
                Err(e) => {
                    debug!(error = %e, "status query failed");
                    retry.retry(e).await;
                }
            }
        }

        Err(retry.into_exhausted())
    }

    async fn try_query_status(&self) -> Result<ResponseMeta> {
        let body: BodyStream = Box::pin(stream::empty());
        let response = self
            .client
            .put(
                &self.upload_url,
                &[("content-range".to_string(), "bytes */*".to_string())],
                body,
                0,
            )
            .await?;
        if interpret_status(response.meta.status) == GcsStatus::Resume {
            Ok(response.meta)
        } else {
            Err(Error::Protocol(format!(
                "while querying upload status, got HTTP {}",
                response.meta.status
            )))
        }
    }

    /// Body stream that reports `offset + bytes_sent` to the progress
    /// listener as slices go out, clamped to the high-water mark so
    /// resends never report regress.
    fn progress_body(&self, buf: Bytes) -> BodyStream {
        let base = self.offset;
        let progress = self.progress.clone();
        let reported = self.reported.clone();

        Box::pin(stream::unfold((buf, 0u64), move |(mut rest, sent)| {
            let progress = progress.clone();
            let reported = reported.clone();
            async move {
                if rest.is_empty() {
                    return None;
                }
                let chunk = rest.split_to(rest.len().min(SEND_SLICE));
                let sent = sent + chunk.len() as u64;
                let mark = base + sent;
                if reported.fetch_max(mark, Ordering::Relaxed) < mark {
                    if let Some(listener) = progress.lock().unwrap().as_ref() {
                        listener(mark);
                    }
                }
                Some((Ok(chunk), (rest, sent)))
            }
        }))
    }

    fn host(&self) -> String {
        url::Url::parse(&self.upload_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_forms() {
        let expected = ByteRange { start: 0, end: 1024 };
        assert_eq!(parse_range_header("bytes=0-1023").unwrap(), expected);
        assert_eq!(parse_range_header("bytes 0-1023").unwrap(), expected);
        assert_eq!(parse_range_header("0-1023/4096").unwrap(), expected);
        assert_eq!(parse_range_header("bytes=0-1023/4096").unwrap(), expected);
        assert_eq!(
            parse_range_header(" bytes=512-1023 ").unwrap(),
            ByteRange {
                start: 512,
                end: 1024
            }
        );
    }

    #[test]
    fn range_header_rejects_garbage() {
        for bad in ["", "bytes", "bytes=-", "bytes=a-b", "1024", "bytes=9-3"] {
            assert!(
                parse_range_header(bad).is_err(),
                "expected {bad:?} to fail"
            );
        }
    }

    #[test]
    fn status_interpretation() {
        assert_eq!(interpret_status(200), GcsStatus::Complete);
        assert_eq!(interpret_status(201), GcsStatus::Complete);
        assert_eq!(interpret_status(308), GcsStatus::Resume);
        assert_eq!(interpret_status(500), GcsStatus::NeedQuery);
        assert_eq!(interpret_status(503), GcsStatus::NeedQuery);
        assert_eq!(interpret_status(400), GcsStatus::Error);
        assert_eq!(interpret_status(404), GcsStatus::Error);
    }
}
