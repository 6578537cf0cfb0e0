//! One live ranged GET.

use futures_util::StreamExt;
use std::time::Duration;
use tokio::time::Instant;

use crate::backtracker::{Backtracker, CacheStats};
use crate::error::{Error, Result, ServerCode};
use crate::net::{BodyStream, HttpClient, ResponseMeta};

use super::UrlSource;

/// Largest error body kept for a server-error message.
const ERROR_BODY_LIMIT: usize = 64 * 1024;

/// A pooled connection: one in-flight GET body wrapped in a
/// [`Backtracker`], tagged with its id and last-touched time.
pub(crate) struct Connection {
    id: u64,
    touched_at: Instant,
    bt: Backtracker<BodyStream>,
    meta: ResponseMeta,
}

impl Connection {
    /// Single connect attempt at `offset`: issue the ranged GET and
    /// classify the response. Retry and renewal policy live with the
    /// caller.
    pub(crate) async fn establish<C, U>(
        id: u64,
        client: &C,
        source: &U,
        url: &str,
        offset: u64,
        max_discard: usize,
    ) -> Result<Self>
    where
        C: HttpClient,
        U: UrlSource,
    {
        let range = format!("bytes={offset}-");
        let response = client
            .get(url, &[("range".to_string(), range)])
            .await?;
        let meta = response.meta;

        if meta.status == 200 && offset > 0 {
            return Err(Error::Server {
                host: meta.host(),
                status: meta.status,
                message: "HTTP Range header not supported".to_string(),
                code: ServerCode::NoRangeSupport,
            });
        }

        if !meta.is_success() {
            let body = read_error_body(response.body).await;
            if source.needs_renewal(&meta, &body) {
                return Err(Error::NeedsRenewal {
                    url: url.to_string(),
                });
            }
            return Err(Error::Server {
                host: meta.host(),
                status: meta.status,
                message: format!("HTTP {}: {}", meta.status, String::from_utf8_lossy(&body)),
                code: ServerCode::Unknown,
            });
        }

        Ok(Self {
            id,
            touched_at: Instant::now(),
            bt: Backtracker::new(offset, response.body, max_discard),
            meta,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn meta(&self) -> &ResponseMeta {
        &self.meta
    }

    pub(crate) fn is_stale(&self, threshold: Duration) -> bool {
        self.touched_at.elapsed() > threshold
    }

    pub(crate) fn touch(&mut self) {
        self.touched_at = Instant::now();
    }

    /// Upstream position of the wrapped body.
    pub(crate) fn position(&self) -> u64 {
        self.bt.offset()
    }

    /// The position the next read would serve from, accounting for a
    /// pending backtrack. The pool matches on this.
    pub(crate) fn virtual_position(&self) -> u64 {
        self.bt.virtual_offset()
    }

    pub(crate) fn cached(&self) -> u64 {
        self.bt.cached()
    }

    pub(crate) fn backtracker(&mut self) -> &mut Backtracker<BodyStream> {
        &mut self.bt
    }

    pub(crate) fn take_cache_stats(&mut self) -> CacheStats {
        self.bt.take_stats()
    }
}

/// Best-effort collection of a non-2xx body, for the renewal predicate and
/// error messages.
async fn read_error_body(mut body: BodyStream) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                let room = ERROR_BODY_LIMIT - out.len().min(ERROR_BODY_LIMIT);
                out.extend_from_slice(&bytes[..bytes.len().min(room)]);
                if out.len() >= ERROR_BODY_LIMIT {
                    break;
                }
            }
            Err(_) => {
                if out.is_empty() {
                    out.extend_from_slice(b"could not read error body");
                }
                break;
            }
        }
    }
    out
}
