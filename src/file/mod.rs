//! A remote resource as a seekable, read-only file.
//!
//! [`File`] keeps a small pool of live ranged-GET connections and matches
//! incoming [`read_at`](File::read_at) calls against them by locality:
//! a connection slightly behind the wanted offset is fast-forwarded by
//! discarding, one slightly ahead is rewound through its
//! [`Backtracker`](crate::backtracker::Backtracker) window. Connections
//! idle past the stale threshold are closed. Expired signed URLs are
//! renewed through the consumer's [`UrlSource`].

mod conn;

use std::collections::HashMap;
use std::future::Future;
use std::io::SeekFrom;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::backtracker::CacheStats;
use crate::error::{Error, Result};
use crate::net::{HttpClient, ResponseMeta};
use crate::neterr::should_retry;
use crate::retry::{RetryContext, RetrySettings};

use conn::Connection;

/// Forward byte tolerance for reusing a connection; also each
/// connection's rewind window size.
pub const DEFAULT_MAX_DISCARD: usize = 1024 * 1024;

/// Idle time after which a pooled connection is closed instead of reused.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(10);

/// Consecutive renewal demands tolerated within one connect.
const MAX_RENEWALS: u32 = 5;

/// Where download URLs come from and when they are worn out.
///
/// `fetch_url` may mint a fresh short-lived signed URL; it is expected to
/// handle its own retrying. `needs_renewal` inspects a failed response and
/// decides whether the URL expired (as opposed to the server being down).
pub trait UrlSource: Send + Sync {
    fn fetch_url(&self) -> impl Future<Output = Result<String>> + Send;

    fn needs_renewal(&self, meta: &ResponseMeta, body: &[u8]) -> bool;
}

/// The trivial source: a fixed URL that never expires.
pub struct StaticUrl(pub String);

impl UrlSource for StaticUrl {
    async fn fetch_url(&self) -> Result<String> {
        Ok(self.0.clone())
    }

    fn needs_renewal(&self, _meta: &ResponseMeta, _body: &[u8]) -> bool {
        false
    }
}

/// Knobs for a [`File`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub retry: RetrySettings,
    pub stale_threshold: Duration,
    /// Disable the backward-reuse path; every backward jump provisions a
    /// fresh connection.
    pub forbid_backtracking: bool,
    /// Log an aggregated stats line on close.
    pub dump_stats: bool,
    pub max_discard: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retry: RetrySettings::default(),
            stale_threshold: DEFAULT_STALE_THRESHOLD,
            forbid_backtracking: false,
            dump_stats: false,
            max_discard: DEFAULT_MAX_DISCARD,
        }
    }
}

impl Settings {
    /// Defaults, with `HTFS_NO_BACKTRACK=1` and `HTFS_DUMP_STATS=1`
    /// honored from the environment.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if std::env::var("HTFS_NO_BACKTRACK").as_deref() == Ok("1") {
            settings.forbid_backtracking = true;
        }
        if std::env::var("HTFS_DUMP_STATS").as_deref() == Ok("1") {
            settings.dump_stats = true;
        }
        settings
    }

    #[must_use]
    pub fn retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn stale_threshold(mut self, stale_threshold: Duration) -> Self {
        self.stale_threshold = stale_threshold;
        self
    }

    #[must_use]
    pub fn forbid_backtracking(mut self, forbid: bool) -> Self {
        self.forbid_backtracking = forbid;
        self
    }

    #[must_use]
    pub fn dump_stats(mut self, dump_stats: bool) -> Self {
        self.dump_stats = dump_stats;
        self
    }

    #[must_use]
    pub fn max_discard(mut self, max_discard: usize) -> Self {
        self.max_discard = max_discard;
        self
    }
}

/// Size and display name, the useful parts of a remote stat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub size: u64,
    pub name: String,
}

/// Aggregated transfer counters, snapshot via [`File::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    /// Connections established, including reconnects.
    pub connections: u64,
    /// Wall time spent establishing them.
    pub connection_wait: Duration,
    /// URL renewal attempts.
    pub renewals: u64,
    pub fetched_bytes: u64,
    pub cached_bytes: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl Stats {
    fn absorb(&mut self, cache: CacheStats) {
        self.fetched_bytes += cache.fetched_bytes;
        self.cached_bytes += cache.cached_bytes;
        self.cache_hits += cache.cache_hits;
        self.cache_misses += cache.cache_misses;
    }
}

/// Immutable configuration handle shared by every connection operation.
/// Connections never hold a reference back to the [`File`]; they receive
/// this instead.
struct Inner<C, U> {
    client: C,
    source: U,
    settings: Settings,
    /// The current download URL. Its own lock so a renewal serializes
    /// against itself without blocking unrelated state.
    url: Mutex<String>,
}

struct State {
    readers: HashMap<u64, Connection>,
    /// Cursor for the stream interface.
    cursor: u64,
    next_id: u64,
    closed: bool,
    stats: Stats,
}

/// A random-access, read-only view of a remote HTTP resource.
///
/// `read_at` calls are serialized by an internal lock; the type is safe to
/// share (`Arc<File<_, _>>`) across tasks, but reads never overlap.
pub struct File<C, U> {
    inner: Inner<C, U>,
    size: u64,
    name: String,
    headers: Vec<(String, String)>,
    request_url: String,
    state: Mutex<State>,
}

impl<C, U> std::fmt::Debug for File<C, U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("name", &self.name)
            .field("size", &self.size)
            .finish()
    }
}

impl<C, U> File<C, U>
where
    C: HttpClient,
    U: UrlSource,
{
    /// Open the remote resource: fetch a URL from `source`, establish a
    /// connection at offset zero, and learn the total size from the
    /// response (`Content-Range` total on 206, `Content-Length` on 200).
    ///
    /// The bootstrap connection goes into the pool, so an immediately
    /// following sequential read costs nothing extra. A 404 surfaces as
    /// the [`Error::NotFound`] sentinel and is never retried.
    pub async fn open(client: C, source: U, settings: Settings) -> Result<Self> {
        let initial_url = source.fetch_url().await?;
        let inner = Inner {
            client,
            source,
            settings,
            url: Mutex::new(initial_url),
        };

        let mut stats = Stats::default();
        let conn = inner
            .connect(1, 0, &mut stats)
            .await
            .map_err(normalize_open_error)?;
        let meta = conn.meta().clone();

        let size = match meta.status {
            206 => parse_content_range_total(meta.header("content-range"))?,
            _ => meta.content_length.unwrap_or(0),
        };
        let name = display_name(&meta);

        let mut readers = HashMap::new();
        readers.insert(conn.id(), conn);

        Ok(Self {
            inner,
            size,
            name,
            headers: meta.headers,
            request_url: meta.final_url,
            state: Mutex::new(State {
                readers,
                cursor: 0,
                next_id: 2,
                closed: false,
                stats,
            }),
        })
    }

    pub fn stat(&self) -> Stat {
        Stat {
            size: self.size,
            name: self.name.clone(),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Headers of the bootstrap response. May carry checksums usable for
    /// integrity checking.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// The bootstrap request URL after redirects.
    pub fn request_url(&self) -> &str {
        &self.request_url
    }

    /// Connections currently pooled (diagnostic).
    pub async fn num_readers(&self) -> usize {
        self.state.lock().await.readers.len()
    }

    /// Snapshot of the aggregated transfer counters.
    pub async fn stats(&self) -> Stats {
        self.state.lock().await.stats
    }

    /// Read at the stream cursor, then advance it.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut st = self.state.lock().await;
        if st.closed {
            return Err(Error::Closed);
        }
        let offset = st.cursor;
        let n = self.read_at_locked(&mut st, buf, offset).await?;
        st.cursor += n as u64;
        Ok(n)
    }

    /// Move the stream cursor. Out-of-range targets clamp to `[0, size]`.
    pub async fn seek(&self, pos: SeekFrom) -> u64 {
        let mut st = self.state.lock().await;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(delta) => self.size as i128 + delta as i128,
            SeekFrom::Current(delta) => st.cursor as i128 + delta as i128,
        };
        st.cursor = target.clamp(0, self.size as i128) as u64;
        st.cursor
    }

    /// Read `buf.len()` bytes at `offset`.
    ///
    /// Returns the number of bytes read; fewer than requested only at end
    /// of file. Transient network failures reconnect and continue under
    /// the retry settings. Calls are serialized; concurrent callers take
    /// turns.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut st = self.state.lock().await;
        if st.closed {
            return Err(Error::Closed);
        }
        self.read_at_locked(&mut st, buf, offset).await
    }

    async fn read_at_locked(
        &self,
        st: &mut State,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize> {
        if buf.is_empty() || offset >= self.size {
            return Ok(0);
        }
        trace!(offset, len = buf.len(), "read_at");

        let mut conn = self.borrow_reader(st, offset).await?;
        let res = self.fill(st, &mut conn, buf, offset).await;
        self.return_reader(st, conn);
        res
    }

    /// Drive `conn` until `buf` is full or the file ends, reconnecting
    /// through retriable failures.
    async fn fill(
        &self,
        st: &mut State,
        conn: &mut Connection,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize> {
        let mut total = 0usize;
        let mut truncations = 0u32;

        while total < buf.len() {
            match conn.backtracker().read(&mut buf[total..]).await {
                Ok(0) => {
                    let pos = offset + total as u64;
                    if pos >= self.size {
                        break;
                    }
                    // The body ended before the advertised size: the
                    // server cut us short. Reconnect where we left off.
                    truncations += 1;
                    if truncations >= self.inner.settings.retry.max_tries.max(1) {
                        return Err(Error::unexpected_eof());
                    }
                    debug!(pos, "body ended early, reconnecting");
                    *conn = self.inner.connect(conn.id(), pos, &mut st.stats).await?;
                }
                Ok(n) => {
                    total += n;
                    truncations = 0;
                }
                Err(e) if should_retry(&e) => {
                    let pos = conn.position();
                    debug!(pos, error = %e, "read failed, reconnecting");
                    *conn = self.inner.connect(conn.id(), pos, &mut st.stats).await?;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(total)
    }

    /// Pick the best pooled connection for `offset`, or provision one.
    ///
    /// Stale connections are evicted on the way. Forward reuse (discard
    /// already-paid-for bytes) wins over backward reuse (serve from the
    /// rewind window); both lose to nothing and provision a new
    /// connection.
    async fn borrow_reader(&self, st: &mut State, offset: u64) -> Result<Connection> {
        let threshold = self.inner.settings.stale_threshold;
        let stale: Vec<u64> = st
            .readers
            .values()
            .filter(|c| c.is_stale(threshold))
            .map(|c| c.id())
            .collect();
        for id in stale {
            if let Some(mut conn) = st.readers.remove(&id) {
                trace!(id, "evicting stale reader");
                st.stats.absorb(conn.take_cache_stats());
            }
        }

        let max_discard = self.inner.settings.max_discard as u64;
        let mut best_forward: Option<(u64, u64)> = None;
        let mut best_backward: Option<(u64, u64)> = None;

        for conn in st.readers.values() {
            let virtual_pos = conn.virtual_position();
            if offset >= virtual_pos {
                let diff = offset - virtual_pos;
                if diff < max_discard && best_forward.is_none_or(|(_, d)| diff < d) {
                    best_forward = Some((conn.id(), diff));
                }
            } else if !self.inner.settings.forbid_backtracking {
                let back = virtual_pos - offset;
                let rewind = conn.position() - offset;
                if back < max_discard
                    && rewind <= conn.cached()
                    && best_backward.is_none_or(|(_, d)| back < d)
                {
                    best_backward = Some((conn.id(), back));
                }
            }
        }

        if let Some((id, diff)) = best_forward {
            let mut conn = st.readers.remove(&id).expect("candidate left the pool");
            let pos = conn.position();
            if offset >= pos {
                conn.backtracker().clear_backtrack();
                let skip = offset - pos;
                if skip > 0 {
                    trace!(id, offset, skip, "reusing reader by discarding");
                    if let Err(e) = conn.backtracker().discard(skip).await {
                        if should_retry(&e) {
                            trace!(id, offset, "discard failed, reconnecting");
                            conn = self.inner.connect(id, offset, &mut st.stats).await?;
                        } else {
                            return Err(e);
                        }
                    }
                }
            } else {
                // the target sits inside the pending rewind
                conn.backtracker().backtrack(pos - offset)?;
            }
            return Ok(conn);
        }

        if let Some((id, back)) = best_backward {
            let mut conn = st.readers.remove(&id).expect("candidate left the pool");
            trace!(id, offset, back, "reusing reader by backtracking");
            let rewind = conn.position() - offset;
            conn.backtracker().backtrack(rewind)?;
            return Ok(conn);
        }

        let id = st.next_id;
        st.next_id += 1;
        debug!(offset, "establishing connection for bytes {offset}-");
        self.inner.connect(id, offset, &mut st.stats).await
    }

    fn return_reader(&self, st: &mut State, mut conn: Connection) {
        st.stats.absorb(conn.take_cache_stats());
        conn.touch();
        st.readers.insert(conn.id(), conn);
    }

    /// Replace the current URL via the source. Serialized against itself
    /// by the URL lock; connections pick the new URL up on their next
    /// reconnect.
    pub async fn renew_url(&self) -> Result<String> {
        self.inner.renew_url().await
    }

    /// Close all pooled connections. Idempotent. Reads after close fail
    /// with [`Error::Closed`].
    pub async fn close(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.closed {
            return Ok(());
        }

        let State { readers, stats, .. } = &mut *st;
        for (_, mut conn) in readers.drain() {
            stats.absorb(conn.take_cache_stats());
        }
        st.closed = true;

        if self.inner.settings.dump_stats {
            let stats = &st.stats;
            let served = stats.fetched_bytes + stats.cached_bytes;
            let hit_rate = if served > 0 {
                stats.cached_bytes as f64 / served as f64 * 100.0
            } else {
                0.0
            };
            info!(
                connections = stats.connections,
                connection_wait_ms = stats.connection_wait.as_millis() as u64,
                renewals = stats.renewals,
                fetched_bytes = stats.fetched_bytes,
                cached_bytes = stats.cached_bytes,
                hit_rate = format!("{hit_rate:.2}%"),
                "transfer stats"
            );
        }

        Ok(())
    }
}

impl<C, U> Inner<C, U>
where
    C: HttpClient,
    U: UrlSource,
{
    async fn current_url(&self) -> String {
        self.url.lock().await.clone()
    }

    async fn renew_url(&self) -> Result<String> {
        let mut url = self.url.lock().await;
        let fresh = self.source.fetch_url().await?;
        *url = fresh.clone();
        Ok(fresh)
    }

    /// Connect-with-retries at `offset`, renewing the URL when the
    /// consumer's predicate demands it. Renewals have their own cap and do
    /// not consume the retry budget.
    async fn connect(&self, id: u64, offset: u64, stats: &mut Stats) -> Result<Connection> {
        let mut retry = RetryContext::new(self.settings.retry.clone());
        let mut renewals = 0u32;
        let mut url = self.current_url().await;

        while retry.should_try() {
            let started = Instant::now();
            match Connection::establish(
                id,
                &self.client,
                &self.source,
                &url,
                offset,
                self.settings.max_discard,
            )
            .await
            {
                Ok(conn) => {
                    stats.connections += 1;
                    stats.connection_wait += started.elapsed();
                    trace!(id, offset, "connected");
                    return Ok(conn);
                }
                Err(e @ Error::NeedsRenewal { .. }) => {
                    renewals += 1;
                    if renewals >= MAX_RENEWALS {
                        return Err(Error::TooManyRenewals(renewals));
                    }
                    debug!(offset, cause = %e, "renewing URL");
                    url = self.renew_url_with_retries(offset, stats).await?;
                }
                Err(e) if should_retry(&e) => {
                    debug!(offset, error = %e, "connect failed");
                    retry.retry(e).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(retry.into_exhausted())
    }

    async fn renew_url_with_retries(&self, offset: u64, stats: &mut Stats) -> Result<String> {
        let mut retry = RetryContext::new(self.settings.retry.clone());
        while retry.should_try() {
            stats.renewals += 1;
            match self.renew_url().await {
                Ok(url) => return Ok(url),
                Err(e) if should_retry(&e) => {
                    debug!(offset, error = %e, "renewal failed");
                    retry.retry(e).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(retry.into_exhausted())
    }
}

fn normalize_open_error(err: Error) -> Error {
    match err.status() {
        Some(404) => Error::NotFound,
        _ => err,
    }
}

/// Total from a `Content-Range: bytes <first>-<last>/<total>` header.
fn parse_content_range_total(header: Option<&str>) -> Result<u64> {
    let header = header
        .ok_or_else(|| Error::Protocol("206 response without Content-Range".to_string()))?;
    let total = header
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .trim();
    total.parse().map_err(|_| {
        Error::Protocol(format!("could not parse file size from Content-Range {header:?}"))
    })
}

/// Display name: `Content-Disposition` filename when present, else the
/// last path segment of the post-redirect URL.
fn display_name(meta: &ResponseMeta) -> String {
    if let Some(value) = meta.header("content-disposition") {
        if let Some(name) = content_disposition_filename(value) {
            return name;
        }
    }
    url::Url::parse(&meta.final_url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|segments| segments.last().map(str::to_string))
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "<remote file>".to_string())
}

/// The `filename` parameter of a `Content-Disposition` value, quoted or
/// bare. `filename*` (extended syntax) is left alone.
fn content_disposition_filename(value: &str) -> Option<String> {
    for part in value.split(';') {
        let Some((key, val)) = part.trim().split_once('=') else {
            continue;
        };
        if !key.trim().eq_ignore_ascii_case("filename") {
            continue;
        }
        let val = val.trim().trim_matches('"');
        if !val.is_empty() {
            return Some(val.to_string());
        }
    }
    None
}
