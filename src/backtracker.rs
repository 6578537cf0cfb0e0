//! A forward byte reader that can rewind a little.
//!
//! [`Backtracker`] consumes an upstream stream of byte chunks while keeping
//! the last `cache_capacity` consumed bytes in a sliding window. A call to
//! [`Backtracker::backtrack`] virtually rewinds serving into that window
//! without touching the upstream, which lets one HTTP body serve a forward
//! consumer and the occasional short reverse jump.

use bytes::{Buf, Bytes};
use futures_util::{Stream, StreamExt};

use crate::error::{Error, Result};

/// Counters for bytes served from upstream versus from the rewind window.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub fetched_bytes: u64,
    pub cached_bytes: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

pub struct Backtracker<S> {
    upstream: S,
    /// Unconsumed tail of the most recent upstream chunk.
    pending: Bytes,
    /// Absolute position of the upstream cursor: `initial_offset` plus
    /// every byte consumed from upstream. Cache-served reads do not move it.
    offset: u64,
    /// Sliding window over the most recently consumed bytes, valid data
    /// packed at the tail.
    cache: Vec<u8>,
    cached: usize,
    /// While non-zero, reads are served from the tail of `cache`.
    backtrack: usize,
    stats: CacheStats,
}

impl<S> Backtracker<S>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    /// A `cache_capacity` of zero disables backtracking entirely.
    pub fn new(initial_offset: u64, upstream: S, cache_capacity: usize) -> Self {
        Self {
            upstream,
            pending: Bytes::new(),
            offset: initial_offset,
            cache: vec![0; cache_capacity],
            cached: 0,
            backtrack: 0,
            stats: CacheStats::default(),
        }
    }

    /// Read into `dst`, serving a pending backtrack from the window first.
    ///
    /// Window-served reads are short reads when the pending backtrack is
    /// smaller than `dst`; they never consult the upstream and never move
    /// [`offset`](Self::offset). `Ok(0)` on a non-empty `dst` means the
    /// upstream is exhausted.
    pub async fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }

        if self.backtrack > 0 {
            let n = dst.len().min(self.backtrack);
            let start = self.cache.len() - self.backtrack;
            dst[..n].copy_from_slice(&self.cache[start..start + n]);
            self.backtrack -= n;

            self.stats.cached_bytes += n as u64;
            self.stats.cache_hits += 1;
            return Ok(n);
        }

        if self.pending.is_empty() {
            match self.upstream.next().await {
                None => return Ok(0),
                Some(Err(e)) => return Err(e),
                Some(Ok(chunk)) => self.pending = chunk,
            }
        }

        let n = dst.len().min(self.pending.len());
        dst[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        self.offset += n as u64;
        self.absorb(&dst[..n]);

        self.stats.fetched_bytes += n as u64;
        self.stats.cache_misses += 1;
        Ok(n)
    }

    /// Slide the window left and append the just-consumed bytes at the tail.
    fn absorb(&mut self, data: &[u8]) {
        let cap = self.cache.len();
        if cap == 0 {
            return;
        }
        if data.len() >= cap {
            self.cache.copy_from_slice(&data[data.len() - cap..]);
            self.cached = cap;
        } else {
            self.cache.copy_within(data.len().., 0);
            self.cache[cap - data.len()..].copy_from_slice(data);
            self.cached = (self.cached + data.len()).min(cap);
        }
    }

    /// Consume and drop `n` bytes.
    ///
    /// Goes through [`read`](Self::read) so the window and counters update
    /// uniformly. Fails with an end-of-stream error if the upstream dries
    /// up first.
    pub async fn discard(&mut self, mut n: u64) -> Result<u64> {
        let mut buf = [0u8; 4096];
        let mut total = 0u64;
        while n > 0 {
            let want = n.min(buf.len() as u64) as usize;
            let got = self.read(&mut buf[..want]).await?;
            if got == 0 {
                return Err(Error::unexpected_eof());
            }
            total += got as u64;
            n -= got as u64;
        }
        Ok(total)
    }

    /// Rewind serving by `n` bytes into the window. Fails when `n` exceeds
    /// the valid window; `n == 0` always succeeds and clears any pending
    /// rewind.
    pub fn backtrack(&mut self, n: u64) -> Result<()> {
        if n > self.cached as u64 {
            return Err(Error::CantBacktrack {
                requested: n,
                cached: self.cached as u64,
            });
        }
        self.backtrack = n as usize;
        Ok(())
    }

    pub(crate) fn clear_backtrack(&mut self) {
        self.backtrack = 0;
    }

    /// Upstream position; unaffected by pending backtracks.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Valid bytes in the rewind window.
    pub fn cached(&self) -> u64 {
        self.cached as u64
    }

    /// Bytes the next reads will serve from the window.
    pub fn pending_backtrack(&self) -> u64 {
        self.backtrack as u64
    }

    /// The position the next read serves from.
    pub fn virtual_offset(&self) -> u64 {
        self.offset - self.backtrack as u64
    }

    pub(crate) fn take_stats(&mut self) -> CacheStats {
        std::mem::take(&mut self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    /// Upstream over `data`, split into `chunk` sized pieces.
    fn source(data: Vec<u8>, chunk: usize) -> impl Stream<Item = Result<Bytes>> + Unpin {
        let chunks: Vec<Result<Bytes>> = data
            .chunks(chunk.max(1))
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(chunks)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
    }

    async fn read_full<S>(bt: &mut Backtracker<S>, dst: &mut [u8]) -> Result<()>
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        let mut total = 0;
        while total < dst.len() {
            let n = bt.read(&mut dst[total..]).await?;
            if n == 0 {
                return Err(Error::unexpected_eof());
            }
            total += n;
        }
        Ok(())
    }

    async fn read_to_end<S>(bt: &mut Backtracker<S>) -> Result<Vec<u8>>
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            let n = bt.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn tiny() {
        let data: Vec<u8> = (0..16).collect();
        let mut bt = Backtracker::new(0, source(data, 3), 2);

        let mut one = [0u8; 1];
        macro_rules! read_one {
            ($expected:expr) => {{
                let n = bt.read(&mut one).await.unwrap();
                assert_eq!(n, 1);
                assert_eq!(one[0], $expected);
            }};
        }

        read_one!(0);
        assert_eq!(bt.offset(), 1);
        assert_eq!(bt.cached(), 1);

        read_one!(1);
        assert_eq!(bt.offset(), 2);
        assert_eq!(bt.cached(), 2);

        bt.backtrack(1).unwrap();
        assert_eq!(bt.offset(), 2);
        read_one!(1);

        bt.backtrack(2).unwrap();
        assert_eq!(bt.offset(), 2);
        read_one!(0);
        read_one!(1);

        // a read spanning the window boundary is a short read, then resumes
        // from upstream
        let mut five = [0u8; 5];
        bt.backtrack(2).unwrap();
        read_full(&mut bt, &mut five).await.unwrap();
        assert_eq!(five, [0, 1, 2, 3, 4]);
        assert_eq!(bt.offset(), 5);
        assert_eq!(bt.cached(), 2);

        bt.backtrack(2).unwrap();
        assert_eq!(bt.offset(), 5);
        assert_eq!(bt.cached(), 2);
        read_one!(3);
        read_one!(4);

        bt.discard(5).await.unwrap();
        assert_eq!(bt.offset(), 10);

        let rest = read_to_end(&mut bt).await.unwrap();
        assert_eq!(rest, vec![10, 11, 12, 13, 14, 15]);
    }

    #[tokio::test]
    async fn zero_capacity_disables_backtracking() {
        let data: Vec<u8> = (0..16).collect();
        let mut bt = Backtracker::new(0, source(data.clone(), 5), 0);

        let out = read_to_end(&mut bt).await.unwrap();
        assert_eq!(out, data);
        assert_eq!(bt.cached(), 0);
        assert!(bt.backtrack(1).is_err());
    }

    #[tokio::test]
    async fn oversized_cache_keeps_everything() {
        let data: Vec<u8> = (0..64).collect();
        let mut bt = Backtracker::new(17, source(data.clone(), 9), 1024);

        let mut buf = [0u8; 7];
        let mut off = 0usize;
        while off + buf.len() <= data.len() {
            read_full(&mut bt, &mut buf).await.unwrap();
            assert_eq!(&data[off..off + buf.len()], &buf);
            bt.backtrack(1).unwrap();
            off += buf.len() - 1;
        }
    }

    #[tokio::test]
    async fn sliding_window_over_large_stream() {
        const K: usize = 1024;
        let data = pattern(512 * K);
        let mut bt = Backtracker::new(0, source(data.clone(), 8 * K), 31 * K);

        bt.discard((64 * K) as u64).await.unwrap();

        let mut b = [0u8; 32];
        read_full(&mut bt, &mut b).await.unwrap();
        assert_eq!(&data[64 * K..64 * K + b.len()], &b);

        let off = 64 * K + b.len();

        for woff in [4 * K + 649, 16 * K + 517] {
            bt.backtrack(woff as u64).unwrap();
            read_full(&mut bt, &mut b).await.unwrap();
            assert_eq!(&data[off - woff..off - woff + b.len()], &b);
        }

        // beyond the window
        let err = bt.backtrack((32 * K) as u64).unwrap_err();
        assert!(err.to_string().contains("can't backtrack"));

        // zero is a no-op and clears any pending rewind
        bt.backtrack(0).unwrap();
        assert_eq!(bt.offset(), off as u64);

        let woff = 128 * K + 991;
        bt.discard(woff as u64).await.unwrap();
        let off = off + woff;
        assert_eq!(bt.offset(), off as u64);

        read_full(&mut bt, &mut b).await.unwrap();
        assert_eq!(&data[off..off + b.len()], &b);

        // discarding past the end surfaces the end-of-stream error
        let err = bt.discard((512 * K) as u64).await.unwrap_err();
        assert!(err.to_string().contains("EOF"));
    }

    #[tokio::test]
    async fn cache_bound_tracks_consumption() {
        let data = pattern(64);
        let mut bt = Backtracker::new(0, source(data, 1), 16);

        let mut one = [0u8; 1];
        for i in 1..=64usize {
            bt.read(&mut one).await.unwrap();
            assert_eq!(bt.cached(), i.min(16) as u64);
        }
    }

    #[tokio::test]
    async fn initial_offset_is_reported() {
        let mut bt = Backtracker::new(4, source(vec![4, 5, 6, 7], 2), 2);
        assert_eq!(bt.offset(), 4);

        let out = read_to_end(&mut bt).await.unwrap();
        assert_eq!(out, vec![4, 5, 6, 7]);
        assert_eq!(bt.offset(), 8);
    }

    #[tokio::test]
    async fn chunk_larger_than_window() {
        // a single upstream chunk bigger than the window keeps its tail
        let data = pattern(64);
        let mut bt = Backtracker::new(0, source(data.clone(), 64), 8);

        let mut buf = [0u8; 64];
        read_full(&mut bt, &mut buf).await.unwrap();
        assert_eq!(bt.cached(), 8);

        bt.backtrack(8).unwrap();
        let mut tail = [0u8; 8];
        read_full(&mut bt, &mut tail).await.unwrap();
        assert_eq!(&data[56..], &tail);
    }

    #[tokio::test]
    async fn upstream_error_is_verbatim() {
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"ab")),
            Err(Error::Network {
                kind: crate::error::NetworkKind::Reset,
                message: "connection reset".to_string(),
            }),
        ];
        let mut bt = Backtracker::new(0, stream::iter(chunks), 4);

        let mut buf = [0u8; 2];
        assert_eq!(bt.read(&mut buf).await.unwrap(), 2);
        let err = bt.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, Error::Network { .. }));
    }

    #[tokio::test]
    async fn round_trip_leaves_offset_unchanged() {
        let data = pattern(256);
        let mut bt = Backtracker::new(0, source(data, 16), 64);

        let mut first = [0u8; 48];
        read_full(&mut bt, &mut first).await.unwrap();
        let offset = bt.offset();

        bt.backtrack(48).unwrap();
        let mut second = [0u8; 48];
        read_full(&mut bt, &mut second).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(bt.offset(), offset);
    }
}
