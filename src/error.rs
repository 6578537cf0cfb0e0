use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Refinement of a server-side failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerCode {
    #[default]
    Unknown,
    /// The server answered a ranged request with a full-body `200 OK`.
    NoRangeSupport,
}

/// Structural classification of a transport-level failure.
///
/// Produced at the [`HttpClient`](crate::net::HttpClient) boundary from the
/// transport's own predicates, never from message text. Every kind is
/// retriable; see [`is_network_error`](crate::neterr::is_network_error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    /// Connect or request deadline exceeded.
    Timeout,
    /// Connection could not be established (refused, unreachable, DNS).
    Connect,
    /// Connection dropped mid-stream or the body was cut short.
    Reset,
    /// Name resolution failed.
    Dns,
    /// The stream ended while more bytes were expected.
    UnexpectedEof,
    /// Other transport-level I/O failure.
    Io,
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The server answered 404 on open. Never retried.
    #[error("remote file not found on server")]
    NotFound,

    /// The URL source kept minting URLs the server rejected.
    #[error("giving up after {0} URL renewals in a row")]
    TooManyRenewals(u32),

    #[error("server error: host {host}: {message}")]
    Server {
        host: String,
        status: u16,
        message: String,
        code: ServerCode,
    },

    /// Internal signal: the consumer's predicate claimed the URL expired.
    /// Consumed by the connect loop, never surfaced.
    #[error("url has expired and needs renewal")]
    NeedsRenewal { url: String },

    #[error("network error: {message}")]
    Network { kind: NetworkKind, message: String },

    #[error("can't backtrack {requested} bytes, only {cached} cached")]
    CantBacktrack { requested: u64, cached: u64 },

    #[error("too many errors, giving up after {tries} tries: {last}")]
    RetriesExhausted { tries: u32, last: Box<Error> },

    #[error("file is closed")]
    Closed,

    /// The upload worker died before accepting more input.
    #[error("upload canceled")]
    Canceled,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    pub(crate) fn unexpected_eof() -> Self {
        Error::Network {
            kind: NetworkKind::UnexpectedEof,
            message: "unexpected end of stream (EOF)".to_string(),
        }
    }

    /// HTTP status carried by this error, if it is a server error.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}
