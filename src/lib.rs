//! Remote resources over HTTP, readable like local files, plus resumable
//! chunked uploads.
//!
//! # Architecture
//!
//! Two subsystems share a transport seam and an error taxonomy:
//!
//! - [`file`]: [`File`] treats a URL-addressed resource as a seekable,
//!   read-only file. A pool of live range-GET connections is matched to
//!   `read_at` offsets by locality: bytes already in flight are discarded
//!   forward, recently consumed bytes are replayed backward from each
//!   connection's [`Backtracker`] window. Expired signed URLs renew
//!   through the consumer's [`UrlSource`]; transient failures retry with
//!   bounded exponential backoff.
//! - [`upload`]: [`ResumableUpload`] streams writes into 256 KiB blocks,
//!   groups them into multi-MiB `Content-Range` PUTs against a resumable
//!   session URL, and recovers from partial commits.
//!
//! The HTTP client behind both is the [`HttpClient`] trait; production
//! code uses the `reqwest`-backed [`ReqwestClient`] (the default `reqwest`
//! feature), tests plug in in-memory fakes.

pub mod backtracker;
pub mod error;
pub mod file;
pub mod net;
pub mod neterr;
pub mod retry;
pub mod upload;

pub use backtracker::Backtracker;
pub use error::{Error, NetworkKind, Result, ServerCode};
pub use file::{File, Settings, Stat, Stats, StaticUrl, UrlSource};
pub use net::{BodyStream, BoxStream, HttpClient, HttpResponse, ResponseMeta};
pub use neterr::{is_network_error, is_retriable_status};
pub use retry::{RetryContext, RetrySettings};
pub use upload::{ResumableUpload, BLOCK_SIZE, MAX_CHUNK_GROUP};

#[cfg(feature = "reqwest")]
pub use net::ReqwestClient;
