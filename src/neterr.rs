//! Retriable/fatal classification of transfer errors.

use crate::error::Error;

/// Returns true when `err` is a transport-level failure worth retrying:
/// timeouts, refused/reset/closed connections, DNS failures, and streams
/// that ended while bytes were still expected.
///
/// A clean end-of-stream is not an error at all (reads report `Ok(0)`), and
/// protocol-level HTTP failures are [`Error::Server`]; both classify false.
/// The match is structural, there is no message inspection.
pub fn is_network_error(err: &Error) -> bool {
    matches!(err, Error::Network { .. })
}

/// Server statuses that are worth another attempt: rate limiting and
/// transient 5xx conditions.
pub fn is_retriable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503)
}

/// File-level retriability: network errors plus the retriable status set.
pub(crate) fn should_retry(err: &Error) -> bool {
    if is_network_error(err) {
        return true;
    }
    matches!(err, Error::Server { status, .. } if is_retriable_status(*status))
}
