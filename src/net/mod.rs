//! HTTP transport seam.
//!
//! The crate talks to the network through [`HttpClient`], a minimal trait
//! the production [`ReqwestClient`] implements and tests replace with
//! in-memory fakes. Implementations map transport failures into
//! [`Error::Network`](crate::error::Error::Network) using their own
//! structural predicates; HTTP status handling stays with the caller.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;

use crate::error::Result;

/// A boxed stream, the shape response and request bodies travel in.
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = T> + Send + 'a>>;

/// Body bytes with transport errors already mapped into the crate error.
pub type BodyStream = BoxStream<'static, Result<Bytes>>;

/// Everything about a response except its body.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub status: u16,
    /// Response headers, in arrival order.
    pub headers: Vec<(String, String)>,
    /// The effective request URL after redirects.
    pub final_url: String,
    /// The `Content-Length` header, when present.
    pub content_length: Option<u64>,
}

impl ResponseMeta {
    /// First header matching `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Host of the effective request URL, for error reporting.
    pub fn host(&self) -> String {
        url::Url::parse(&self.final_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default()
    }
}

pub struct HttpResponse {
    pub meta: ResponseMeta,
    pub body: BodyStream,
}

/// Asynchronous HTTP client abstraction.
///
/// Implementations handle their own redirect following and timeout
/// configuration. Requests that reach the server and come back with any
/// status are `Ok`; only transport-level failures are `Err`.
pub trait HttpClient: Send + Sync {
    /// Issue a GET and hand back the streaming body.
    fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> impl Future<Output = Result<HttpResponse>> + Send;

    /// Issue a PUT with a streamed body of exactly `content_length` bytes.
    fn put(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: BodyStream,
        content_length: u64,
    ) -> impl Future<Output = Result<HttpResponse>> + Send;
}

#[cfg(feature = "reqwest")]
mod reqwest_impl {
    use super::*;
    use crate::error::{Error, NetworkKind};
    use futures_util::StreamExt;

    /// Production HTTP client backed by `reqwest`.
    #[derive(Clone, Default)]
    pub struct ReqwestClient {
        client: reqwest::Client,
    }

    impl ReqwestClient {
        pub fn new() -> Self {
            Self {
                client: reqwest::Client::new(),
            }
        }

        /// Wrap a pre-configured client (timeouts, proxies, pools).
        pub fn with_client(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    fn map_transport(e: reqwest::Error) -> Error {
        let kind = if e.is_timeout() {
            NetworkKind::Timeout
        } else if e.is_connect() {
            NetworkKind::Connect
        } else if e.is_body() || e.is_decode() {
            NetworkKind::Reset
        } else {
            NetworkKind::Io
        };
        Error::Network {
            kind,
            message: e.to_string(),
        }
    }

    fn into_response(response: reqwest::Response) -> HttpResponse {
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let meta = ResponseMeta {
            status: response.status().as_u16(),
            headers,
            final_url: response.url().to_string(),
            content_length: response.content_length(),
        };
        let body: BodyStream =
            Box::pin(response.bytes_stream().map(|r| r.map_err(map_transport)));
        HttpResponse { meta, body }
    }

    impl HttpClient for ReqwestClient {
        async fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse> {
            let mut request = self.client.get(url);
            for (key, value) in headers {
                request = request.header(key.as_str(), value.as_str());
            }
            let response = request.send().await.map_err(map_transport)?;
            Ok(into_response(response))
        }

        async fn put(
            &self,
            url: &str,
            headers: &[(String, String)],
            body: BodyStream,
            content_length: u64,
        ) -> Result<HttpResponse> {
            let mut request = self
                .client
                .put(url)
                .header(reqwest::header::CONTENT_LENGTH, content_length)
                .body(reqwest::Body::wrap_stream(body));
            for (key, value) in headers {
                request = request.header(key.as_str(), value.as_str());
            }
            let response = request.send().await.map_err(map_transport)?;
            Ok(into_response(response))
        }
    }
}

#[cfg(feature = "reqwest")]
pub use reqwest_impl::ReqwestClient;
