//! The value object carrying one request through the pipeline.

use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};

use crate::error::CrawlError;

/// Default redirect hop budget for a freshly created [`Exchange`].
pub const DEFAULT_REDIRECTS: u32 = 10;

/// Container for everything pertaining to one request and its response.
///
/// Producers (and the handler's pre-process hook) fill in the request fields;
/// the pipeline fills in the response fields. URLs are kept as raw strings so
/// that a malformed URL pulled off the queue still flows through the pipeline
/// and reaches the handler as an error instead of failing the queue itself.
///
/// After the pipeline has run, exactly one of the following holds: the
/// response fields are populated, or [`error`](Self::error) is set.
#[derive(Debug, Default)]
pub struct Exchange {
    /// The URL this exchange was created for.
    pub request_url: String,
    /// HTTP method, `GET` by default.
    pub request_method: Method,
    /// Request headers. Missing entries are filled with defaults at dispatch
    /// time; caller-supplied values always win.
    pub request_headers: HeaderMap,
    /// Optional form parameters. When present the body is sent
    /// `application/x-www-form-urlencoded`.
    pub request_params: Option<Vec<(String, String)>>,
    /// Remaining redirect hop budget. `None` means "do not follow redirects
    /// at all", which is distinct from a budget of zero.
    pub redirects: Option<u32>,

    /// The URL the pipeline will actually fetch. Starts out equal to
    /// [`request_url`](Self::request_url); the pre-process hook may rewrite
    /// it, and every followed redirect overwrites it. `None` is the skip
    /// sentinel set through [`Exchange::skip`]. After a successful fetch this
    /// is the final URL reached.
    pub response_url: Option<String>,

    /// Response status of the terminal (post-redirect) response.
    pub response_status: Option<StatusCode>,
    /// Response headers of the terminal response.
    pub response_headers: Option<HeaderMap>,
    /// Decoded response payload.
    pub response_body: Option<Bytes>,
    /// Wall-clock duration of the terminal request.
    pub response_time: Option<Duration>,
    /// Error raised by the pipeline, if any.
    pub error: Option<CrawlError>,
    /// Informational tags collected along the way, e.g. `"used external
    /// gunzip"`.
    pub extra: Vec<String>,
}

impl Exchange {
    /// Create an exchange for `url` with default method, headers and redirect
    /// budget.
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            response_url: Some(url.clone()),
            request_url: url,
            redirects: Some(DEFAULT_REDIRECTS),
            ..Default::default()
        }
    }

    /// Set the request method.
    pub fn with_method(mut self, method: Method) -> Self {
        self.request_method = method;
        self
    }

    /// Set the request headers.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.request_headers = headers;
        self
    }

    /// Set form parameters to send as an `application/x-www-form-urlencoded`
    /// body.
    pub fn with_params(mut self, params: Vec<(String, String)>) -> Self {
        self.request_params = Some(params);
        self
    }

    /// Set the redirect hop budget; `None` disables redirect following.
    pub fn with_redirects(mut self, redirects: Option<u32>) -> Self {
        self.redirects = redirects;
        self
    }

    /// Mark the exchange as skipped. The pipeline will drop it with an
    /// `Aborted` error and no network traffic.
    pub fn skip(&mut self) {
        self.response_url = None;
    }

    /// Whether the pipeline completed with a response.
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.response_status.is_some()
    }
}

#[cfg(test)]
mod exchange_tests {
    use http::Method;

    use super::{Exchange, DEFAULT_REDIRECTS};

    #[test]
    fn new_exchange_defaults() {
        let ex = Exchange::new("http://example.com/");
        assert_eq!(ex.request_url, "http://example.com/");
        assert_eq!(ex.response_url.as_deref(), Some("http://example.com/"));
        assert_eq!(ex.request_method, Method::GET);
        assert_eq!(ex.redirects, Some(DEFAULT_REDIRECTS));
        assert!(ex.request_headers.is_empty());
        assert!(ex.extra.is_empty());
        assert!(!ex.succeeded());
    }

    #[test]
    fn skip_clears_response_url() {
        let mut ex = Exchange::new("http://example.com/");
        ex.skip();
        assert!(ex.response_url.is_none());
    }
}
