//! The request pipeline: pre-processing, dispatch over pooled connections,
//! redirect following and response decoding.

use std::{
    io::Read,
    net::IpAddr,
    process::Stdio,
    time::{Duration, Instant},
};

use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Request};
use http_body_util::{BodyExt, Full};
use tokio::{io::AsyncWriteExt, net::lookup_host, process::Command};
use url::Url;

use crate::{
    controller::StopFlag,
    error::{
        aborted, redirects_exceeded, stopped, transport, unsupported_scheme, BoxError,
        CrawlError, ErrorKind, Result,
    },
    exchange::Exchange,
    handler::{Handler, NoopHandler},
    pool::{Conn, Endpoint, EndpointLru},
    transport::{with_timeout, Connector, HttpTransport},
};

/// Default per-socket timeout applied by [`Controller`](crate::Controller).
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = concat!("CRAWL-E/", env!("CARGO_PKG_VERSION"));

/// Sizing and transport knobs for a [`ConnectionControl`].
#[derive(Clone, Debug)]
pub struct ControlConfig {
    /// Maximum number of distinct endpoints tracked; `None` is unbounded.
    pub max_endpoints: Option<usize>,
    /// Maximum idle connections kept per endpoint; `None` is unbounded.
    pub max_conn: Option<usize>,
    /// Requests one connection may serve before it is force-reset, defending
    /// against server-side keep-alive limits; `None` is unlimited.
    pub request_limit: Option<u32>,
    /// Per-socket timeout covering connect and each request/response step.
    pub timeout: Option<Duration>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            max_endpoints: None,
            max_conn: None,
            request_limit: None,
            timeout: Some(DEFAULT_SOCKET_TIMEOUT),
        }
    }
}

/// The fetch engine shared by all workers: owns the endpoint LRU and runs the
/// request pipeline for one descriptor at a time.
pub struct ConnectionControl {
    lru: EndpointLru<HttpTransport>,
    connector: Connector,
    stop: StopFlag,
    timeout: Option<Duration>,
}

impl ConnectionControl {
    pub fn new(config: ControlConfig, stop: StopFlag) -> Self {
        Self {
            lru: EndpointLru::new(config.max_endpoints, config.max_conn, config.request_limit),
            connector: Connector::new(config.timeout),
            stop,
            timeout: config.timeout,
        }
    }

    /// Run the full pipeline for `ex`.
    ///
    /// Every followed redirect re-enters the pipeline from the stop check, so
    /// the pre-process hook sees (and may veto) each hop, and each hop
    /// acquires and releases its own connection. Method, headers and params
    /// are carried unchanged across 301/302/303.
    pub async fn fetch<H, Q>(&self, ex: &mut Exchange, handler: &H) -> Result<()>
    where
        H: Handler<Q>,
    {
        loop {
            if self.stop.is_set() {
                return Err(stopped());
            }

            handler.pre_process(ex);
            let Some(raw_url) = ex.response_url.clone() else {
                return Err(aborted());
            };

            let url = match Url::parse(&raw_url) {
                Ok(url) => url,
                Err(err) => {
                    return Err(
                        CrawlError::new(ErrorKind::UnsupportedScheme, Some(err)).with_url(raw_url)
                    )
                }
            };
            let tls = match url.scheme() {
                "http" => false,
                "https" => true,
                _ => return Err(unsupported_scheme().with_url(raw_url)),
            };
            let Some(host) = url.host_str().map(str::to_owned) else {
                return Err(unsupported_scheme().with_url(raw_url));
            };
            let port = url
                .port_or_known_default()
                .unwrap_or(if tls { 443 } else { 80 });

            let ip = self
                .resolve(&host, port)
                .await
                .map_err(|err| err.with_url(raw_url.clone()))?;
            let endpoint = Endpoint { ip, port, tls };

            let mut headers = ex.request_headers.clone();
            let body = match &ex.request_params {
                Some(params) => {
                    let encoded = serde_urlencoded::to_string(params)
                        .map_err(|err| transport(err).with_url(raw_url.clone()))?;
                    headers.insert(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("application/x-www-form-urlencoded"),
                    );
                    Bytes::from(encoded)
                }
                None => Bytes::new(),
            };
            apply_header_defaults(&mut headers, &host);

            // The on-wire target is origin-form: path plus query, no
            // scheme or authority.
            let mut target = url.path().to_owned();
            if let Some(query) = url.query() {
                target.push('?');
                target.push_str(query);
            }
            let mut req = Request::builder()
                .method(ex.request_method.clone())
                .uri(target)
                .body(Full::new(body))
                .map_err(|err| transport(err).with_url(raw_url.clone()))?;
            *req.headers_mut() = headers;

            let mut conn = match self.lru.acquire(&endpoint) {
                Some(conn) => conn,
                None => Conn::new(
                    self.connector
                        .dial(&endpoint, &host)
                        .await
                        .map_err(|err| err.with_url(raw_url.clone()))?,
                ),
            };

            let start = Instant::now();
            let result = with_timeout(self.timeout, async {
                let resp = conn.transport.send(req).await.map_err(BoxError::from)?;
                let (parts, body) = resp.into_parts();
                let bytes = body.collect().await.map_err(BoxError::from)?.to_bytes();
                Ok::<_, BoxError>((parts, bytes))
            })
            .await;
            let (parts, raw_body) = match result {
                Ok(ok) => ok,
                Err(err) => {
                    // A mid-request failure closes the leased connection; it
                    // must not go back to the pool.
                    drop(conn);
                    return Err(err.with_url(raw_url));
                }
            };
            let elapsed = start.elapsed();
            self.lru.release(endpoint, conn);

            if matches!(parts.status.as_u16(), 301 | 302 | 303) {
                if let Some(remaining) = ex.redirects {
                    if remaining == 0 {
                        return Err(redirects_exceeded().with_url(raw_url));
                    }
                    ex.redirects = Some(remaining - 1);
                    let location = parts
                        .headers
                        .get(header::LOCATION)
                        .and_then(|value| value.to_str().ok())
                        .ok_or_else(|| {
                            transport("redirect without a usable Location header")
                                .with_url(raw_url.clone())
                        })?;
                    let next = url
                        .join(location)
                        .map_err(|err| transport(err).with_url(raw_url.clone()))?;
                    tracing::debug!("following redirect to {next}");
                    ex.response_url = Some(next.into());
                    continue;
                }
            }

            ex.response_time = Some(elapsed);
            ex.response_status = Some(parts.status);
            let gzipped = parts
                .headers
                .get(header::CONTENT_ENCODING)
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value.eq_ignore_ascii_case("gzip"));
            let body = if gzipped {
                match inflate(&raw_body) {
                    Ok(decoded) => decoded,
                    Err(err) => {
                        // Some pages append plain text to an otherwise valid
                        // gzip body; those reject in-process but still decode
                        // through the external tool.
                        tracing::debug!("in-process gzip decode failed, piping to gzip -dc: {err}");
                        let decoded = external_gunzip(&raw_body)
                            .await
                            .map_err(|err| err.with_url(raw_url.clone()))?;
                        ex.extra.push(String::from("used external gunzip"));
                        decoded
                    }
                }
            } else {
                raw_body
            };
            ex.response_headers = Some(parts.headers);
            ex.response_body = Some(body);
            return Ok(());
        }
    }

    /// Resolve `host` to the address that keys the pool. Every request
    /// resolves; there is no DNS cache.
    async fn resolve(&self, host: &str, port: u16) -> Result<IpAddr> {
        let mut addrs = with_timeout(self.timeout, lookup_host((host, port))).await?;
        addrs
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| transport(format!("no address found for host `{host}`")))
    }
}

/// Fill in the request-header defaults the caller left unset. Caller-supplied
/// values always win.
fn apply_header_defaults(headers: &mut HeaderMap, host: &str) {
    if !headers.contains_key(header::ACCEPT) {
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
    }
    if !headers.contains_key(header::ACCEPT_ENCODING) {
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
    }
    if !headers.contains_key(header::ACCEPT_LANGUAGE) {
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-us,en;q=0.8"),
        );
    }
    if !headers.contains_key(header::HOST) {
        if let Ok(value) = HeaderValue::from_str(host) {
            headers.insert(header::HOST, value);
        }
    }
    if !headers.contains_key(header::USER_AGENT) {
        headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
    }
}

/// In-process gzip decode. Rejects payloads with trailing non-gzip bytes.
fn inflate(raw: &[u8]) -> std::io::Result<Bytes> {
    let mut decoder = flate2::read::MultiGzDecoder::new(raw);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(Bytes::from(out))
}

/// Pipe `raw` through `gzip -dc` and take whatever it writes to stdout.
///
/// `gzip` exits with a warning status when it ignores trailing garbage, which
/// is exactly the case this fallback exists for, so a non-success exit is
/// only an error when no output was produced at all.
async fn external_gunzip(raw: &[u8]) -> Result<Bytes> {
    let mut child = Command::new("gzip")
        .arg("-dc")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(transport)?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| transport("gzip stdin unavailable"))?;
    let input = raw.to_vec();
    let writer = async move {
        let result = stdin.write_all(&input).await;
        drop(stdin);
        result
    };
    let (write_result, output) = tokio::join!(writer, child.wait_with_output());
    let output = output.map_err(transport)?;
    if output.stdout.is_empty() {
        if let Err(err) = write_result {
            return Err(transport(err));
        }
        if !output.status.success() {
            return Err(transport(format!("gzip -dc exited with {}", output.status)));
        }
    }
    Ok(Bytes::from(output.stdout))
}

/// Convenience function to fetch a single URL outside any controller, with a
/// generous redirect budget and the default socket timeout.
pub async fn quick_request(url: impl Into<String>) -> Result<Exchange> {
    let control = ConnectionControl::new(ControlConfig::default(), StopFlag::new());
    let mut ex = Exchange::new(url).with_redirects(Some(30));
    control.fetch::<_, ()>(&mut ex, &NoopHandler).await?;
    Ok(ex)
}

#[cfg(test)]
mod control_tests {
    use std::io::Write;

    use http::{header, HeaderMap, HeaderValue};

    use super::{apply_header_defaults, external_gunzip, inflate, USER_AGENT};
    use crate::error::ErrorKind;

    fn gzip_bytes(data: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn header_defaults_fill_missing() {
        let mut headers = HeaderMap::new();
        apply_header_defaults(&mut headers, "example.com");
        assert_eq!(headers.get(header::ACCEPT).unwrap(), "*/*");
        assert_eq!(headers.get(header::ACCEPT_ENCODING).unwrap(), "gzip");
        assert_eq!(
            headers.get(header::ACCEPT_LANGUAGE).unwrap(),
            "en-us,en;q=0.8",
        );
        assert_eq!(headers.get(header::HOST).unwrap(), "example.com");
        assert_eq!(headers.get(header::USER_AGENT).unwrap(), USER_AGENT);
    }

    #[test]
    fn header_defaults_keep_caller_values() {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static("tester/1.0"));
        headers.insert(header::HOST, HeaderValue::from_static("other.test"));
        apply_header_defaults(&mut headers, "example.com");
        assert_eq!(headers.get(header::USER_AGENT).unwrap(), "tester/1.0");
        assert_eq!(headers.get(header::HOST).unwrap(), "other.test");
        // missing ones are still filled
        assert_eq!(headers.get(header::ACCEPT).unwrap(), "*/*");
    }

    #[test]
    fn inflate_decodes_clean_payloads() {
        let body = gzip_bytes(b"hello gzip");
        assert_eq!(inflate(&body).unwrap().as_ref(), b"hello gzip");
    }

    #[test]
    fn inflate_rejects_trailing_garbage() {
        let mut body = gzip_bytes(b"gz");
        body.extend_from_slice(b"tail");
        assert!(inflate(&body).is_err());
    }

    #[tokio::test]
    async fn external_gunzip_tolerates_trailing_garbage() {
        let mut body = gzip_bytes(b"gz");
        body.extend_from_slice(b"tail");
        let decoded = external_gunzip(&body).await.unwrap();
        assert!(decoded.starts_with(b"gz"));
    }

    #[tokio::test]
    async fn external_gunzip_fails_on_pure_garbage() {
        let err = external_gunzip(b"definitely not gzip").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
}
