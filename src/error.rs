//! Error types reported by the fetch pipeline.

use std::{error::Error, fmt};

/// A boxed [`Error`] that is [`Send`] and [`Sync`].
pub type BoxError = Box<dyn Error + Send + Sync>;

/// [`Result`](std::result::Result) with [`CrawlError`] as its default error type.
pub type Result<T, E = CrawlError> = std::result::Result<T, E>;

/// Error produced while fetching a single descriptor.
///
/// The pipeline never swallows errors: whatever it raises ends up stamped on
/// the descriptor and handed to the handler's post-process hook, which decides
/// whether to re-queue, log or discard the work.
#[derive(Debug)]
pub struct CrawlError {
    kind: ErrorKind,
    source: Option<BoxError>,
    url: Option<String>,
}

impl CrawlError {
    /// Create a new [`CrawlError`] from an [`ErrorKind`] and an optional source.
    pub fn new<E>(kind: ErrorKind, source: Option<E>) -> Self
    where
        E: Into<BoxError>,
    {
        Self {
            kind,
            source: source.map(Into::into),
            url: None,
        }
    }

    /// Consume the error and return a new one carrying the offending URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Get the [`ErrorKind`] of this error.
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the URL the error is attached to, if any.
    #[inline]
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }
}

impl fmt::Display for CrawlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(url) = &self.url {
            write!(f, " for url `{url}`")?;
        }
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl Error for CrawlError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.source.as_ref()?.as_ref())
    }
}

/// Error kind of [`CrawlError`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// The stop flag was set before or during dispatch.
    Stopped,
    /// The pre-process hook vetoed the URL.
    Aborted,
    /// The URL is not `http`/`https`, has no host, or does not parse.
    UnsupportedScheme,
    /// The redirect budget was exhausted.
    RedirectsExceeded,
    /// Network, TLS, timeout, DNS or protocol failure.
    Transport,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("crawl stopped"),
            Self::Aborted => f.write_str("request aborted by pre-process"),
            Self::UnsupportedScheme => f.write_str("unsupported scheme"),
            Self::RedirectsExceeded => f.write_str("too many redirects"),
            Self::Transport => f.write_str("transport error"),
        }
    }
}

/// Create a [`CrawlError`] with [`ErrorKind::Stopped`].
pub fn stopped() -> CrawlError {
    CrawlError::new(ErrorKind::Stopped, None::<BoxError>)
}

/// Create a [`CrawlError`] with [`ErrorKind::Aborted`].
pub fn aborted() -> CrawlError {
    CrawlError::new(ErrorKind::Aborted, None::<BoxError>)
}

/// Create a [`CrawlError`] with [`ErrorKind::UnsupportedScheme`].
pub fn unsupported_scheme() -> CrawlError {
    CrawlError::new(ErrorKind::UnsupportedScheme, None::<BoxError>)
}

/// Create a [`CrawlError`] with [`ErrorKind::RedirectsExceeded`].
pub fn redirects_exceeded() -> CrawlError {
    CrawlError::new(ErrorKind::RedirectsExceeded, None::<BoxError>)
}

/// Create a [`CrawlError`] with [`ErrorKind::Transport`] from any source.
pub fn transport<E>(source: E) -> CrawlError
where
    E: Into<BoxError>,
{
    CrawlError::new(ErrorKind::Transport, Some(source))
}

#[cfg(test)]
mod crawl_error_tests {
    use super::{redirects_exceeded, transport, ErrorKind};

    #[test]
    fn display_carries_url_and_source() {
        let err = transport(std::io::Error::other("connection reset"))
            .with_url("http://example.com/");
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(
            err.to_string(),
            "transport error for url `http://example.com/`: connection reset",
        );
    }

    #[test]
    fn plain_kinds_display_without_source() {
        let err = redirects_exceeded();
        assert_eq!(err.kind(), ErrorKind::RedirectsExceeded);
        assert_eq!(err.to_string(), "too many redirects");
        assert!(err.url().is_none());
    }
}
