//! Error types for the reqwest-proxy-rotator crate.

use std::fmt;
use std::io;
use thiserror::Error;

/// Boxed error carried by [`TransportError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced to callers of the pool and the request API.
#[derive(Debug, Error)]
pub enum Error {
    /// No eligible proxy is left and none is on loan that could come back.
    #[error("No proxy available in pool")]
    PoolExhausted,
    /// Every attempt of the retry budget failed with a retryable outcome.
    #[error("Request failed after {attempts} attempts")]
    RetriesExhausted { attempts: usize },
    /// The first replenishment produced no usable proxy.
    #[error("No proxies received from source")]
    NoProxies,
    /// A literal proxy address could not be parsed.
    #[error("Invalid proxy address: {0:?}")]
    InvalidAddress(String),
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The request body is a stream and cannot be replayed across attempts.
    #[error("Request object is not cloneable. Are you passing a streaming body?")]
    RequestNotCloneable,
    #[error("Failed to encode JSON body: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Source(#[from] SourceError),
    /// Transport failure that was not retryable.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failure while fetching candidate proxies.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("proxy source request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("proxy source could not be read: {0}")]
    Io(#[from] std::io::Error),
    #[error("proxy source payload is malformed: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Closed set of transport failure kinds the retry loop knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    ConnectTimeout,
    ReadTimeout,
    /// The proxy refused or broke the tunnel.
    Proxy,
    Tls,
    Connection,
    /// Anything outside the known set; never retried.
    Other,
}

impl TransportErrorKind {
    /// Kinds retried by default.
    pub const RETRYABLE: [TransportErrorKind; 5] = [
        TransportErrorKind::ConnectTimeout,
        TransportErrorKind::ReadTimeout,
        TransportErrorKind::Proxy,
        TransportErrorKind::Tls,
        TransportErrorKind::Connection,
    ];
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportErrorKind::ConnectTimeout => "connect timeout",
            TransportErrorKind::ReadTimeout => "read timeout",
            TransportErrorKind::Proxy => "proxy error",
            TransportErrorKind::Tls => "TLS error",
            TransportErrorKind::Connection => "connection error",
            TransportErrorKind::Other => "transport error",
        };
        f.write_str(name)
    }
}

/// Error raised by a [`Transport`](crate::transport::Transport) attempt.
#[derive(Debug, Error)]
#[error("{kind}: {source}")]
pub struct TransportError {
    kind: TransportErrorKind,
    #[source]
    source: BoxError,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    /// Take back the underlying error, e.g. to recover a `reqwest::Error`.
    pub fn into_source(self) -> BoxError {
        self.source
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let kind = classify_reqwest_error(&err);
        TransportError::new(kind, err)
    }
}

/// Map a reqwest error onto the known transport kinds.
///
/// Only the source chain is inspected: reqwest's own message carries the
/// request URL, which must not influence the kind.
fn classify_reqwest_error(err: &reqwest::Error) -> TransportErrorKind {
    if err.is_builder() || err.is_redirect() || err.is_decode() || err.is_status() {
        return TransportErrorKind::Other;
    }
    if err.is_timeout() {
        return if err.is_connect() {
            TransportErrorKind::ConnectTimeout
        } else {
            TransportErrorKind::ReadTimeout
        };
    }

    let url = err.url().map(|url| url.as_str().to_lowercase());
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if let Some(kind) = classify_source(inner, url.as_deref(), err.is_connect()) {
            return kind;
        }
        source = inner.source();
    }

    if err.is_connect() || err.is_request() || err.is_body() {
        return TransportErrorKind::Connection;
    }
    TransportErrorKind::Other
}

fn classify_source(
    err: &(dyn std::error::Error + 'static),
    url: Option<&str>,
    connecting: bool,
) -> Option<TransportErrorKind> {
    let mut text = err.to_string().to_lowercase();
    if let Some(url) = url {
        text = text.replace(url, "");
    }
    if text.contains("certificate") || text.contains("tls") || text.contains("ssl") {
        return Some(TransportErrorKind::Tls);
    }
    if text.contains("proxy") || text.contains("tunnel") || text.contains("socks") {
        return Some(TransportErrorKind::Proxy);
    }

    let io_err = err.downcast_ref::<io::Error>()?;
    match io_err.kind() {
        io::ErrorKind::TimedOut if connecting => Some(TransportErrorKind::ConnectTimeout),
        io::ErrorKind::TimedOut => Some(TransportErrorKind::ReadTimeout),
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => Some(TransportErrorKind::Connection),
        _ => None,
    }
}
