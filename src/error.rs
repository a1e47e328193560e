//! Error types and HTTP status code mapping.

use std::fmt;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Response, StatusCode};

use crate::headers;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Every failure the proxy can produce, each mapping to a specific HTTP status.
#[derive(Debug)]
pub enum ProxyError {
    /// The configuration file or command line could not be loaded or validated.
    Config(String),
    /// The upstream target URL is malformed or unparseable.
    InvalidUpstream(String),
    /// The record store failed to read or write. Never a "not found".
    Storage(String),
    /// The client has used up its quota for the current window.
    QuotaExceeded {
        /// Whole seconds until the window resets.
        reset_secs: i64,
    },
    /// The outbound request could not be constructed; nothing was sent.
    UpstreamBuild(String),
    /// The upstream server could not be reached or broke the protocol.
    Upstream(hyper_util::client::legacy::Error),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::InvalidUpstream(msg) => write!(f, "invalid upstream: {msg}"),
            Self::Storage(msg) => write!(f, "storage error: {msg}"),
            Self::QuotaExceeded { .. } => write!(f, "429 Too many requests"),
            Self::UpstreamBuild(msg) => write!(f, "failed to build upstream request: {msg}"),
            Self::Upstream(err) => write!(f, "upstream error: {err}"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Upstream(err) => Some(err),
            _ => None,
        }
    }
}

impl ProxyError {
    /// Returns the HTTP status code corresponding to this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Config(_)
            | Self::InvalidUpstream(_)
            | Self::Storage(_)
            | Self::UpstreamBuild(_)
            | Self::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Converts this error into a plain-text HTTP response.
    ///
    /// A [`ProxyError::QuotaExceeded`] response carries the quota headers
    /// with a remaining count of zero.
    pub fn into_response(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(format!("{self}\n"))));
        *response.status_mut() = self.status_code();

        let resp_headers = response.headers_mut();
        resp_headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        if let Self::QuotaExceeded { reset_secs } = self {
            headers::set_quota_headers(resp_headers, 0, reset_secs);
        }

        response
    }
}

impl From<sqlx::Error> for ProxyError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
