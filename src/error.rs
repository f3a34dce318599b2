use http::Method;
use thiserror::Error;

use crate::retry::Attempt;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectErrorKind {
    Dns,
    Refused,
    Timeout,
    Tls,
    Io,
}

impl std::fmt::Display for ConnectErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Refused => "refused",
            Self::Timeout => "timeout",
            Self::Tls => "tls",
            Self::Io => "io",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadErrorKind {
    Timeout,
    Truncated,
    Protocol,
    Io,
}

impl std::fmt::Display for ReadErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Timeout => "timeout",
            Self::Truncated => "truncated",
            Self::Protocol => "protocol",
            Self::Io => "io",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    Connect,
    Read,
    PoolExhausted,
    PoolClosed,
    MaxRetriesExceeded,
    TooManyRedirects,
    DeadlineExceeded,
    Serialize,
    Deserialize,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::Connect => "connect",
            Self::Read => "read",
            Self::PoolExhausted => "pool_exhausted",
            Self::PoolClosed => "pool_closed",
            Self::MaxRetriesExceeded => "max_retries_exceeded",
            Self::TooManyRedirects => "too_many_redirects",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Serialize => "serialize",
            Self::Deserialize => "deserialize",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("connect error ({kind}) for {uri}: {source}")]
    Connect {
        kind: ConnectErrorKind,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("read error ({kind}) for {method} {uri}: {source}")]
    Read {
        kind: ReadErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("connection pool for {key} is exhausted after waiting {wait_ms}ms")]
    PoolExhausted { key: String, wait_ms: u128 },
    #[error("connection pool for {key} is closed")]
    PoolClosed { key: String },
    #[error("max retries exceeded for {method} {uri} ({cause}) after {} attempts", history.len())]
    MaxRetriesExceeded {
        method: Method,
        uri: String,
        cause: String,
        history: Vec<Attempt>,
    },
    #[error("too many redirects for {method} {uri} (last location: {location})")]
    TooManyRedirects {
        method: Method,
        uri: String,
        location: String,
        history: Vec<Attempt>,
    },
    #[error("request deadline exceeded after {timeout_ms}ms for {method} {uri}")]
    DeadlineExceeded {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("failed to serialize request json: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::Connect { .. } => ErrorCode::Connect,
            Self::Read { .. } => ErrorCode::Read,
            Self::PoolExhausted { .. } => ErrorCode::PoolExhausted,
            Self::PoolClosed { .. } => ErrorCode::PoolClosed,
            Self::MaxRetriesExceeded { .. } => ErrorCode::MaxRetriesExceeded,
            Self::TooManyRedirects { .. } => ErrorCode::TooManyRedirects,
            Self::DeadlineExceeded { .. } => ErrorCode::DeadlineExceeded,
            Self::Serialize { .. } => ErrorCode::Serialize,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
        }
    }

    /// Failures that happened before any request bytes could have reached the
    /// server. Always safe to retry against the connect budget.
    pub const fn is_connect_class(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::PoolExhausted { .. } | Self::PoolClosed { .. }
        )
    }

    /// Failures after the request was (possibly partially) sent. Retrying is
    /// gated on the retry policy's allowed-methods set.
    pub const fn is_read_class(&self) -> bool {
        matches!(self, Self::Read { .. })
    }
}
