use http::Uri;

use crate::error::Error;
use crate::transport::ConnectionConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub const fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }

    fn parse(scheme: &str) -> Option<Self> {
        if scheme.eq_ignore_ascii_case("http") {
            Some(Self::Http)
        } else if scheme.eq_ignore_ascii_case("https") {
            Some(Self::Https)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// The connection target: scheme, lowercased host, and effective port. Two
/// requests share a pooled connection only when their origins (and the rest of
/// the [`PoolKey`]) compare equal.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Origin {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Origin {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        let mut host = host.into();
        host.make_ascii_lowercase();
        Self { scheme, host, port }
    }

    pub fn from_uri(uri: &Uri) -> Result<Self, Error> {
        let invalid = || Error::InvalidUri {
            uri: uri.to_string(),
        };
        let scheme = uri.scheme_str().and_then(Scheme::parse).ok_or_else(invalid)?;
        let host = uri.host().ok_or_else(invalid)?;
        let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());
        Ok(Self::new(scheme, host, port))
    }

    pub const fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Host-and-port form suitable for a `host` header or socket address.
    pub(crate) fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub(crate) fn host_header_value(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            self.authority()
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Registry key: the origin plus every transport-affecting setting. Connection
/// compatibility is decided by value equality of the whole key, so requests
/// with different timeouts or blocksize never share a pooled connection.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolKey {
    origin: Origin,
    config: ConnectionConfig,
}

impl PoolKey {
    pub fn new(origin: Origin, config: ConnectionConfig) -> Self {
        Self { origin, config }
    }

    pub fn from_uri(uri: &Uri, config: &ConnectionConfig) -> Result<Self, Error> {
        Ok(Self::new(Origin::from_uri(uri)?, config.clone()))
    }

    pub const fn origin(&self) -> &Origin {
        &self.origin
    }

    pub const fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.origin, formatter)
    }
}
