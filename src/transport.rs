use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};

use crate::error::Error;
use crate::origin::Origin;
use crate::response::Response;

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_BLOCKSIZE: usize = 8192;

/// Transport-affecting connection settings. Part of the [`PoolKey`], so every
/// field participates in connection-compatibility comparison.
///
/// [`PoolKey`]: crate::origin::PoolKey
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionConfig {
    connect_timeout: Duration,
    read_timeout: Option<Duration>,
    blocksize: usize,
}

impl ConnectionConfig {
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = Some(read_timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn no_read_timeout(mut self) -> Self {
        self.read_timeout = None;
        self
    }

    pub fn blocksize(mut self, blocksize: usize) -> Self {
        self.blocksize = blocksize.max(1);
        self
    }

    pub const fn configured_connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub const fn configured_read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub const fn configured_blocksize(&self) -> usize {
        self.blocksize
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
            blocksize: DEFAULT_BLOCKSIZE,
        }
    }
}

/// A fully resolved request ready for the wire: absolute target plus merged
/// headers and a buffered, replayable body.
#[derive(Clone, Debug)]
pub struct PreparedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl PreparedRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
        }
    }
}

/// One established link to an origin. Implementations own the socket (and TLS
/// session) and the wire framing; the pool and orchestrator only ever speak
/// this interface.
///
/// `send` failures are read-class errors: the request may have partially
/// reached the server, so retrying them is gated on the retry policy's
/// allowed-methods set.
pub trait Transport: Send {
    fn send(&mut self, request: &PreparedRequest) -> Result<(), Error>;

    fn receive(&mut self) -> Result<Response, Error>;

    /// False once the peer signalled close, keep-alive is unsupported, or a
    /// fatal read/write error occurred.
    fn is_reusable(&self) -> bool;

    /// Cheap non-blocking readability probe: false when the peer has silently
    /// closed the link (or sent unsolicited bytes) while it sat idle.
    fn probe_alive(&mut self) -> bool;

    /// Whether the TLS peer was verified. Always false for plain TCP.
    fn verified(&self) -> bool;

    /// Releases the socket. Idempotent.
    fn close(&mut self);
}

/// Startup-time injected connection strategy. The default is
/// [`Http1Connector`]; tests substitute in-memory fakes.
///
/// [`Http1Connector`]: crate::http1::Http1Connector
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        origin: &Origin,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn Transport>, Error>;
}
