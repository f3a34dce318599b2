use std::sync::Arc;
use std::time::Instant;

use crate::error::{ConnectErrorKind, Error};
use crate::origin::Origin;
use crate::response::Response;
use crate::transport::{ConnectionConfig, Connector, PreparedRequest, Transport};

/// One logical link to an origin.
///
/// A connection is either *closed* (no transport) or *open*. It starts closed,
/// opens lazily on first use, and once closed is never resurrected; the pool
/// creates a fresh `Connection` instead.
pub struct Connection {
    origin: Origin,
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
    created_at: Instant,
    last_used_at: Instant,
}

impl Connection {
    pub(crate) fn new(
        origin: Origin,
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let now = Instant::now();
        Self {
            origin,
            config,
            connector,
            transport: None,
            created_at: now,
            last_used_at: now,
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    /// Whether the TLS peer was verified. False while closed or for plain TCP.
    pub fn verified(&self) -> bool {
        self.transport
            .as_ref()
            .is_some_and(|transport| transport.verified())
    }

    /// Establishes the transport. No-op when already open.
    pub fn connect(&mut self) -> Result<(), Error> {
        if self.transport.is_some() {
            return Ok(());
        }
        let transport = self.connector.connect(&self.origin, &self.config)?;
        self.transport = Some(transport);
        self.last_used_at = Instant::now();
        Ok(())
    }

    pub fn send(&mut self, request: &PreparedRequest) -> Result<(), Error> {
        self.connect()?;
        self.last_used_at = Instant::now();
        let transport = self.transport.as_mut().ok_or_else(|| Error::Connect {
            kind: ConnectErrorKind::Io,
            uri: self.origin.to_string(),
            source: "connection is closed".into(),
        })?;
        transport.send(request)
    }

    pub fn receive(&mut self) -> Result<Response, Error> {
        let transport = self.transport.as_mut().ok_or_else(|| Error::Connect {
            kind: ConnectErrorKind::Io,
            uri: self.origin.to_string(),
            source: "connection is closed".into(),
        })?;
        let response = transport.receive();
        self.last_used_at = Instant::now();
        response
    }

    /// False once closed, or once the transport reported it must not be kept
    /// alive (peer close, protocol violation, fatal read/write error).
    pub fn is_reusable(&self) -> bool {
        self.transport
            .as_ref()
            .is_some_and(|transport| transport.is_reusable())
    }

    /// Non-blocking liveness probe for idle connections. A closed connection
    /// is not alive.
    pub(crate) fn probe_alive(&mut self) -> bool {
        self.transport
            .as_mut()
            .is_some_and(|transport| transport.probe_alive())
    }

    /// Releases the transport. Idempotent; the only operation guaranteed not
    /// to fail on an already-closed connection.
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Connection")
            .field("origin", &self.origin)
            .field("open", &self.is_open())
            .field("created_at", &self.created_at)
            .field("last_used_at", &self.last_used_at)
            .finish()
    }
}
