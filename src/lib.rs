//! `poolx` is a connection-pooling HTTP transport core: bounded per-origin
//! connection pools, an LRU pool registry, and a retry/backoff engine driving
//! redirects and retries over raw TCP + TLS.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use poolx::prelude::{Client, RetryPolicy};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .client_name("my-sdk")
//!         .pool_maxsize(4)
//!         .num_pools(8)
//!         .connect_timeout(Duration::from_secs(3))
//!         .retry_policy(
//!             RetryPolicy::standard()
//!                 .total(Some(3))
//!                 .backoff_factor(0.2)
//!                 .status_forcelist([502, 503]),
//!         )
//!         .build();
//!
//!     let response = client.get("https://api.example.com/v1/items").send()?;
//!     println!("status={}", response.status());
//!     Ok(())
//! }
//! ```
//!
//! # Recommended Defaults
//!
//! - Keep `pool_block(false)` unless callers can tolerate waiting for a slot.
//! - Cap `total` retries and set a `total_deadline` for SDK traffic.
//! - The pool registry is owned by the [`Client`]; construct one client per
//!   logical session and clone it instead of creating registries ad hoc.

mod client;
mod connection;
mod error;
mod http1;
mod manager;
mod metrics;
mod origin;
mod pool;
mod request;
mod response;
mod retry;
#[cfg(feature = "tls-rustls")]
mod tls;
mod transport;
mod util;

pub use crate::client::{Client, ClientBuilder};
pub use crate::connection::Connection;
pub use crate::error::{ConnectErrorKind, Error, ErrorCode, ReadErrorKind};
pub use crate::http1::Http1Connector;
pub use crate::manager::PoolManager;
pub use crate::metrics::ClientMetricsSnapshot;
pub use crate::origin::{Origin, PoolKey, Scheme};
pub use crate::pool::{ConnectionPool, PoolOptions};
pub use crate::request::RequestBuilder;
pub use crate::response::Response;
pub use crate::retry::{Attempt, RetryPolicy};
pub use crate::transport::{ConnectionConfig, Connector, PreparedRequest, Transport};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Client, ClientMetricsSnapshot, ConnectErrorKind, Connection, ConnectionConfig,
        ConnectionPool, Connector, Error, ErrorCode, Origin, PoolKey, PoolManager, PoolOptions,
        ReadErrorKind, RequestBuilder, Response, Result, RetryPolicy, Scheme,
    };
}
