use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, USER_AGENT};
use http::{HeaderMap, Method, Uri};
use tracing::{debug, info_span, warn};

use crate::Result;
use crate::error::Error;
use crate::manager::{DEFAULT_NUM_POOLS, PoolManager};
use crate::metrics::{ClientMetrics, ClientMetricsSnapshot};
use crate::pool::PoolOptions;
use crate::request::RequestBuilder;
use crate::response::Response;
use crate::retry::RetryPolicy;
use crate::transport::{ConnectionConfig, Connector, PreparedRequest};
use crate::util::{
    bounded_retry_delay, deadline_exceeded_error, merge_headers, parse_absolute_uri,
    parse_header_name, parse_header_value, redirect_method, resolve_redirect_uri, same_origin,
    sanitize_headers_for_redirect,
};

const DEFAULT_CLIENT_NAME: &str = "poolx";

pub(crate) struct RequestOverrides {
    pub(crate) retry_policy: Option<RetryPolicy>,
    pub(crate) pool_acquire_timeout: Option<Duration>,
    pub(crate) total_deadline: Option<Duration>,
}

pub struct ClientBuilder {
    num_pools: usize,
    pool_options: PoolOptions,
    connection_config: ConnectionConfig,
    connector: Option<Arc<dyn Connector>>,
    retry_policy: RetryPolicy,
    default_headers: HeaderMap,
    client_name: String,
    pool_acquire_timeout: Option<Duration>,
    total_deadline: Option<Duration>,
}

impl ClientBuilder {
    pub(crate) fn new() -> Self {
        Self {
            num_pools: DEFAULT_NUM_POOLS,
            pool_options: PoolOptions::default(),
            connection_config: ConnectionConfig::default(),
            connector: None,
            retry_policy: RetryPolicy::standard(),
            default_headers: HeaderMap::new(),
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            pool_acquire_timeout: None,
            total_deadline: None,
        }
    }

    /// Number of per-origin pools the registry keeps resident before LRU
    /// eviction kicks in.
    pub fn num_pools(mut self, num_pools: usize) -> Self {
        self.num_pools = num_pools.max(1);
        self
    }

    pub fn pool_maxsize(mut self, pool_maxsize: usize) -> Self {
        self.pool_options = self.pool_options.maxsize(pool_maxsize);
        self
    }

    /// Blocking acquisition: exhausted pools wait for a slot instead of
    /// failing fast.
    pub fn pool_block(mut self, pool_block: bool) -> Self {
        self.pool_options = self.pool_options.block(pool_block);
        self
    }

    /// Bound on waiting for a pooled connection slot in blocking mode.
    pub fn pool_acquire_timeout(mut self, pool_acquire_timeout: Duration) -> Self {
        self.pool_acquire_timeout = Some(pool_acquire_timeout);
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connection_config = self.connection_config.connect_timeout(connect_timeout);
        self
    }

    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.connection_config = self.connection_config.read_timeout(read_timeout);
        self
    }

    pub fn blocksize(mut self, blocksize: usize) -> Self {
        self.connection_config = self.connection_config.blocksize(blocksize);
        self
    }

    /// Overall per-request deadline covering attempts, redirects, and backoff
    /// sleeps.
    pub fn total_deadline(mut self, total_deadline: Duration) -> Self {
        self.total_deadline = Some(total_deadline.max(Duration::from_millis(1)));
        self
    }

    /// Substitutes the connection strategy; the default is
    /// [`Http1Connector`](crate::http1::Http1Connector).
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn build(self) -> Client {
        let manager = match self.connector {
            Some(connector) => PoolManager::with_connector(
                self.num_pools,
                self.pool_options,
                self.connection_config,
                connector,
            ),
            None => PoolManager::new(self.num_pools, self.pool_options, self.connection_config),
        };

        Client {
            manager: Arc::new(manager),
            retry_policy: self.retry_policy,
            default_headers: self.default_headers,
            client_name: self.client_name,
            pool_acquire_timeout: self.pool_acquire_timeout,
            total_deadline: self.total_deadline,
            metrics: ClientMetrics::default(),
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The request orchestrator: owns a [`PoolManager`] and drives each logical
/// request (acquisition, transmission, redirects, retries) until a final
/// response or a terminal error.
///
/// There is intentionally no process-global client or registry; construct one
/// and clone it (clones share the registry and metrics).
#[derive(Clone)]
pub struct Client {
    manager: Arc<PoolManager>,
    retry_policy: RetryPolicy,
    default_headers: HeaderMap,
    client_name: String,
    pool_acquire_timeout: Option<Duration>,
    total_deadline: Option<Duration>,
    metrics: ClientMetrics,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Wraps an explicitly constructed, caller-owned registry. Configuration
    /// that lives on the registry (pool sizing, timeouts, connector) is taken
    /// from it as-is.
    pub fn with_manager(manager: Arc<PoolManager>) -> Self {
        Self {
            manager,
            retry_policy: RetryPolicy::standard(),
            default_headers: HeaderMap::new(),
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            pool_acquire_timeout: None,
            total_deadline: None,
            metrics: ClientMetrics::default(),
        }
    }

    pub fn manager(&self) -> &Arc<PoolManager> {
        &self.manager
    }

    pub fn metrics_snapshot(&self) -> ClientMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn request(&self, method: Method, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, url.into())
    }

    pub fn get(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, url)
    }

    pub fn head(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::HEAD, url)
    }

    pub fn post(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, url)
    }

    pub fn patch(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, url)
    }

    pub fn delete(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, url)
    }

    pub(crate) fn execute(
        &self,
        method: Method,
        url: String,
        headers: HeaderMap,
        body: Bytes,
        overrides: RequestOverrides,
    ) -> Result<Response> {
        let started_at = Instant::now();
        self.metrics.record_request_started();
        let _in_flight = self.metrics.enter_in_flight();
        let result = self.execute_with_retry(method, url, headers, body, overrides);
        self.metrics
            .record_request_completed(&result, started_at.elapsed());
        result
    }

    fn execute_with_retry(
        &self,
        method: Method,
        url: String,
        headers: HeaderMap,
        body: Bytes,
        overrides: RequestOverrides,
    ) -> Result<Response> {
        let mut uri = parse_absolute_uri(&url)?;
        let mut uri_text = uri.to_string();
        let mut method = method;
        let mut body = body;
        let mut policy = overrides
            .retry_policy
            .unwrap_or_else(|| self.retry_policy.clone());
        let acquire_timeout = overrides.pool_acquire_timeout.or(self.pool_acquire_timeout);
        let total_deadline = overrides.total_deadline.or(self.total_deadline);
        let mut request_headers = merge_headers(&self.default_headers, &headers);
        self.ensure_user_agent(&mut request_headers);
        let request_started_at = Instant::now();

        loop {
            if let Some(deadline) = total_deadline
                && request_started_at.elapsed() >= deadline
            {
                return Err(deadline_exceeded_error(total_deadline, &method, &uri_text));
            }

            let span = info_span!(
                "poolx.request",
                client = %self.client_name,
                method = %method,
                uri = %uri_text,
                prior_attempts = policy.history().len()
            );
            let _enter = span.enter();
            debug!("sending request");

            let response = match self.send_once(&method, &uri, &request_headers, &body, acquire_timeout)
            {
                Ok(response) => response,
                Err(error) if error.is_connect_class() || error.is_read_class() => {
                    if error.is_read_class() && !policy.is_method_allowed(&method) {
                        return Err(error);
                    }
                    policy = policy.increment(&method, &uri_text, Some(&error), None)?;
                    let retry_delay = policy.get_backoff_time();
                    warn!(
                        delay_ms = retry_delay.as_millis() as u64,
                        error = %error,
                        "retrying request after transport error"
                    );
                    self.metrics.record_retry();
                    self.sleep_bounded(retry_delay, total_deadline, request_started_at, &method, &uri_text)?;
                    continue;
                }
                Err(error) => return Err(error),
            };

            if let Some(location) = response.redirect_location() {
                let Some(target) = resolve_redirect_uri(&uri, &location) else {
                    return Err(Error::InvalidUri { uri: location });
                };
                policy = match policy.increment(&method, &uri_text, None, Some(&response)) {
                    Ok(next) => next,
                    Err(Error::MaxRetriesExceeded { history, .. })
                        if policy.configured_raise_on_redirect() =>
                    {
                        return Err(Error::TooManyRedirects {
                            method,
                            uri: uri_text,
                            location,
                            history,
                        });
                    }
                    Err(_) => return Ok(response),
                };

                let next_method = redirect_method(&method, response.status());
                let method_changed = next_method != method;
                sanitize_headers_for_redirect(
                    &mut request_headers,
                    method_changed,
                    same_origin(&uri, &target),
                );
                if method_changed {
                    body = Bytes::new();
                }
                // A redirect carrying Retry-After is honored before re-issuing.
                if policy.configured_respect_retry_after_header()
                    && let Some(delay) = response
                        .retry_after_value()
                        .and_then(|value| policy.parse_retry_after(value, SystemTime::now()))
                {
                    self.sleep_bounded(delay, total_deadline, request_started_at, &method, &uri_text)?;
                }
                debug!(
                    status = response.status().as_u16(),
                    location = %target,
                    "following redirect"
                );
                self.metrics.record_redirect();
                method = next_method;
                uri_text = target.to_string();
                uri = target;
                continue;
            }

            if policy.is_retry(&method, response.status(), response.has_retry_after()) {
                policy = match policy.increment(&method, &uri_text, None, Some(&response)) {
                    Ok(next) => next,
                    Err(error) if policy.configured_raise_on_status() => return Err(error),
                    Err(_) => return Ok(response),
                };
                let retry_delay = if policy.configured_respect_retry_after_header() {
                    response
                        .retry_after_value()
                        .and_then(|value| policy.parse_retry_after(value, SystemTime::now()))
                } else {
                    None
                }
                .unwrap_or_else(|| policy.get_backoff_time());
                warn!(
                    status = response.status().as_u16(),
                    delay_ms = retry_delay.as_millis() as u64,
                    "retrying request after retryable status"
                );
                self.metrics.record_retry();
                self.sleep_bounded(retry_delay, total_deadline, request_started_at, &method, &uri_text)?;
                continue;
            }

            debug!(status = response.status().as_u16(), "request completed");
            return Ok(response);
        }
    }

    /// One attempt: acquire, lazily connect, send, receive, and hand the
    /// connection back (release when reusable, invalidate otherwise).
    fn send_once(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: &Bytes,
        acquire_timeout: Option<Duration>,
    ) -> Result<Response> {
        let pool = self.manager.pool_for_uri(uri)?;
        let mut connection = pool.acquire(acquire_timeout)?;

        let was_open = connection.is_open();
        if let Err(error) = connection.connect() {
            pool.invalidate(connection);
            return Err(error);
        }
        if was_open {
            self.metrics.record_connection_reused();
        } else {
            self.metrics.record_connection_created();
        }

        let request = PreparedRequest::new(method.clone(), uri.clone(), headers.clone(), body.clone());
        if let Err(error) = connection.send(&request) {
            pool.invalidate(connection);
            return Err(error);
        }
        match connection.receive() {
            Ok(response) => {
                if connection.is_reusable() {
                    pool.release(connection);
                } else {
                    pool.invalidate(connection);
                }
                Ok(response)
            }
            Err(error) => {
                pool.invalidate(connection);
                Err(error)
            }
        }
    }

    fn sleep_bounded(
        &self,
        retry_delay: Duration,
        total_deadline: Option<Duration>,
        request_started_at: Instant,
        method: &Method,
        uri_text: &str,
    ) -> Result<()> {
        let Some(delay) = bounded_retry_delay(retry_delay, total_deadline, request_started_at)
        else {
            return Err(deadline_exceeded_error(total_deadline, method, uri_text));
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        Ok(())
    }

    fn ensure_user_agent(&self, headers: &mut HeaderMap) {
        if headers.contains_key(USER_AGENT) {
            return;
        }
        if let Ok(value) = HeaderValue::from_str(&self.client_name) {
            headers.insert(USER_AGENT, value);
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Client")
            .field("client_name", &self.client_name)
            .field("manager", &self.manager)
            .finish()
    }
}
