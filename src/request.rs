use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::Result;
use crate::client::{Client, RequestOverrides};
use crate::error::Error;
use crate::response::Response;
use crate::retry::RetryPolicy;
use crate::util::{parse_header_name, parse_header_value};

#[doc(hidden)]
pub struct RequestBuilder<'a> {
    client: &'a Client,
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Bytes,
    retry_policy: Option<RetryPolicy>,
    pool_acquire_timeout: Option<Duration>,
    total_deadline: Option<Duration>,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a Client, method: Method, url: String) -> Self {
        Self {
            client,
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            retry_policy: None,
            pool_acquire_timeout: None,
            total_deadline: None,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        for (name, value) in &headers {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn json<T>(mut self, value: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(value).map_err(|source| Error::Serialize { source })?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Bytes::from(body);
        Ok(self)
    }

    /// Per-request retry policy, replacing the client default.
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    /// Per-request bound on waiting for a pooled connection slot.
    pub fn pool_acquire_timeout(mut self, pool_acquire_timeout: Duration) -> Self {
        self.pool_acquire_timeout = Some(pool_acquire_timeout);
        self
    }

    /// Per-request overall deadline covering every attempt, redirect, and
    /// backoff sleep.
    pub fn total_deadline(mut self, total_deadline: Duration) -> Self {
        self.total_deadline = Some(total_deadline.max(Duration::from_millis(1)));
        self
    }

    pub fn send(self) -> Result<Response> {
        self.client.execute(
            self.method,
            self.url,
            self.headers,
            self.body,
            RequestOverrides {
                retry_policy: self.retry_policy,
                pool_acquire_timeout: self.pool_acquire_timeout,
                total_deadline: self.total_deadline,
            },
        )
    }

    pub fn send_json<T>(self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.send()?.json()
    }
}
