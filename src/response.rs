use bytes::Bytes;
use http::header::RETRY_AFTER;
use http::{HeaderMap, StatusCode, Version};
use serde::de::DeserializeOwned;

use crate::Result;
use crate::error::Error;
use crate::util::{is_redirect_status, redirect_location, truncate_body};

/// A fully buffered HTTP response as handed back by a [`Transport`].
///
/// [`Transport`]: crate::transport::Transport
#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode, version: Version, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            version,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T>(&self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(|source| Error::Deserialize {
            source,
            body: truncate_body(&self.body),
        })
    }

    /// The `location` header value when this response is a redirect.
    pub fn redirect_location(&self) -> Option<String> {
        if !is_redirect_status(self.status) {
            return None;
        }
        redirect_location(&self.headers)
    }

    pub(crate) fn has_retry_after(&self) -> bool {
        self.headers.contains_key(RETRY_AFTER)
    }

    pub(crate) fn retry_after_value(&self) -> Option<&str> {
        self.headers.get(RETRY_AFTER)?.to_str().ok()
    }
}
