//! Outgoing request.

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use url::Url;

use crate::wire::has_connection_token;
use crate::{PoolError, Result};

/// Methods that are safe to send twice.
const IDEMPOTENT_METHODS: [Method; 6] = [
    Method::GET,
    Method::HEAD,
    Method::DELETE,
    Method::OPTIONS,
    Method::PUT,
    Method::TRACE,
];

/// Check if a method may be replayed without extra side effects.
pub fn is_idempotent(method: &Method) -> bool {
    IDEMPOTENT_METHODS.contains(method)
}

/// Values accepted wherever the pool expects a destination URL.
pub trait IntoUrl {
    /// Convert into a parsed URL.
    fn into_url(self) -> Result<Url>;
}

impl IntoUrl for Url {
    fn into_url(self) -> Result<Url> {
        Ok(self)
    }
}

impl IntoUrl for &Url {
    fn into_url(self) -> Result<Url> {
        Ok(self.clone())
    }
}

impl IntoUrl for &str {
    fn into_url(self) -> Result<Url> {
        Ok(Url::parse(self)?)
    }
}

impl IntoUrl for String {
    fn into_url(self) -> Result<Url> {
        self.as_str().into_url()
    }
}

impl IntoUrl for &String {
    fn into_url(self) -> Result<Url> {
        self.as_str().into_url()
    }
}

/// HTTP/1.1 request sent over a pooled connection.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    target: String,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl Request {
    /// Create a request for an origin-form target such as `/users?page=2`.
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        let target = target.into();
        let target = if target.is_empty() {
            "/".to_string()
        } else if target.starts_with('/') || target == "*" {
            target
        } else {
            format!("/{}", target)
        };
        Self {
            method,
            target,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Create a request targeting the path and query of `url`.
    pub fn for_url(method: Method, url: &Url) -> Self {
        let target = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        Self::new(method, target)
    }

    /// Create a GET request.
    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::GET, target)
    }

    /// Create a POST request.
    pub fn post(target: impl Into<String>) -> Self {
        Self::new(Method::POST, target)
    }

    /// Create a PUT request.
    pub fn put(target: impl Into<String>) -> Self {
        Self::new(Method::PUT, target)
    }

    /// Create a PATCH request.
    pub fn patch(target: impl Into<String>) -> Self {
        Self::new(Method::PATCH, target)
    }

    /// Create a DELETE request.
    pub fn delete(target: impl Into<String>) -> Self {
        Self::new(Method::DELETE, target)
    }

    /// Create a HEAD request.
    pub fn head(target: impl Into<String>) -> Self {
        Self::new(Method::HEAD, target)
    }

    /// Create an OPTIONS request.
    pub fn options(target: impl Into<String>) -> Self {
        Self::new(Method::OPTIONS, target)
    }

    /// Create a TRACE request.
    pub fn trace(target: impl Into<String>) -> Self {
        Self::new(Method::TRACE, target)
    }

    /// Request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Origin-form target.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable request headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Request body, if any.
    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Append a header, keeping existing values with the same name.
    ///
    /// Invalid names or values are skipped.
    pub fn header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let Some((name, value)) = parse_header(name.as_ref(), value.as_ref()) {
            self.headers.append(name, value);
        }
        self
    }

    /// Set a header, replacing existing values with the same name.
    ///
    /// Invalid names or values are skipped.
    pub fn set_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let Some((name, value)) = parse_header(name.as_ref(), value.as_ref()) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Set the request body as raw bytes.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set the request body as text.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        self.body = Some(Bytes::from(text.into()));
        self
    }

    /// Set the request body as JSON.
    pub fn json<T: Serialize>(mut self, json: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(json).map_err(|e| PoolError::Decode(e.to_string()))?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(Bytes::from(bytes));
        Ok(self)
    }

    /// Check if this request may be replayed without extra side effects.
    pub fn is_idempotent(&self) -> bool {
        is_idempotent(&self.method)
    }

    /// Check if the request asks for the connection to be closed.
    pub fn wants_close(&self) -> bool {
        has_connection_token(&self.headers, "close")
    }

    /// Check if the request carries a `Connection` header.
    pub(crate) fn has_connection_header(&self) -> bool {
        self.headers.contains_key(CONNECTION)
    }
}

fn parse_header(name: &str, value: &str) -> Option<(HeaderName, HeaderValue)> {
    match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
        (Ok(name), Ok(value)) => Some((name, value)),
        _ => {
            tracing::warn!(header = name, "Skipping invalid request header");
            None
        }
    }
}
