//! HTTP response wrapper.

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use serde::de::DeserializeOwned;

use crate::wire::has_connection_token;
use crate::{PoolError, Result};

/// Status line and headers, available before the body is read.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub(crate) version: Version,
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
}

impl ResponseHead {
    /// Protocol version of the response.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get the status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a specific header value.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name.as_ref())
            .and_then(|v| v.to_str().ok())
    }

    /// Check if the peer will keep the connection open after this response.
    pub fn is_persistent(&self) -> bool {
        if has_connection_token(&self.headers, "close") {
            return false;
        }
        self.version > Version::HTTP_10 || has_connection_token(&self.headers, "keep-alive")
    }
}

/// HTTP response with a fully read body.
#[derive(Debug)]
pub struct Response {
    head: ResponseHead,
    body: Bytes,
    close_delimited: bool,
}

impl Response {
    pub(crate) fn new(head: ResponseHead, body: Bytes, close_delimited: bool) -> Self {
        Self {
            head,
            body,
            close_delimited,
        }
    }

    /// Status line and headers.
    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    /// Protocol version of the response.
    pub fn version(&self) -> Version {
        self.head.version
    }

    /// Get the status code.
    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    /// Check if the response was successful (2xx).
    pub fn is_success(&self) -> bool {
        self.head.status.is_success()
    }

    /// Get the response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// Get a specific header value.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.head.header(name)
    }

    /// Check if the body ran until the peer closed the connection.
    pub fn is_close_delimited(&self) -> bool {
        self.close_delimited
    }

    /// Get the response body as bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    /// Consume the response and return the body as bytes.
    pub fn into_bytes(self) -> Bytes {
        self.body
    }

    /// Get the response body as text.
    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.body.to_vec()).map_err(|e| PoolError::Decode(e.to_string()))
    }

    /// Parse the response body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| PoolError::Decode(e.to_string()))
    }

    /// Get the content length if available.
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use http::header::CONNECTION;

    fn head(version: Version, connection: Option<&'static str>) -> ResponseHead {
        let mut headers = HeaderMap::new();
        if let Some(value) = connection {
            headers.insert(CONNECTION, HeaderValue::from_static(value));
        }
        ResponseHead {
            version,
            status: StatusCode::OK,
            headers,
        }
    }

    #[test]
    fn test_persistence_rules() {
        assert!(head(Version::HTTP_11, None).is_persistent());
        assert!(!head(Version::HTTP_11, Some("close")).is_persistent());
        assert!(!head(Version::HTTP_10, None).is_persistent());
        assert!(head(Version::HTTP_10, Some("Keep-Alive")).is_persistent());
    }

    #[test]
    fn test_body_helpers() {
        let response = Response::new(
            head(Version::HTTP_11, None),
            Bytes::from_static(br#"{"id":7}"#),
            false,
        );
        assert!(response.is_success());
        assert_eq!(response.text().unwrap(), r#"{"id":7}"#);

        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["id"], 7);

        let invalid = Response::new(
            head(Version::HTTP_11, None),
            Bytes::from_static(&[0xff, 0xfe]),
            false,
        );
        assert!(matches!(invalid.text(), Err(PoolError::Decode(_))));
    }
}
