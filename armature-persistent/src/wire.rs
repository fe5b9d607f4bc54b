//! HTTP/1.1 framing over a blocking stream.

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, PROXY_AUTHORIZATION, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use std::io::{self, BufRead, Read, Write};

use crate::request::Request;
use crate::response::ResponseHead;

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;

/// Why an exchange failed.
#[derive(Debug)]
pub(crate) enum Failure {
    /// The peer answered with something that is not valid HTTP.
    BadResponse(String),
    /// The transport failed: I/O error, timeout, TLS error or early EOF.
    Reset(io::Error),
}

impl Failure {
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Self::BadResponse(message) => io::Error::new(io::ErrorKind::InvalidData, message),
            Self::Reset(e) => e,
        }
    }
}

impl From<io::Error> for Failure {
    fn from(e: io::Error) -> Self {
        Self::Reset(e)
    }
}

/// Check if any `Connection` header value contains `token`.
pub(crate) fn has_connection_token(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains(token))
}

/// Serialize and send a request.
pub(crate) fn write_request<W: Write>(
    writer: &mut W,
    request: &Request,
    target: &str,
    authority: &str,
    proxy_authorization: Option<&str>,
) -> io::Result<()> {
    let headers = request.headers();
    let mut head = Vec::with_capacity(256);

    write!(head, "{} {} HTTP/1.1\r\n", request.method(), target)?;
    if !headers.contains_key(HOST) {
        write!(head, "Host: {}\r\n", authority)?;
    }
    if let Some(auth) = proxy_authorization
        && !headers.contains_key(PROXY_AUTHORIZATION)
    {
        write!(head, "Proxy-Authorization: {}\r\n", auth)?;
    }
    for (name, value) in headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }

    let framed = headers.contains_key(CONTENT_LENGTH) || headers.contains_key(TRANSFER_ENCODING);
    match request.body_bytes() {
        Some(body) if !framed => write!(head, "Content-Length: {}\r\n", body.len())?,
        None if !framed && expects_body(request.method()) => {
            head.extend_from_slice(b"Content-Length: 0\r\n")
        }
        _ => {}
    }
    head.extend_from_slice(b"\r\n");

    writer.write_all(&head)?;
    if let Some(body) = request.body_bytes() {
        writer.write_all(body)?;
    }
    writer.flush()
}

fn expects_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Read a final response head, skipping interim 1xx responses.
pub(crate) fn read_head<R: BufRead>(reader: &mut R) -> Result<ResponseHead, Failure> {
    loop {
        let raw = read_raw_head(reader)?;
        let head = parse_head(&raw)?;
        if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
            continue;
        }
        return Ok(head);
    }
}

fn read_raw_head<R: BufRead>(reader: &mut R) -> Result<Vec<u8>, Failure> {
    let mut raw = Vec::with_capacity(512);
    let mut limited = reader.by_ref().take(MAX_HEAD_BYTES as u64 + 1);
    loop {
        let read = limited.read_until(b'\n', &mut raw)?;
        if read == 0 {
            if limited.limit() == 0 {
                return Err(Failure::BadResponse("response head too large".to_string()));
            }
            return Err(Failure::Reset(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before a complete response head",
            )));
        }
        if raw == b"\r\n" || raw == b"\n" {
            raw.clear();
            continue;
        }
        if raw.ends_with(b"\r\n\r\n") || raw.ends_with(b"\n\n") {
            return Ok(raw);
        }
        if raw.len() > MAX_HEAD_BYTES {
            return Err(Failure::BadResponse("response head too large".to_string()));
        }
    }
}

fn parse_head(raw: &[u8]) -> Result<ResponseHead, Failure> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);
    match parsed.parse(raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(Failure::BadResponse("incomplete response head".to_string()));
        }
        Err(e) => return Err(Failure::BadResponse(format!("invalid response: {e}"))),
    }

    let code = parsed
        .code
        .ok_or_else(|| Failure::BadResponse("missing status code".to_string()))?;
    let status = StatusCode::from_u16(code)
        .map_err(|_| Failure::BadResponse(format!("invalid status code {code}")))?;
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut map = HeaderMap::with_capacity(parsed.headers.len());
    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| Failure::BadResponse(format!("invalid header name {:?}", header.name)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| Failure::BadResponse(format!("invalid value for header {name}")))?;
        map.append(name, value);
    }

    Ok(ResponseHead {
        version,
        status,
        headers: map,
    })
}

/// Read the body that follows `head`.
///
/// Returns the body and whether it was delimited by the peer closing the
/// connection.
pub(crate) fn read_body<R: BufRead>(
    reader: &mut R,
    method: &Method,
    head: &ResponseHead,
) -> Result<(Bytes, bool), Failure> {
    let status = head.status;
    if *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok((Bytes::new(), false));
    }

    if is_chunked(&head.headers) {
        return read_chunked(reader).map(|body| (body, false));
    }

    if let Some(length) = content_length(&head.headers)? {
        let mut body = Vec::with_capacity(length.min(1 << 20) as usize);
        reader.by_ref().take(length).read_to_end(&mut body)?;
        if (body.len() as u64) < length {
            return Err(Failure::Reset(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("body ended after {} of {} bytes", body.len(), length),
            )));
        }
        return Ok((Bytes::from(body), false));
    }

    let mut body = Vec::new();
    reader.read_to_end(&mut body)?;
    Ok((Bytes::from(body), true))
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("chunked"))
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>, Failure> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| Failure::BadResponse("invalid Content-Length".to_string()))?;
        match length {
            Some(previous) if previous != parsed => {
                return Err(Failure::BadResponse(
                    "conflicting Content-Length headers".to_string(),
                ));
            }
            _ => length = Some(parsed),
        }
    }
    Ok(length)
}

fn read_chunked<R: BufRead>(reader: &mut R) -> Result<Bytes, Failure> {
    let mut body = Vec::new();
    let mut line = Vec::with_capacity(32);

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Err(eof("connection closed inside chunked body"));
        }
        let size = match httparse::parse_chunk_size(&line) {
            Ok(httparse::Status::Complete((_, size))) => size,
            _ => return Err(Failure::BadResponse("invalid chunk size".to_string())),
        };

        if size == 0 {
            // Trailers end with an empty line.
            loop {
                line.clear();
                if reader.read_until(b'\n', &mut line)? == 0 || line == b"\r\n" || line == b"\n" {
                    return Ok(Bytes::from(body));
                }
            }
        }

        let start = body.len();
        reader.by_ref().take(size).read_to_end(&mut body)?;
        if ((body.len() - start) as u64) < size {
            return Err(eof("connection closed inside a chunk"));
        }

        line.clear();
        reader.read_until(b'\n', &mut line)?;
        if line != b"\r\n" && line != b"\n" {
            return Err(Failure::BadResponse("missing chunk terminator".to_string()));
        }
    }
}

fn eof(message: &str) -> Failure {
    Failure::Reset(io::Error::new(io::ErrorKind::UnexpectedEof, message.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn response(raw: &str) -> Cursor<Vec<u8>> {
        Cursor::new(raw.as_bytes().to_vec())
    }

    #[test]
    fn test_write_request_adds_framing_headers() {
        let request = Request::post("/orders").header("X-Trace", "1").body("hello");
        let mut out = Vec::new();
        write_request(&mut out, &request, "/orders", "api.local:8080", None).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("POST /orders HTTP/1.1\r\nHost: api.local:8080\r\n"));
        assert!(text.contains("x-trace: 1\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn test_write_request_through_proxy() {
        let request = Request::get("/");
        let mut out = Vec::new();
        write_request(
            &mut out,
            &request,
            "http://example.com/",
            "example.com",
            Some("Basic abc"),
        )
        .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("GET http://example.com/ HTTP/1.1\r\n"));
        assert!(text.contains("Proxy-Authorization: Basic abc\r\n"));
        assert!(!text.contains("Content-Length"));
    }

    #[test]
    fn test_empty_post_gets_zero_length() {
        let mut out = Vec::new();
        write_request(&mut out, &Request::post("/"), "/", "h", None).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn test_read_content_length_response() {
        let mut reader = response("HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhelloEXTRA");
        let head = read_head(&mut reader).unwrap();
        assert_eq!(head.status(), StatusCode::OK);
        assert_eq!(head.version(), Version::HTTP_11);

        let (body, close_delimited) = read_body(&mut reader, &Method::GET, &head).unwrap();
        assert_eq!(body.as_ref(), b"hello");
        assert!(!close_delimited);
    }

    #[test]
    fn test_read_chunked_response() {
        let mut reader = response(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
             5\r\nhello\r\n7;ext=1\r\n, world\r\n0\r\nX-Trailer: yes\r\n\r\n",
        );
        let head = read_head(&mut reader).unwrap();
        let (body, _) = read_body(&mut reader, &Method::GET, &head).unwrap();
        assert_eq!(body.as_ref(), b"hello, world");
    }

    #[test]
    fn test_skips_interim_responses() {
        let mut reader = response(
            "HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n",
        );
        let head = read_head(&mut reader).unwrap();
        assert_eq!(head.status(), StatusCode::CREATED);
    }

    #[test]
    fn test_close_delimited_body() {
        let mut reader = response("HTTP/1.0 200 OK\r\n\r\nuntil eof");
        let head = read_head(&mut reader).unwrap();
        assert_eq!(head.version(), Version::HTTP_10);

        let (body, close_delimited) = read_body(&mut reader, &Method::GET, &head).unwrap();
        assert_eq!(body.as_ref(), b"until eof");
        assert!(close_delimited);
    }

    #[test]
    fn test_head_and_no_content_have_no_body() {
        let mut reader = response("HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n");
        let head = read_head(&mut reader).unwrap();
        let (body, _) = read_body(&mut reader, &Method::HEAD, &head).unwrap();
        assert!(body.is_empty());

        let mut reader = response("HTTP/1.1 204 No Content\r\n\r\n");
        let head = read_head(&mut reader).unwrap();
        let (body, _) = read_body(&mut reader, &Method::DELETE, &head).unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn test_garbage_is_bad_response() {
        let mut reader = response("garbage\r\n\r\n");
        assert!(matches!(read_head(&mut reader), Err(Failure::BadResponse(_))));
    }

    #[test]
    fn test_unterminated_head_is_bounded() {
        let mut raw = b"HTTP/1.1 200 OK\r\nX-Filler: ".to_vec();
        raw.resize(4 * MAX_HEAD_BYTES, b'a');
        let mut reader = Cursor::new(raw);

        assert!(matches!(read_head(&mut reader), Err(Failure::BadResponse(_))));
        assert!(reader.position() <= MAX_HEAD_BYTES as u64 + 1);
    }

    #[test]
    fn test_switching_protocols_is_final() {
        let mut reader = response(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
        );
        let head = read_head(&mut reader).unwrap();
        assert_eq!(head.status(), StatusCode::SWITCHING_PROTOCOLS);
        let (body, close_delimited) = read_body(&mut reader, &Method::GET, &head).unwrap();
        assert!(body.is_empty());
        assert!(!close_delimited);
    }

    #[test]
    fn test_eof_is_reset() {
        let mut reader = response("");
        assert!(matches!(read_head(&mut reader), Err(Failure::Reset(_))));

        let mut reader = response("HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort");
        let head = read_head(&mut reader).unwrap();
        assert!(matches!(
            read_body(&mut reader, &Method::GET, &head),
            Err(Failure::Reset(_))
        ));
    }

    #[test]
    fn test_conflicting_content_length() {
        let mut reader =
            response("HTTP/1.1 200 OK\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\nab");
        let head = read_head(&mut reader).unwrap();
        assert!(matches!(
            read_body(&mut reader, &Method::GET, &head),
            Err(Failure::BadResponse(_))
        ));
    }

    #[test]
    fn test_connection_tokens() {
        let mut headers = HeaderMap::new();
        headers.append(CONNECTION, HeaderValue::from_static("Upgrade, Close"));
        assert!(has_connection_token(&headers, "close"));
        assert!(!has_connection_token(&headers, "keep-alive"));
    }
}
