//! A single persistent HTTP/1.1 connection.

use http::Method;
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use std::fmt;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace};
use url::Url;

use crate::proxy::Proxy;
use crate::request::Request;
use crate::response::{Response, ResponseHead};
use crate::socket::{self, SocketOption};
use crate::tls;
use crate::wire::{self, Failure};
use crate::{PoolError, Result};

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Identity of a reusable connection within one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    /// Destination host, without IPv6 brackets.
    pub host: String,
    /// Destination port.
    pub port: u16,
    /// Proxy the connection goes through.
    pub proxy: Option<Proxy>,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", authority_of(&self.host, self.port))?;
        if let Some(proxy) = &self.proxy {
            write!(f, " via {}", proxy.address())?;
        }
        Ok(())
    }
}

/// Where a request URL points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Destination {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) tls: bool,
}

impl Destination {
    pub(crate) fn from_url(url: &Url) -> Result<Self> {
        let tls = match url.scheme() {
            "http" => false,
            "https" => true,
            other => {
                return Err(PoolError::InvalidUrl(format!(
                    "unsupported scheme {other:?} in {url}"
                )));
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| PoolError::InvalidUrl(format!("missing host in {url}")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| PoolError::InvalidUrl(format!("missing port in {url}")))?;
        Ok(Self { host, port, tls })
    }

    /// `host[:port]`, omitting the scheme's default port.
    pub(crate) fn authority(&self) -> String {
        let default = if self.tls { 443 } else { 80 };
        if self.port == default {
            bracket(&self.host)
        } else {
            authority_of(&self.host, self.port)
        }
    }

    /// `host:port`, used as the protocol version cache key.
    pub(crate) fn address(&self) -> String {
        authority_of(&self.host, self.port)
    }

    fn scheme(&self) -> &'static str {
        if self.tls { "https" } else { "http" }
    }
}

fn bracket(host: &str) -> String {
    if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

fn authority_of(host: &str, port: u16) -> String {
    format!("{}:{}", bracket(host), port)
}

/// Per-attempt transport parameters.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConnectOptions {
    pub(crate) open_timeout: Option<Duration>,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) socket_options: Vec<SocketOption>,
}

enum Stream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Self::Plain(tcp) => tcp,
            Self::Tls(tls) => &tls.sock,
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(tcp) => tcp.read(buf),
            Self::Tls(tls) => tls.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(tcp) => tcp.write(buf),
            Self::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(tcp) => tcp.flush(),
            Self::Tls(tls) => tls.flush(),
        }
    }
}

/// A pooled connection, possibly not yet (or no longer) started.
pub(crate) struct Connection {
    key: u64,
    id: ConnectionId,
    destination: Destination,
    proxy_authorization: Option<String>,
    tls: Option<Arc<ClientConfig>>,
    stream: Option<BufReader<Stream>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("tls", &self.tls.is_some())
            .field("started", &self.is_started())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        destination: Destination,
        proxy: Option<Proxy>,
        tls: Option<Arc<ClientConfig>>,
    ) -> Self {
        let key = NEXT_KEY.fetch_add(1, Ordering::Relaxed);
        let id = ConnectionId {
            host: destination.host.clone(),
            port: destination.port,
            proxy: proxy.clone(),
        };
        debug!(connection = key, %id, tls = tls.is_some(), "Connection created");
        Self {
            key,
            id,
            proxy_authorization: proxy.as_ref().and_then(Proxy::authorization),
            destination,
            tls,
            stream: None,
        }
    }

    /// Process-unique key used for bookkeeping.
    pub(crate) fn key(&self) -> u64 {
        self.key
    }

    pub(crate) fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub(crate) fn is_started(&self) -> bool {
        self.stream.is_some()
    }

    /// Open the transport: TCP, proxy tunnel, TLS handshake, socket options.
    pub(crate) fn start(&mut self, options: &ConnectOptions) -> Result<()> {
        if self.is_started() {
            return Ok(());
        }

        let (dial_host, dial_port) = match &self.id.proxy {
            Some(proxy) => (proxy.host.as_str(), proxy.port),
            None => (self.destination.host.as_str(), self.destination.port),
        };
        let address = authority_of(dial_host, dial_port);
        let connect_error = |source: io::Error| PoolError::Connect {
            address: address.clone(),
            source,
        };

        let mut tcp =
            connect_tcp(dial_host, dial_port, options.open_timeout).map_err(connect_error)?;
        tcp.set_read_timeout(options.read_timeout)
            .map_err(connect_error)?;
        tcp.set_write_timeout(options.read_timeout)
            .map_err(connect_error)?;

        if self.destination.tls && self.id.proxy.is_some() {
            self.tunnel(&mut tcp).map_err(connect_error)?;
        }

        socket::apply_all(&options.socket_options, &tcp).map_err(connect_error)?;

        let stream = match &self.tls {
            Some(config) => {
                let name = tls::server_name(&self.destination.host)?;
                let session = ClientConnection::new(Arc::clone(config), name)
                    .map_err(|e| PoolError::Tls(e.to_string()))?;
                let mut tls = StreamOwned::new(session, tcp);
                while tls.conn.is_handshaking() {
                    tls.conn
                        .complete_io(&mut tls.sock)
                        .map_err(connect_error)?;
                }
                Stream::Tls(Box::new(tls))
            }
            None => Stream::Plain(tcp),
        };

        self.stream = Some(BufReader::new(stream));
        debug!(connection = self.key, id = %self.id, "Connection started");
        Ok(())
    }

    fn tunnel(&self, tcp: &mut TcpStream) -> io::Result<()> {
        let authority = self.destination.address();
        let mut head = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
        if let Some(auth) = &self.proxy_authorization {
            head.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
        }
        head.push_str("\r\n");
        tcp.write_all(head.as_bytes())?;
        tcp.flush()?;

        let mut reader = BufReader::new(&*tcp);
        let response = wire::read_head(&mut reader).map_err(Failure::into_io)?;
        if !response.status().is_success() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("proxy refused tunnel to {authority}: {}", response.status()),
            ));
        }
        if !reader.buffer().is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "proxy sent data before the tunnel was established",
            ));
        }
        trace!(connection = self.key, %authority, "Proxy tunnel established");
        Ok(())
    }

    /// Close the transport. Returns `false` if it was not open.
    pub(crate) fn finish(&mut self) -> bool {
        let Some(reader) = self.stream.take() else {
            return false;
        };
        let mut stream = reader.into_inner();
        if let Stream::Tls(tls) = &mut stream {
            tls.conn.send_close_notify();
            let _ = tls.conn.write_tls(&mut tls.sock);
        }
        let _ = stream.tcp().shutdown(Shutdown::Both);
        debug!(connection = self.key, id = %self.id, "Connection finished");
        true
    }

    /// Finish and start again under the same identity.
    pub(crate) fn reset(&mut self, options: &ConnectOptions) -> Result<()> {
        self.finish();
        debug!(connection = self.key, id = %self.id, "Connection reset");
        self.start(options)
    }

    /// Request target as sent on the wire.
    fn target_for(&self, request: &Request) -> String {
        if self.id.proxy.is_some() && !self.destination.tls && request.target().starts_with('/') {
            format!(
                "{}://{}{}",
                self.destination.scheme(),
                self.destination.authority(),
                request.target()
            )
        } else {
            request.target().to_string()
        }
    }

    /// Send a request without reading the response.
    pub(crate) fn write_request(&mut self, request: &Request) -> std::result::Result<(), Failure> {
        let target = self.target_for(request);
        let authority = self.destination.authority();
        let proxy_authorization = if self.destination.tls {
            None
        } else {
            self.proxy_authorization.as_deref()
        };
        let reader = self.stream.as_mut().ok_or_else(not_connected)?;
        wire::write_request(
            reader.get_mut(),
            request,
            &target,
            &authority,
            proxy_authorization,
        )?;
        Ok(())
    }

    /// Read one response to a request sent with `method`.
    pub(crate) fn read_response<'f>(
        &mut self,
        method: &Method,
        on_head: Option<&mut (dyn FnMut(&ResponseHead) + 'f)>,
    ) -> std::result::Result<Response, Failure> {
        let reader = self.stream.as_mut().ok_or_else(not_connected)?;
        let head = wire::read_head(reader)?;
        if let Some(callback) = on_head {
            callback(&head);
        }
        let (body, close_delimited) = wire::read_body(reader, method, &head)?;
        Ok(Response::new(head, body, close_delimited))
    }

    /// Send a request and read its response.
    pub(crate) fn exchange<'f>(
        &mut self,
        request: &Request,
        on_head: Option<&mut (dyn FnMut(&ResponseHead) + 'f)>,
    ) -> std::result::Result<Response, Failure> {
        self.write_request(request)?;
        self.read_response(request.method(), on_head)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.finish();
    }
}

fn not_connected() -> Failure {
    Failure::Reset(io::Error::new(
        io::ErrorKind::NotConnected,
        "connection is not started",
    ))
}

fn connect_tcp(host: &str, port: u16, timeout: Option<Duration>) -> io::Result<TcpStream> {
    let mut last_error = None;
    for addr in (host, port).to_socket_addrs()? {
        let attempt = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {host}"),
        )
    }))
}
