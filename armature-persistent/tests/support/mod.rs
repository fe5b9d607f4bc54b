//! Loopback HTTP/1.1 server for integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// A request as seen by the server.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Order of arrival across all connections, from 0.
    pub index: usize,
    /// Connection the request arrived on, from 0.
    pub connection: usize,
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

/// What the server does with a request.
pub enum Reply {
    /// Write these bytes and keep the connection open.
    Respond(Vec<u8>),
    /// Write these bytes and close the connection.
    RespondAndClose(Vec<u8>),
    /// Close the connection without answering.
    Close,
}

type Handler = dyn Fn(&RecordedRequest) -> Reply + Send + Sync;

pub struct TestServer {
    port: u16,
    tls: bool,
    connections: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl TestServer {
    pub fn start<H>(handler: H) -> Self
    where
        H: Fn(&RecordedRequest) -> Reply + Send + Sync + 'static,
    {
        Self::listen(None, handler)
    }

    /// Server speaking HTTPS with `config`.
    pub fn start_tls<H>(config: Arc<ServerConfig>, handler: H) -> Self
    where
        H: Fn(&RecordedRequest) -> Reply + Send + Sync + 'static,
    {
        Self::listen(Some(config), handler)
    }

    fn listen<H>(tls: Option<Arc<ServerConfig>>, handler: H) -> Self
    where
        H: Fn(&RecordedRequest) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let accepted = Arc::clone(&connections);
        let recorded = Arc::clone(&requests);
        let secure = tls.is_some();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let connection = accepted.fetch_add(1, Ordering::SeqCst);
                let recorded = Arc::clone(&recorded);
                let handler = Arc::clone(&handler);
                let tls = tls.clone();
                thread::spawn(move || match tls {
                    Some(config) => serve_tls(stream, config, connection, &recorded, &*handler),
                    None => serve(stream, connection, &recorded, &*handler),
                });
            }
        });

        Self {
            port,
            tls: secure,
            connections,
            requests,
        }
    }

    /// Server that answers every request with `200 OK` and the request target.
    pub fn echo() -> Self {
        Self::start(|request| Reply::Respond(ok(&request.target)))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self, path: &str) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://127.0.0.1:{}{}", scheme, self.port, path)
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

fn serve(
    stream: TcpStream,
    connection: usize,
    recorded: &Mutex<Vec<RecordedRequest>>,
    handler: &Handler,
) {
    let Ok(read_half) = stream.try_clone() else {
        return;
    };
    let mut reader = BufReader::new(read_half);
    let mut writer = stream;

    while let Some(request) = read_request(&mut reader, connection) {
        let request = record(recorded, request);
        match handler(&request) {
            Reply::Respond(bytes) => {
                if writer.write_all(&bytes).is_err() {
                    return;
                }
            }
            Reply::RespondAndClose(bytes) => {
                let _ = writer.write_all(&bytes);
                let _ = writer.shutdown(Shutdown::Both);
                return;
            }
            Reply::Close => {
                let _ = writer.shutdown(Shutdown::Both);
                return;
            }
        }
    }
}

fn serve_tls(
    stream: TcpStream,
    config: Arc<ServerConfig>,
    connection: usize,
    recorded: &Mutex<Vec<RecordedRequest>>,
    handler: &Handler,
) {
    let Ok(session) = ServerConnection::new(config) else {
        return;
    };
    let mut reader = BufReader::new(StreamOwned::new(session, stream));

    while let Some(request) = read_request(&mut reader, connection) {
        let request = record(recorded, request);
        let tls = reader.get_mut();
        match handler(&request) {
            Reply::Respond(bytes) => {
                if tls.write_all(&bytes).and_then(|()| tls.flush()).is_err() {
                    return;
                }
            }
            Reply::RespondAndClose(bytes) => {
                let _ = tls.write_all(&bytes);
                tls.conn.send_close_notify();
                let _ = tls.flush();
                return;
            }
            Reply::Close => {
                tls.conn.send_close_notify();
                let _ = tls.flush();
                return;
            }
        }
    }
}

fn record(recorded: &Mutex<Vec<RecordedRequest>>, mut request: RecordedRequest) -> RecordedRequest {
    let mut requests = recorded.lock();
    request.index = requests.len();
    requests.push(request.clone());
    request
}

fn read_request<R: BufRead>(reader: &mut R, connection: usize) -> Option<RecordedRequest> {
    let mut line = String::new();
    if reader.read_line(&mut line).ok()? == 0 {
        return None;
    }
    let mut parts = line.trim_end().splitn(3, ' ');
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();

    let mut headers = Vec::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).ok()? == 0 {
            return None;
        }
        let header = line.trim_end();
        if header.is_empty() {
            break;
        }
        let (name, value) = header.split_once(':')?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let length = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0; length];
    reader.read_exact(&mut body).ok()?;

    Some(RecordedRequest {
        index: 0,
        connection,
        method,
        target,
        headers,
        body,
    })
}

/// `200 OK` with a length-delimited body.
pub fn ok(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

/// `200 OK` with a chunked body split into `parts`.
pub fn chunked(parts: &[&str]) -> Vec<u8> {
    let mut response = String::from("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
    for part in parts {
        response.push_str(&format!("{:x}\r\n{}\r\n", part.len(), part));
    }
    response.push_str("0\r\n\r\n");
    response.into_bytes()
}

/// A self-signed certificate and its key.
pub struct Identity {
    pub certificate: CertificateDer<'static>,
    pub key: PrivateKeyDer<'static>,
}

impl Identity {
    /// Generate a certificate valid for `name`, a host name or IP address.
    pub fn self_signed(name: &str) -> Self {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec![name.to_string()]).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        Self {
            certificate: cert.der().clone(),
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        }
    }

    /// Server configuration presenting this identity.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![self.certificate.clone()], self.key.clone_key())
            .unwrap();
        Arc::new(config)
    }
}

/// Raw response text.
pub fn raw(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}
