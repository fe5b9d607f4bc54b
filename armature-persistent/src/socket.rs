//! Socket options applied once when a connection starts.

use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::TcpStream;
use std::time::Duration;

/// A TCP socket option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    /// TCP_NODELAY - disable Nagle's algorithm.
    NoDelay(bool),
    /// SO_KEEPALIVE.
    KeepAlive(bool),
    /// Idle time before the first keep-alive probe (enables SO_KEEPALIVE).
    KeepAliveIdle(Duration),
    /// SO_SNDBUF.
    SendBuffer(usize),
    /// SO_RCVBUF.
    RecvBuffer(usize),
    /// SO_LINGER.
    Linger(Option<Duration>),
    /// IP_TTL.
    Ttl(u32),
}

impl SocketOption {
    /// Options every new pool starts with.
    pub fn defaults() -> Vec<Self> {
        vec![Self::NoDelay(true)]
    }

    /// Apply this option to a connected stream.
    pub fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        let socket = SockRef::from(stream);
        match *self {
            Self::NoDelay(on) => socket.set_nodelay(on),
            Self::KeepAlive(on) => socket.set_keepalive(on),
            Self::KeepAliveIdle(time) => {
                socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(time))
            }
            Self::SendBuffer(size) => socket.set_send_buffer_size(size),
            Self::RecvBuffer(size) => socket.set_recv_buffer_size(size),
            Self::Linger(linger) => socket.set_linger(linger),
            Self::Ttl(ttl) => socket.set_ttl(ttl),
        }
    }
}

/// Apply every option in order, stopping at the first failure.
pub fn apply_all(options: &[SocketOption], stream: &TcpStream) -> io::Result<()> {
    options.iter().try_for_each(|option| option.apply(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_defaults_enable_nodelay() {
        assert_eq!(SocketOption::defaults(), vec![SocketOption::NoDelay(true)]);
    }

    #[test]
    fn test_apply_nodelay() {
        let (client, _server) = connected_pair();
        apply_all(&SocketOption::defaults(), &client).unwrap();
        assert!(client.nodelay().unwrap());

        SocketOption::NoDelay(false).apply(&client).unwrap();
        assert!(!client.nodelay().unwrap());
    }

    #[test]
    fn test_apply_keepalive_and_ttl() {
        let (client, _server) = connected_pair();
        apply_all(
            &[
                SocketOption::KeepAlive(true),
                SocketOption::KeepAliveIdle(Duration::from_secs(30)),
                SocketOption::Ttl(64),
            ],
            &client,
        )
        .unwrap();

        assert!(SockRef::from(&client).keepalive().unwrap());
        assert_eq!(client.ttl().unwrap(), 64);
    }
}
