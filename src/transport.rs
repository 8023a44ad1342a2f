use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;

pub const DNS_PORT: u16 = 53;
/// Largest DNS-over-UDP datagram we accept.
pub const MAX_PACKET_SIZE: usize = 512;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out waiting for a response")]
    TimedOut,
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// One query/response exchange with a server. The engine drives retries;
/// implementations only bound a single wait.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn exchange(&self, server: SocketAddr, query: &[u8]) -> Result<Bytes, TransportError>;
}

/// Single reusable unconnected UDP socket with a fixed receive timeout.
pub struct UdpTransport {
    socket: UdpSocket,
    timeout: Duration,
}

impl UdpTransport {
    /// Binds an ephemeral socket. Must run inside the tokio runtime.
    pub fn open(timeout: Duration) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.bind(&"0.0.0.0:0".parse::<SocketAddr>().unwrap().into())?;
        let socket = UdpSocket::from_std(socket.into())?;
        Ok(Self { socket, timeout })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn exchange(&self, server: SocketAddr, query: &[u8]) -> Result<Bytes, TransportError> {
        self.socket.send_to(query, server).await?;

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let received = timeout(self.timeout, async {
            loop {
                let (len, src) = self.socket.recv_from(&mut buf).await?;
                if src != server {
                    // stray datagram from some other conversation
                    continue;
                }
                if len >= 2 && query.len() >= 2 && buf[..2] != query[..2] {
                    // stale response to an abandoned transaction
                    continue;
                }
                return Ok::<_, io::Error>(Bytes::copy_from_slice(&buf[..len]));
            }
        })
        .await;

        match received {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(err)) => Err(TransportError::Io(err)),
            Err(_) => Err(TransportError::TimedOut),
        }
    }
}
