//! Peer protocol: handshake, message exchange, and piece download.
//!
//! Connections are plain TCP. Every network operation runs under a deadline
//! so a stalled peer cannot wedge the client; on timeout the connection is
//! dropped and its buffers with it.
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

pub mod download;
pub mod handshake;
pub mod message;

pub use handshake::Handshake;
pub use message::Message;

/// Deadline for establishing a TCP connection to a peer.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline for a single protocol read or write.
pub const IO_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer operation timed out")]
    Timeout,

    #[error("invalid peer address {0:?}")]
    InvalidPeerAddress(String),

    #[error("handshake failed: protocol length {0}, expected 19")]
    InvalidProtocolLength(u8),

    #[error("handshake failed: invalid protocol identifier")]
    InvalidProtocol,

    #[error("handshake failed: info hash mismatch")]
    InfoHashMismatch,

    #[error(
        "piece hash mismatch: expected {}, got {}",
        hex::encode(.expected),
        hex::encode(.actual)
    )]
    PieceHashMismatch {
        expected: [u8; 20],
        actual: [u8; 20],
    },

    #[error("message frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("unknown message id {0}")]
    UnknownMessageId(u8),

    #[error("message payload too short for its id")]
    TruncatedMessage,

    #[error("expected {expected} message, received {received}")]
    UnexpectedMessage {
        expected: &'static str,
        received: &'static str,
    },
}

impl From<tokio::time::error::Elapsed> for PeerError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        PeerError::Timeout
    }
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;

/// Parses a peer address of the form `ip:port`.
///
/// IPv4 only. An empty host, a port of zero, or anything that is not a
/// single `host:port` pair is rejected.
pub fn parse_peer_addr(addr: &str) -> PeerResult<SocketAddr> {
    let invalid = || PeerError::InvalidPeerAddress(addr.to_string());

    let (host, port) = addr.split_once(':').ok_or_else(invalid)?;
    if host.is_empty() {
        return Err(invalid());
    }
    let ip: Ipv4Addr = host.parse().map_err(|_| invalid())?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if port == 0 {
        return Err(invalid());
    }
    Ok(SocketAddr::from((ip, port)))
}

/// Opens a TCP connection to `addr` under [`CONNECT_TIMEOUT`].
pub async fn connect(addr: SocketAddr) -> PeerResult<TcpStream> {
    debug!(%addr, "connecting to peer");
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await??;
    Ok(stream)
}

/// An established peer connection: the stream plus the identity the remote
/// presented in its handshake.
#[derive(Debug)]
pub struct PeerConnection {
    stream: TcpStream,
    pub remote_id: [u8; 20],
}

impl PeerConnection {
    /// Connects, handshakes, and verifies the remote is serving the same
    /// torrent.
    pub async fn establish(
        addr: SocketAddr,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
    ) -> PeerResult<Self> {
        let mut stream = connect(addr).await?;
        let remote = Handshake::perform(&mut stream, info_hash, peer_id).await?;
        remote.validate(info_hash)?;
        debug!(remote_id = %hex::encode(remote.peer_id), "peer connection established");
        Ok(Self {
            stream,
            remote_id: remote.peer_id,
        })
    }

    pub async fn send(&mut self, message: Message) -> PeerResult<()> {
        timeout(IO_TIMEOUT, message.write(&mut self.stream)).await?
    }

    pub async fn receive(&mut self) -> PeerResult<Message> {
        timeout(IO_TIMEOUT, Message::read(&mut self.stream)).await?
    }
}
