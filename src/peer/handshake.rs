//! The 68-byte handshake that opens every peer connection.
//!
//! Nothing else may cross the socket before it. Each side sends one fixed
//! record naming the protocol it speaks, the infohash of the torrent it is
//! here for, and its own peer id; a record that does not lead with
//! `19:"BitTorrent protocol"` ends the connection. Whether the infohashes
//! have to agree is left to the caller, since the `handshake` CLI command
//! wants to report whatever the remote claimed.
use super::{PeerError, PeerResult, IO_TIMEOUT};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::instrument;

/// Wire size of a handshake record.
pub const HANDSHAKE_LEN: usize = 68;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// One handshake record, ours or the remote's.
///
/// Fields mirror the wire layout: the record is exactly 68 bytes with no
/// length prefix or framing of its own, so [`Handshake::serialize`] and
/// [`Handshake::read`] are fixed-offset copies in and out of a `[u8; 68]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_len: u8,
    pub protocol: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Creates our side of the handshake for the given torrent and client
    /// identity. Reserved bytes are all zero, advertising no extensions.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            protocol_len: 19,
            protocol: *PROTOCOL,
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Copies the record into its wire form: the length byte, 19 protocol
    /// bytes, 8 reserved, 20 of infohash, 20 of peer id, at fixed offsets.
    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = self.protocol_len;
        buf[1..20].copy_from_slice(&self.protocol);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Reads a handshake from `stream`.
    ///
    /// Exactly 68 bytes are consumed; short reads are retried internally and
    /// EOF before the record completes is an I/O error. Only the protocol
    /// length and protocol string are validated here; the reserved bytes,
    /// info hash, and peer ID are returned exactly as the remote sent them,
    /// and checking the info hash is the caller's decision
    /// ([`Handshake::validate`]).
    #[instrument(level = "trace", skip(stream))]
    pub async fn read(stream: &mut TcpStream) -> PeerResult<Self> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut buf).await?;

        let protocol_len = buf[0];
        if protocol_len != 19 {
            return Err(PeerError::InvalidProtocolLength(protocol_len));
        }

        let mut protocol = [0u8; 19];
        protocol.copy_from_slice(&buf[1..20]);
        if &protocol != PROTOCOL {
            return Err(PeerError::InvalidProtocol);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self {
            protocol_len,
            protocol,
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Checks that the remote is serving the torrent we asked about.
    pub fn validate(&self, expected_info_hash: [u8; 20]) -> PeerResult<()> {
        if self.info_hash != expected_info_hash {
            return Err(PeerError::InfoHashMismatch);
        }
        Ok(())
    }

    /** Performs the handshake over an established connection.

    Sends our 68-byte record in full, then reads the remote's. Both
    directions run under the protocol I/O deadline. The remote record is
    returned as received; see [`Handshake::read`] for what is and is not
    validated. */
    #[instrument(level = "trace", skip(stream, info_hash, peer_id))]
    pub async fn perform(
        stream: &mut TcpStream,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
    ) -> PeerResult<Handshake> {
        let ours = Handshake::new(info_hash, peer_id);
        timeout(IO_TIMEOUT, stream.write_all(&ours.serialize())).await??;
        timeout(IO_TIMEOUT, Handshake::read(stream)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const INFO_HASH: [u8; 20] = [0xab; 20];
    const PEER_ID: [u8; 20] = *b"00112233445566778899";

    #[test]
    fn serializes_the_fixed_layout() {
        let bytes = Handshake::new(INFO_HASH, PEER_ID).serialize();
        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &INFO_HASH);
        assert_eq!(&bytes[48..68], &PEER_ID);
    }

    #[tokio::test]
    async fn round_trips_against_an_echoing_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; HANDSHAKE_LEN];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let mut stream = super::super::connect(addr).await.unwrap();
        let remote = Handshake::perform(&mut stream, INFO_HASH, PEER_ID)
            .await
            .unwrap();

        assert_eq!(remote.protocol_len, 19);
        assert_eq!(&remote.protocol, b"BitTorrent protocol");
        assert_eq!(remote.info_hash, INFO_HASH);
        assert_eq!(remote.peer_id, PEER_ID);
        assert!(remote.validate(INFO_HASH).is_ok());
        assert!(matches!(
            remote.validate([0u8; 20]),
            Err(PeerError::InfoHashMismatch)
        ));
    }

    #[tokio::test]
    async fn rejects_a_wrong_protocol_string() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; HANDSHAKE_LEN];
            stream.read_exact(&mut buf).await.unwrap();
            let mut reply = buf;
            reply[1..20].copy_from_slice(b"BitTorrent PROTOCOL");
            stream.write_all(&reply).await.unwrap();
        });

        let mut stream = super::super::connect(addr).await.unwrap();
        let err = Handshake::perform(&mut stream, INFO_HASH, PEER_ID)
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::InvalidProtocol));
    }

    #[tokio::test]
    async fn rejects_a_wrong_protocol_length() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; HANDSHAKE_LEN];
            stream.read_exact(&mut buf).await.unwrap();
            let mut reply = buf;
            reply[0] = 20;
            stream.write_all(&reply).await.unwrap();
        });

        let mut stream = super::super::connect(addr).await.unwrap();
        let err = Handshake::perform(&mut stream, INFO_HASH, PEER_ID)
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::InvalidProtocolLength(20)));
    }
}
