//! Piece download flow.
//!
//! The standard sequence against a fresh peer: receive its bitfield, check
//! it advertises the piece we want, declare ourselves interested, wait to be
//! unchoked, then request the piece block by block and verify the assembled
//! bytes against the piece hash. Keep-alives may arrive at any point and are
//! skipped wherever a specific message is awaited.
use anyhow::{anyhow, Result};
use sha1::{Digest, Sha1};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info};

use super::{Message, PeerConnection, PeerError, PeerResult};
use crate::torrent::{Piece, Torrent};
use crate::tracker::{Client, TrackerConfig};

/// Coordinates tracker discovery and per-piece retrieval for one torrent.
pub struct Downloader {
    torrent: Torrent,
    peers: Vec<SocketAddr>,
    peer_id: [u8; 20],
}

/// Reassembly state for one piece: the buffer plus which blocks have
/// arrived. Blocks may be accepted in any order; each is counted once.
struct PieceAssembly {
    data: Vec<u8>,
    received: Vec<bool>,
    blocks_received: usize,
}

impl PieceAssembly {
    fn new(piece: &Piece) -> Self {
        Self {
            data: vec![0u8; piece.size as usize],
            received: vec![false; piece.blocks.len()],
            blocks_received: 0,
        }
    }

    /// Places a returned block at its offset. The offset and length must
    /// match one of the piece's blocks exactly.
    fn accept(&mut self, piece: &Piece, begin: u32, block: &[u8]) -> Result<()> {
        let slot = piece
            .blocks
            .iter()
            .position(|b| b.offset == begin && b.size as usize == block.len())
            .ok_or_else(|| {
                anyhow!(
                    "peer sent unexpected block: begin {begin}, length {}",
                    block.len()
                )
            })?;

        let start = begin as usize;
        self.data[start..start + block.len()].copy_from_slice(block);
        if !self.received[slot] {
            self.received[slot] = true;
            self.blocks_received += 1;
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.blocks_received == self.received.len()
    }
}

impl Downloader {
    /// Announces to the torrent's tracker and keeps the returned peer list.
    pub async fn new(torrent: Torrent) -> Result<Self> {
        let config = TrackerConfig::default();
        let peer_id = config.peer_id;
        let response = Client::new(config).announce(&torrent).await?;

        let peers: Vec<SocketAddr> = response
            .peers
            .iter()
            .map(|peer| SocketAddr::new(peer.ip, peer.port))
            .collect();
        if peers.is_empty() {
            return Err(anyhow!("tracker returned no peers"));
        }
        info!(peers = peers.len(), "tracker announce returned peers");

        Ok(Self {
            torrent,
            peers,
            peer_id,
        })
    }

    /// Downloads and verifies a single piece, rotating through the peer
    /// list with bounded retries.
    pub async fn download_piece(&self, index: u32) -> Result<Vec<u8>> {
        let piece = self
            .torrent
            .piece(index)
            .ok_or_else(|| anyhow!("piece {index} out of range"))?;

        let attempts = self.peers.iter().cycle().take(3 * self.peers.len());
        let mut last_error = None;
        for (attempt, addr) in attempts.enumerate() {
            if attempt > 0 {
                info!(piece = index, peer = %addr, "retrying piece with another peer");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            match self.download_piece_from_peer(*addr, piece).await {
                Ok(data) => return Ok(data),
                Err(err) => {
                    debug!(piece = index, peer = %addr, error = %err, "piece download failed");
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("no peers available")))
            .map_err(|err| err.context(format!("failed to download piece {index}")))
    }

    /// Downloads every piece in order and returns the assembled file bytes.
    pub async fn download(&self) -> Result<Vec<u8>> {
        let mut file_data = Vec::with_capacity(self.torrent.info.length as usize);
        for piece in &self.torrent.info.pieces {
            info!(
                piece = piece.index,
                total = self.torrent.num_pieces(),
                "downloading piece"
            );
            file_data.extend_from_slice(&self.download_piece(piece.index).await?);
        }
        Ok(file_data)
    }

    async fn download_piece_from_peer(&self, addr: SocketAddr, piece: &Piece) -> Result<Vec<u8>> {
        let mut conn =
            PeerConnection::establish(addr, self.torrent.info_hash, self.peer_id).await?;

        wait_for_bitfield(&mut conn, piece.index).await?;
        wait_for_unchoke(&mut conn).await?;
        let data = fetch_blocks(&mut conn, piece).await?;
        verify_piece(piece, &data)?;
        Ok(data)
    }
}

/// Waits for the peer's bitfield and checks it advertises `piece_index`.
async fn wait_for_bitfield(conn: &mut PeerConnection, piece_index: u32) -> Result<()> {
    loop {
        match conn.receive().await? {
            Message::Bitfield(bits) => {
                let byte = piece_index as usize / 8;
                let mask = 0x80u8 >> (piece_index % 8);
                if bits.get(byte).is_none_or(|b| b & mask == 0) {
                    return Err(anyhow!("peer does not have piece {piece_index}"));
                }
                return Ok(());
            }
            Message::KeepAlive => continue,
            other => {
                return Err(PeerError::UnexpectedMessage {
                    expected: "bitfield",
                    received: other.name(),
                }
                .into())
            }
        }
    }
}

/// Declares interest and waits until the peer unchokes us.
async fn wait_for_unchoke(conn: &mut PeerConnection) -> Result<()> {
    conn.send(Message::Interested).await?;
    loop {
        match conn.receive().await? {
            Message::Unchoke => return Ok(()),
            // Choke just restates the initial state; have/keep-alive are
            // background noise while we wait.
            Message::KeepAlive | Message::Choke | Message::Have(_) => continue,
            other => {
                return Err(PeerError::UnexpectedMessage {
                    expected: "unchoke",
                    received: other.name(),
                }
                .into())
            }
        }
    }
}

/// Requests each block of the piece in ascending offset order and assembles
/// the returned data.
async fn fetch_blocks(conn: &mut PeerConnection, piece: &Piece) -> Result<Vec<u8>> {
    let mut assembly = PieceAssembly::new(piece);

    for block in &piece.blocks {
        conn.send(Message::Request {
            index: piece.index,
            begin: block.offset,
            length: block.size,
        })
        .await?;

        loop {
            match conn.receive().await? {
                Message::Piece {
                    index,
                    begin,
                    block: data,
                } => {
                    if index != piece.index {
                        return Err(anyhow!(
                            "peer sent piece {index}, expected {}",
                            piece.index
                        ));
                    }
                    assembly.accept(piece, begin, &data)?;
                    break;
                }
                Message::KeepAlive => continue,
                other => {
                    return Err(PeerError::UnexpectedMessage {
                        expected: "piece",
                        received: other.name(),
                    }
                    .into())
                }
            }
        }
    }

    if !assembly.is_complete() {
        return Err(anyhow!("piece {} is missing blocks", piece.index));
    }
    debug!(
        piece = piece.index,
        blocks = assembly.blocks_received,
        "piece assembled"
    );
    Ok(assembly.data)
}

/// Verifies the assembled piece against its SHA-1 from the metainfo.
fn verify_piece(piece: &Piece, data: &[u8]) -> PeerResult<()> {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest: [u8; 20] = hasher.finalize().into();

    if digest != piece.hash {
        return Err(PeerError::PieceHashMismatch {
            expected: piece.hash,
            actual: digest,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::Torrent;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const PEER_ID: [u8; 20] = *b"00112233445566778899";

    /// Builds a torrent whose single 40000-byte piece hashes the given data,
    /// so downloads verify end to end.
    fn torrent_for(data: &[u8]) -> Torrent {
        let digest: [u8; 20] = Sha1::digest(data).into();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"d8:announce10:http://t/a4:infod");
        bytes.extend_from_slice(format!("6:lengthi{}e", data.len()).as_bytes());
        bytes.extend_from_slice(b"4:name5:t.bin");
        bytes.extend_from_slice(format!("12:piece lengthi{}e", data.len()).as_bytes());
        bytes.extend_from_slice(b"6:pieces20:");
        bytes.extend_from_slice(&digest);
        bytes.extend_from_slice(b"ee");
        Torrent::from_bytes(&bytes).unwrap()
    }

    /// A peer that serves `data` as piece 0, block by block.
    async fn mock_seeder(listener: TcpListener, data: Vec<u8>) {
        let (stream, _) = listener.accept().await.unwrap();
        serve_stream(stream, data).await;
    }

    /// Runs the seeding side of one connection.
    async fn serve_stream(mut stream: TcpStream, data: Vec<u8>) {
        let mut handshake = [0u8; 68];
        stream.read_exact(&mut handshake).await.unwrap();
        stream.write_all(&handshake).await.unwrap();

        stream
            .write_all(&Message::Bitfield(vec![0x80]).to_bytes())
            .await
            .unwrap();

        // Interested from the client, then unchoke.
        let interested = read_message(&mut stream).await;
        assert_eq!(interested, Message::Interested);
        stream
            .write_all(&Message::Unchoke.to_bytes())
            .await
            .unwrap();

        loop {
            let request = read_message(&mut stream).await;
            let Message::Request { index, begin, length } = request else {
                break;
            };
            let begin_usize = begin as usize;
            let block = data[begin_usize..begin_usize + length as usize].to_vec();
            stream
                .write_all(&Message::Piece { index, begin, block }.to_bytes())
                .await
                .unwrap();
        }
    }

    async fn read_message(stream: &mut TcpStream) -> Message {
        let mut length_buf = [0u8; 4];
        if stream.read_exact(&mut length_buf).await.is_err() {
            return Message::KeepAlive;
        }
        let length = u32::from_be_bytes(length_buf) as usize;
        if length == 0 {
            return Message::KeepAlive;
        }
        let mut body = vec![0u8; length];
        stream.read_exact(&mut body).await.unwrap();
        Message::from_bytes(&body).unwrap()
    }

    fn downloader_with_peer(torrent: Torrent, addr: SocketAddr) -> Downloader {
        Downloader {
            torrent,
            peers: vec![addr],
            peer_id: PEER_ID,
        }
    }

    #[tokio::test]
    async fn downloads_and_verifies_a_piece() {
        // Three blocks: two full, one short tail.
        let data: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let torrent = torrent_for(&data);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seeder = tokio::spawn(mock_seeder(listener, data.clone()));

        let downloader = downloader_with_peer(torrent, addr);
        let piece = downloader.download_piece(0).await.unwrap();
        assert_eq!(piece, data);
        seeder.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_a_piece_that_fails_verification() {
        let data: Vec<u8> = vec![7u8; 1000];
        let torrent = torrent_for(&data);

        // Serve different bytes than the metainfo hashed.
        let mut wrong = data.clone();
        wrong[0] ^= 0xff;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Every retry reconnects and gets the same corrupted bytes, so
            // the hash mismatch is the error the downloader gives up with.
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                serve_stream(stream, wrong.clone()).await;
            }
        });

        let downloader = downloader_with_peer(torrent, addr);
        let err = downloader.download_piece(0).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PeerError>(),
            Some(PeerError::PieceHashMismatch { .. })
        ));
    }

    #[test]
    fn verify_piece_reports_both_digests() {
        let data = b"hello".to_vec();
        let torrent = torrent_for(&data);
        let piece = &torrent.info.pieces[0];
        assert!(verify_piece(piece, &data).is_ok());

        let err = verify_piece(piece, b"jello").unwrap_err();
        let wrong_digest: [u8; 20] = Sha1::digest(b"jello").into();
        match err {
            PeerError::PieceHashMismatch { expected, actual } => {
                assert_eq!(expected, piece.hash);
                assert_eq!(actual, wrong_digest);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn refuses_peers_without_the_piece() {
        let data = vec![1u8; 100];
        let torrent = torrent_for(&data);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut handshake = [0u8; 68];
            stream.read_exact(&mut handshake).await.unwrap();
            stream.write_all(&handshake).await.unwrap();
            // Empty bitfield: we have nothing.
            stream
                .write_all(&Message::Bitfield(vec![0x00]).to_bytes())
                .await
                .unwrap();
        });

        let downloader = downloader_with_peer(torrent, addr);
        let err = downloader.download_piece(0).await.unwrap_err();
        assert!(err.to_string().contains("failed to download piece 0"));
    }
}
