//! Peer wire messages.
//!
//! After the handshake, peers exchange length-prefixed frames:
//! `<4-byte big-endian length> <1-byte id> <payload>`, where a length of
//! zero is a keep-alive with no id at all. The ids are fixed by the
//! protocol: choke 0, unchoke 1, interested 2, not-interested 3, have 4,
//! bitfield 5, request 6, piece 7, cancel 8.
use super::{PeerError, PeerResult};
use byteorder::{BigEndian, ReadBytesExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Upper bound on a frame body. A block is 16 KiB, so anything larger than
/// this is not a message we would ever ask for.
pub const MAX_FRAME_SIZE: usize = 1 << 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    /// The message's wire id; `None` for keep-alive.
    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have(_) => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request { .. } => Some(6),
            Message::Piece { .. } => Some(7),
            Message::Cancel { .. } => Some(8),
        }
    }

    /// Short name for diagnostics and mismatch errors.
    pub fn name(&self) -> &'static str {
        match self {
            Message::KeepAlive => "keep-alive",
            Message::Choke => "choke",
            Message::Unchoke => "unchoke",
            Message::Interested => "interested",
            Message::NotInterested => "not-interested",
            Message::Have(_) => "have",
            Message::Bitfield(_) => "bitfield",
            Message::Request { .. } => "request",
            Message::Piece { .. } => "piece",
            Message::Cancel { .. } => "cancel",
        }
    }

    /// Serializes the full frame, length prefix included. A keep-alive is
    /// the bare zero length.
    pub fn to_bytes(&self) -> Vec<u8> {
        let Some(id) = self.id() else {
            return Vec::new() /* keep-alive has no frame body */;
        };

        let mut payload = Vec::new();
        match self {
            Message::Have(index) => payload.extend_from_slice(&index.to_be_bytes()),
            Message::Bitfield(bits) => payload.extend_from_slice(bits),
            Message::Request { index, begin, length }
            | Message::Cancel { index, begin, length } => {
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece { index, begin, block } => {
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
            }
            _ => {}
        }

        let mut frame = Vec::with_capacity(4 + 1 + payload.len());
        frame.extend_from_slice(&(1 + payload.len() as u32).to_be_bytes());
        frame.push(id);
        frame.extend_from_slice(&payload);
        frame
    }

    /// Parses a frame body (id byte plus payload, the length prefix already
    /// stripped). The empty body is not valid here; a zero-length frame is
    /// the keep-alive and never reaches this function.
    pub fn from_bytes(body: &[u8]) -> PeerResult<Self> {
        let (&id, payload) = body.split_first().ok_or(PeerError::TruncatedMessage)?;
        let mut reader = payload;
        let message = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => Message::Have(ReadBytesExt::read_u32::<BigEndian>(&mut reader)?),
            5 => Message::Bitfield(payload.to_vec()),
            6 => Message::Request {
                index: ReadBytesExt::read_u32::<BigEndian>(&mut reader)?,
                begin: ReadBytesExt::read_u32::<BigEndian>(&mut reader)?,
                length: ReadBytesExt::read_u32::<BigEndian>(&mut reader)?,
            },
            7 => {
                let index = ReadBytesExt::read_u32::<BigEndian>(&mut reader)?;
                let begin = ReadBytesExt::read_u32::<BigEndian>(&mut reader)?;
                Message::Piece {
                    index,
                    begin,
                    block: reader.to_vec(),
                }
            }
            8 => Message::Cancel {
                index: ReadBytesExt::read_u32::<BigEndian>(&mut reader)?,
                begin: ReadBytesExt::read_u32::<BigEndian>(&mut reader)?,
                length: ReadBytesExt::read_u32::<BigEndian>(&mut reader)?,
            },
            other => return Err(PeerError::UnknownMessageId(other)),
        };
        Ok(message)
    }

    /// Reads one frame from the stream. Loops on short reads; a zero length
    /// prefix is the keep-alive.
    pub async fn read(stream: &mut TcpStream) -> PeerResult<Self> {
        let mut length_buf = [0u8; 4];
        stream.read_exact(&mut length_buf).await?;
        let length = u32::from_be_bytes(length_buf) as usize;

        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if length > MAX_FRAME_SIZE {
            return Err(PeerError::FrameTooLarge(length));
        }

        let mut body = vec![0u8; length];
        stream.read_exact(&mut body).await?;
        Message::from_bytes(&body)
    }

    /// Writes the frame in full.
    pub async fn write(&self, stream: &mut TcpStream) -> PeerResult<()> {
        let frame = match self {
            // A keep-alive's to_bytes is empty; its wire form is four zeros.
            Message::KeepAlive => vec![0u8; 4],
            _ => self.to_bytes(),
        };
        stream.write_all(&frame).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_every_message_kind() {
        let messages = vec![
            (Message::Choke, vec![0, 0, 0, 1, 0]),
            (Message::Unchoke, vec![0, 0, 0, 1, 1]),
            (Message::Interested, vec![0, 0, 0, 1, 2]),
            (Message::NotInterested, vec![0, 0, 0, 1, 3]),
            (Message::Have(42), vec![0, 0, 0, 5, 4, 0, 0, 0, 42]),
            (
                Message::Bitfield(vec![1, 2, 3]),
                vec![0, 0, 0, 4, 5, 1, 2, 3],
            ),
            (
                Message::Request {
                    index: 1,
                    begin: 2,
                    length: 16384,
                },
                vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 64, 0],
            ),
            (
                Message::Piece {
                    index: 1,
                    begin: 16384,
                    block: vec![0xaa, 0xbb],
                },
                vec![0, 0, 0, 11, 7, 0, 0, 0, 1, 0, 0, 64, 0, 0xaa, 0xbb],
            ),
            (
                Message::Cancel {
                    index: 1,
                    begin: 2,
                    length: 3,
                },
                vec![0, 0, 0, 13, 8, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3],
            ),
        ];

        for (message, expected) in messages {
            assert_eq!(message.to_bytes(), expected, "{}", message.name());
            assert_eq!(
                Message::from_bytes(&expected[4..]).unwrap(),
                message,
                "{}",
                message.name()
            );
        }
    }

    #[test]
    fn keep_alive_has_no_body() {
        assert!(Message::KeepAlive.to_bytes().is_empty());
        assert_eq!(Message::KeepAlive.id(), None);
    }

    #[test]
    fn rejects_unknown_ids_and_short_payloads() {
        assert!(matches!(
            Message::from_bytes(&[9]),
            Err(PeerError::UnknownMessageId(9))
        ));
        assert!(matches!(
            Message::from_bytes(&[]),
            Err(PeerError::TruncatedMessage)
        ));
        // A have message needs four payload bytes.
        assert!(Message::from_bytes(&[4, 0, 0]).is_err());
    }
}
