//! Torrent metainfo structure and parsing logic.
//!
//! A single-file torrent is described by its top-level `announce` URL and an
//! `info` dictionary. Parsing decomposes the info dictionary into the piece
//! and block layout used by the download path: every piece carries its
//! 20-byte SHA-1 hash and the block offsets a peer will be asked for.
use crate::bencode::BencodeValue;
use crate::torrent::info_hash;

use super::TorrentError;
use super::TorrentResult;
use anyhow::Result;
use tracing::debug;

/// Size in bytes of a transfer block, the unit of a peer `request` message.
pub const BLOCK_SIZE: u32 = 16_384;

#[derive(Debug, PartialEq, Clone)]
pub struct Torrent {
    pub announce: String,
    pub info: Info,
    /// SHA-1 of the bencoded info dictionary; the torrent's wire identity.
    pub info_hash: [u8; 20],
}

#[derive(Debug, PartialEq, Clone)]
pub struct Info {
    pub name: String,
    /// Total file size in bytes.
    pub length: u64,
    /// Size of every piece except possibly the last.
    pub piece_length: u64,
    pub pieces: Vec<Piece>,
}

/// One piece of the file: a fixed-size chunk hashed independently.
#[derive(Debug, PartialEq, Clone)]
pub struct Piece {
    pub index: u32,
    pub size: u64,
    pub hash: [u8; 20],
    /// Block layout in ascending offset order; sizes sum to `size`.
    pub blocks: Vec<Block>,
}

/// A sub-chunk of a piece, `BLOCK_SIZE` bytes except for a shorter tail.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Block {
    pub offset: u32,
    pub size: u32,
}

/**
Splits the concatenated SHA-1 hashes of the `pieces` string.

The `pieces` key in the info dictionary is one byte string holding the
20-byte SHA-1 hash of every piece, in piece-index order. The length must be
a nonzero multiple of 20.
*/
fn parse_pieces(pieces_bytes: &[u8]) -> TorrentResult<Vec<[u8; 20]>> {
    if pieces_bytes.len() % 20 != 0 {
        return Err(TorrentError::InvalidPiecesHashLength);
    }
    if pieces_bytes.is_empty() {
        return Err(TorrentError::EmptyPieces);
    }
    let mut hashes = Vec::with_capacity(pieces_bytes.len() / 20);
    for chunk in pieces_bytes.chunks_exact(20) {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(chunk);
        hashes.push(hash);
    }
    Ok(hashes)
}

/// Lays out the blocks of a piece of `size` bytes: `BLOCK_SIZE` each at
/// ascending offsets, with the remainder (if any) as a shorter last block.
fn block_layout(size: u64) -> Vec<Block> {
    let count = size.div_ceil(u64::from(BLOCK_SIZE));
    let mut blocks = Vec::with_capacity(count as usize);
    for index in 0..count {
        let offset = index * u64::from(BLOCK_SIZE);
        let block_size = (size - offset).min(u64::from(BLOCK_SIZE));
        blocks.push(Block {
            offset: offset as u32,
            size: block_size as u32,
        });
    }
    blocks
}

fn required<'a>(
    dict: &'a BencodeValue,
    key: &'static str,
) -> TorrentResult<&'a BencodeValue> {
    dict.get(key.as_bytes())
        .ok_or(TorrentError::MissingField(key))
}

fn required_integer(dict: &BencodeValue, key: &'static str) -> TorrentResult<i64> {
    required(dict, key)?
        .as_integer()
        .ok_or(TorrentError::InvalidFieldType(key))
}

fn required_string<'a>(dict: &'a BencodeValue, key: &'static str) -> TorrentResult<&'a [u8]> {
    required(dict, key)?
        .as_bytes()
        .ok_or(TorrentError::InvalidFieldType(key))
}

fn required_utf8(dict: &BencodeValue, key: &'static str) -> TorrentResult<String> {
    String::from_utf8(required_string(dict, key)?.to_vec())
        .map_err(|e| TorrentError::InvalidFormat(format!("{key} is not UTF-8: {e}")))
}

/**
Parses the info dictionary into the piece and block layout.

Required fields: `length` (total file size), `name`, `piece length`,
`pieces`. The hash count must agree with `ceil(length / piece length)`;
a torrent with zero pieces, or with hashes left over, is rejected.
*/
fn parse_info(value: &BencodeValue) -> TorrentResult<Info> {
    if value.as_dict().is_none() {
        return Err(TorrentError::InvalidFieldType("info"));
    }

    let length = required_integer(value, "length")?;
    if length < 0 {
        return Err(TorrentError::InvalidFieldType("length"));
    }
    let length = length as u64;

    let name = required_utf8(value, "name")?;

    let piece_length = required_integer(value, "piece length")?;
    if piece_length <= 0 || piece_length > i64::from(u32::MAX) {
        return Err(TorrentError::InvalidPieceLength);
    }
    let piece_length = piece_length as u64;

    let hashes = parse_pieces(required_string(value, "pieces")?)?;

    let num_pieces = length.div_ceil(piece_length);
    if num_pieces != hashes.len() as u64 {
        return Err(TorrentError::InvalidPieceCount {
            expected: num_pieces,
            actual: hashes.len() as u64,
        });
    }

    let pieces = hashes
        .into_iter()
        .enumerate()
        .map(|(index, hash)| {
            // Remainder-or-full rule for the last piece.
            let size = if index as u64 == num_pieces - 1 && length % piece_length != 0 {
                length % piece_length
            } else {
                piece_length
            };
            Piece {
                index: index as u32,
                size,
                hash,
                blocks: block_layout(size),
            }
        })
        .collect();

    Ok(Info {
        name,
        length,
        piece_length,
        pieces,
    })
}

impl Torrent {
    /// Decodes and parses a `.torrent` file's bytes.
    ///
    /// Exactly one bencoded value is expected; trailing bytes are an error.
    pub fn from_bytes(data: &[u8]) -> Result<Torrent> {
        let value = BencodeValue::from_bytes(data).map_err(TorrentError::Bencode)?;
        Self::parse(value)
    }

    /**
    Parses a decoded metainfo value into a `Torrent`.

    The top level must be a dictionary with `announce` (UTF-8 tracker URL)
    and `info`. The infohash is computed over the re-encoded `info` subtree
    before the subtree is pulled apart, so it matches the source bytes of
    the file exactly.
    */
    #[tracing::instrument(level = "debug", skip(value))]
    pub fn parse(value: BencodeValue) -> Result<Torrent> {
        if value.as_dict().is_none() {
            return Err(TorrentError::InvalidFormat("root is not a dictionary".to_string()).into());
        }

        let announce = required_utf8(&value, "announce")?;
        let info_value = required(&value, "info")?;

        let info_hash = info_hash::calculate_info_hash(info_value)?;
        let info = parse_info(info_value)?;
        debug!(
            name = %info.name,
            pieces = info.pieces.len(),
            info_hash = %hex::encode(info_hash),
            "parsed torrent metainfo"
        );

        Ok(Torrent {
            announce,
            info,
            info_hash,
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.info.pieces.len()
    }

    /// The piece at `index`, if the torrent has one.
    pub fn piece(&self, index: u32) -> Option<&Piece> {
        self.info.pieces.get(index as usize)
    }
}
