//! Torrent metainfo parsing and error handling logic.
//!
//! This module provides the metainfo model for single-file torrents: the
//! decomposition of the info dictionary into pieces and blocks, the infohash
//! derived from the re-encoded info subtree, and the validation errors a
//! malformed metainfo can surface.
use thiserror::Error;

pub mod file;
pub mod info_hash;

pub use file::{Block, Info, Piece, Torrent, BLOCK_SIZE};

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid torrent file format: {0}")]
    InvalidFormat(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid data type for field: {0}")]
    InvalidFieldType(&'static str),

    #[error("pieces length is not a multiple of 20")]
    InvalidPiecesHashLength,

    #[error("torrent has no pieces")]
    EmptyPieces,

    #[error("piece length must be positive")]
    InvalidPieceLength,

    #[error("pieces hash count {actual} does not match file layout ({expected})")]
    InvalidPieceCount { expected: u64, actual: u64 },
}

/// Result type for torrent operations derived from `std::result`
pub type TorrentResult<T> = std::result::Result<T, TorrentError>;
