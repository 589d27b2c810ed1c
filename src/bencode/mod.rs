//! Bencode value model and codec.
//!
//! Bencode is the serialization format of the BitTorrent protocol. It has
//! four kinds of value:
//!
//! 1. Byte strings: `<length>:<bytes>`, raw bytes rather than text. `4:spam`
//!    decodes to `String(b"spam")`, but the body may contain any byte,
//!    including zeros (piece hashes and compact peer lists travel this way).
//! 2. Integers: `i<number>e`, 64-bit signed in minimal decimal form.
//! 3. Lists: `l<values>e`, where order is semantic.
//! 4. Dictionaries: `d(<string key><value>)*e`, keys being byte strings in
//!    strictly ascending byte order.
//!
//! The decoder ([`decode`]) works on a byte slice and reports how many bytes
//! the value occupied; running out of input is the recoverable
//! [`BencodeError::Incomplete`], so a caller feeding the decoder from a
//! network stream can append bytes and retry. The encoder
//! ([`encoder::encode`]) reproduces the exact source bytes of any decoded
//! value, which is what makes the infohash stable.
use thiserror::Error;

pub mod decoder;
pub mod encoder;

pub use decoder::decode;

/// A decoded bencode value.
///
/// Dictionaries are kept as an ordered sequence of entries rather than a
/// map: the format requires keys in ascending byte order, the decoder
/// enforces that, and preserving the source order is what lets the encoder
/// round-trip byte for byte. Lookup is by exact byte equality via
/// [`BencodeValue::get`].
#[derive(Debug, PartialEq, Clone)]
pub enum BencodeValue {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(Vec<(Vec<u8>, BencodeValue)>),
}

impl BencodeValue {
    /// Decodes a single value, rejecting trailing input.
    pub fn from_bytes(bytes: &[u8]) -> BencodeResult<Self> {
        let (value, consumed) = decoder::decode(bytes)?;
        if consumed != bytes.len() {
            return Err(BencodeError::TrailingBytes(bytes.len() - consumed));
        }
        Ok(value)
    }

    /// Serializes the value into a fresh buffer.
    pub fn to_bytes(&self) -> BencodeResult<Vec<u8>> {
        encoder::encode_to_vec(self)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(Vec<u8>, BencodeValue)]> {
        match self {
            BencodeValue::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Looks up a dictionary entry by exact key bytes.
    ///
    /// Returns `None` when `self` is not a dictionary or the key is absent.
    pub fn get(&self, key: &[u8]) -> Option<&BencodeValue> {
        self.as_dict()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Renders the value as JSON for display.
    ///
    /// Byte strings are converted lossily to UTF-8; the wire-exact bytes are
    /// only ever taken from [`BencodeValue::as_bytes`], this is for humans.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            BencodeValue::Integer(i) => serde_json::Value::Number((*i).into()),
            BencodeValue::String(s) => {
                serde_json::Value::String(String::from_utf8_lossy(s).into_owned())
            }
            BencodeValue::List(items) => {
                serde_json::Value::Array(items.iter().map(BencodeValue::to_json).collect())
            }
            BencodeValue::Dict(entries) => {
                let map = entries
                    .iter()
                    .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), v.to_json()))
                    .collect();
                serde_json::Value::Object(map)
            }
        }
    }
}

/// Custom error type for bencode operations.
///
/// [`BencodeError::Incomplete`] is the one recoverable variant: the input was
/// a prefix of a well-formed value and decoding may be retried once more
/// bytes have been appended. Every other variant is a syntax error and the
/// input should be abandoned.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("unexpected end of input, more bytes required")]
    Incomplete,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid bencode format: {0}")]
    InvalidFormat(String),

    #[error("invalid integer")]
    InvalidInteger,

    #[error("invalid string length")]
    InvalidStringLength,

    #[error("dictionary keys must be byte strings")]
    DictKeyNotString,

    #[error("dictionary keys not in ascending order")]
    UnsortedDictKeys,

    #[error("duplicate dictionary key")]
    DuplicateDictKey,

    #[error("{0} bytes of trailing input after value")]
    TrailingBytes(usize),
}

impl BencodeError {
    /// True when decoding only failed because the input ended early.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, BencodeError::Incomplete)
    }
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
