//! Bencode encoder.
//!
//! Serialization is purely mechanical: integers in minimal decimal form,
//! strings as `<length>:<raw bytes>`, dictionary entries in their stored
//! order. The decoder admits only canonical input and keeps dictionaries in
//! source (ascending) order, so for any decoded value the encoder reproduces
//! the original bytes exactly; the infohash depends on this.
use super::BencodeResult;
use super::BencodeValue;
use std::io::Write;
use tracing::instrument;

/// Encodes a byte string as `<length>:<bytes>`.
#[instrument(skip(writer, s), level = "trace")]
fn encode_string<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)?;
    Ok(())
}

/// Encodes an integer as `i<number>e`.
#[instrument(skip(writer), level = "trace")]
fn encode_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<()> {
    write!(writer, "i{i}e")?;
    Ok(())
}

/// Encodes a list as `l<values>e`.
#[instrument(skip(writer, list), level = "trace")]
fn encode_list<W: Write>(writer: &mut W, list: &[BencodeValue]) -> BencodeResult<()> {
    writer.write_all(b"l")?;
    for item in list {
        encode_value(writer, item)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

/// Encodes a dictionary as `d(<key><value>)*e` in stored entry order.
///
/// Entries produced by the decoder are already ascending; hand-built
/// dictionaries must keep the same invariant or the output will not decode.
#[instrument(skip(writer, entries), level = "trace")]
fn encode_dict<W: Write>(
    writer: &mut W,
    entries: &[(Vec<u8>, BencodeValue)],
) -> BencodeResult<()> {
    writer.write_all(b"d")?;
    for (key, value) in entries {
        encode_string(writer, key)?;
        encode_value(writer, value)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

#[instrument(skip(writer, value), level = "trace")]
fn encode_value<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    match value {
        BencodeValue::String(s) => encode_string(writer, s),
        BencodeValue::Integer(i) => encode_integer(writer, *i),
        BencodeValue::List(list) => encode_list(writer, list),
        BencodeValue::Dict(entries) => encode_dict(writer, entries),
    }
}

/// Encodes a value into `writer`.
#[instrument(skip(writer, value), level = "debug")]
pub fn encode<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    encode_value(writer, value)
}

/// Encodes a value into a fresh buffer.
pub fn encode_to_vec(value: &BencodeValue) -> BencodeResult<Vec<u8>> {
    let mut buffer = Vec::new();
    encode_value(&mut buffer, value)?;
    Ok(buffer)
}
