//! Incremental bencode decoder.
//!
//! The decoder is a cursor over a byte slice. It never reads past the end of
//! the input: wherever the grammar needs a byte that is not there yet, it
//! fails with [`BencodeError::Incomplete`] instead. That makes it safe to
//! drive from a streaming source: accumulate bytes in a buffer, attempt a
//! decode after every arrival, and retry from the start of the buffer while
//! the error is incomplete. A decode attempt holds no state between calls.
//!
//! Only canonical encodings are accepted: integers in minimal decimal form
//! (no `-0`, no leading zeros), string lengths without leading zeros,
//! dictionary keys strictly ascending with no duplicates. Re-encoding a
//! decoded value therefore reproduces the source bytes exactly.
use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;

use tracing::instrument;

/// Decodes one value from the front of `input`.
///
/// Returns the value together with its encoded length, i.e. the number of
/// input bytes it occupied. Trailing bytes are left for the caller; use
/// [`BencodeValue::from_bytes`] to insist on full consumption.
#[instrument(skip(input), level = "trace", fields(len = input.len()))]
pub fn decode(input: &[u8]) -> BencodeResult<(BencodeValue, usize)> {
    let mut decoder = Decoder::new(input);
    let value = decoder.decode_next()?;
    Ok((value, decoder.position()))
}

/// Cursor over a bencoded byte slice.
#[derive(Debug)]
pub struct Decoder<'a> {
    input: &'a [u8],
    position: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, position: 0 }
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Returns the byte at the cursor without consuming it.
    fn peek(&self) -> BencodeResult<u8> {
        self.input
            .get(self.position)
            .copied()
            .ok_or(BencodeError::Incomplete)
    }

    /// Consumes and returns the byte at the cursor.
    fn advance(&mut self) -> BencodeResult<u8> {
        let byte = self.peek()?;
        self.position += 1;
        Ok(byte)
    }

    /// Consumes exactly `n` bytes, returning them as a slice of the input.
    fn take(&mut self, n: usize) -> BencodeResult<&'a [u8]> {
        let end = self
            .position
            .checked_add(n)
            .ok_or(BencodeError::Incomplete)?;
        if end > self.input.len() {
            return Err(BencodeError::Incomplete);
        }
        let bytes = &self.input[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    /// Consumes bytes until `delimiter`, which is consumed but excluded from
    /// the returned slice. Reaching the end of input first is `Incomplete`.
    fn read_until(&mut self, delimiter: u8) -> BencodeResult<&'a [u8]> {
        let start = self.position;
        loop {
            if self.peek()? == delimiter {
                let bytes = &self.input[start..self.position];
                self.position += 1;
                return Ok(bytes);
            }
            self.position += 1;
        }
    }

    /// Decodes the next value, dispatching on its leading byte:
    /// a digit for strings, `i` for integers, `l` for lists, `d` for
    /// dictionaries.
    pub fn decode_next(&mut self) -> BencodeResult<BencodeValue> {
        match self.peek()? {
            b'0'..=b'9' => self.decode_string().map(BencodeValue::String),
            b'i' => self.decode_integer().map(BencodeValue::Integer),
            b'l' => self.decode_list().map(BencodeValue::List),
            b'd' => self.decode_dict().map(BencodeValue::Dict),
            other => Err(BencodeError::InvalidFormat(format!(
                "unexpected byte 0x{other:02x} at offset {}",
                self.position
            ))),
        }
    }

    /// Decodes a byte string of the form `<length>:<bytes>`.
    ///
    /// The body is raw bytes and is never inspected. A nonzero length with a
    /// leading zero is rejected so the encoding stays canonical.
    fn decode_string(&mut self) -> BencodeResult<Vec<u8>> {
        let digits = self.read_until(b':')?;
        let length = parse_string_length(digits)?;
        Ok(self.take(length)?.to_vec())
    }

    /// Decodes an integer of the form `i<number>e`.
    ///
    /// `-0`, an empty number, leading zeros on a nonzero value, any
    /// non-digit byte, and values outside `i64` are all rejected.
    fn decode_integer(&mut self) -> BencodeResult<i64> {
        let first_byte = self.advance()?;
        if first_byte != b'i' {
            return Err(BencodeError::InvalidFormat(
                "integer must start with 'i'".to_string(),
            ));
        }

        let number = self.read_until(b'e')?;
        let digits = match number.split_first() {
            Some((&b'-', rest)) => rest,
            _ => number,
        };
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(BencodeError::InvalidInteger);
        }
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(BencodeError::InvalidInteger);
        }
        if number == b"-0" {
            return Err(BencodeError::InvalidInteger);
        }

        // The digit check above leaves overflow as the only parse failure.
        std::str::from_utf8(number)
            .map_err(|_| BencodeError::InvalidInteger)?
            .parse::<i64>()
            .map_err(|_| BencodeError::InvalidInteger)
    }

    /// Decodes a list of the form `l<values>e`, preserving element order.
    fn decode_list(&mut self) -> BencodeResult<Vec<BencodeValue>> {
        let first_byte = self.advance()?;
        if first_byte != b'l' {
            return Err(BencodeError::InvalidFormat(
                "list must start with 'l'".to_string(),
            ));
        }

        let mut items = Vec::new();
        loop {
            if self.peek()? == b'e' {
                self.position += 1;
                return Ok(items);
            }
            items.push(self.decode_next()?);
        }
    }

    /// Decodes a dictionary of the form `d(<key><value>)*e`.
    ///
    /// Keys must be byte strings in strictly ascending byte order; an
    /// out-of-order or repeated key is a syntax error. Entries are returned
    /// in source order.
    fn decode_dict(&mut self) -> BencodeResult<Vec<(Vec<u8>, BencodeValue)>> {
        let first_byte = self.advance()?;
        if first_byte != b'd' {
            return Err(BencodeError::InvalidFormat(
                "dictionary must start with 'd'".to_string(),
            ));
        }

        let mut entries: Vec<(Vec<u8>, BencodeValue)> = Vec::new();
        loop {
            match self.peek()? {
                b'e' => {
                    self.position += 1;
                    return Ok(entries);
                }
                b'0'..=b'9' => {}
                _ => return Err(BencodeError::DictKeyNotString),
            }

            let key = self.decode_string()?;
            if let Some((previous, _)) = entries.last() {
                match previous.as_slice().cmp(key.as_slice()) {
                    std::cmp::Ordering::Less => {}
                    std::cmp::Ordering::Equal => return Err(BencodeError::DuplicateDictKey),
                    std::cmp::Ordering::Greater => return Err(BencodeError::UnsortedDictKeys),
                }
            }
            let value = self.decode_next()?;
            entries.push((key, value));
        }
    }
}

/// Parses a string length prefix: ASCII digits, no leading zero unless the
/// length is exactly `0`.
fn parse_string_length(digits: &[u8]) -> BencodeResult<usize> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(BencodeError::InvalidStringLength);
    }
    if digits.len() > 1 && digits[0] == b'0' {
        return Err(BencodeError::InvalidStringLength);
    }
    std::str::from_utf8(digits)
        .map_err(|_| BencodeError::InvalidStringLength)?
        .parse::<usize>()
        .map_err(|_| BencodeError::InvalidStringLength)
}
