use crate::bencode::encoder;
use crate::bencode::BencodeValue;
use sha1::Digest;
use sha1::Sha1;

use super::TorrentResult;

/// Computes the SHA-1 infohash of an info dictionary.
///
/// The subtree is re-encoded and the digest taken over those bytes. Because
/// the decoder only admits canonical bencode, the encoding equals the
/// source bytes of the metainfo file and the hash matches what the swarm
/// expects on the wire.
pub fn calculate_info_hash(info: &BencodeValue) -> TorrentResult<[u8; 20]> {
    let mut buffer = Vec::new();
    encoder::encode(&mut buffer, info)?;

    let mut hasher = Sha1::new();
    hasher.update(&buffer);

    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&hasher.finalize());
    Ok(info_hash)
}
