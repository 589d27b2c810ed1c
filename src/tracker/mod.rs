//! Tracker client logic for the BitTorrent protocol.
//!
//! This module implements communication with HTTP trackers:
//! - Announce URL construction with raw-byte percent-encoding
//! - Announce requests, with the bencoded response decoded incrementally as
//!   the body streams in
//! - Peer list parsing (compact and non-compact)
//!
//! Used by the client to discover peers for a torrent.
use crate::bencode::{self, BencodeError, BencodeValue};
use crate::torrent::Torrent;
use anyhow::Result;
use byteorder::{BigEndian, ByteOrder};
use bytes::BytesMut;
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid announce URL: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("malformed tracker response: {0}")]
    Bencode(#[from] BencodeError),

    #[error("tracker returned failure: {0}")]
    Failure(String),

    #[error("tracker response missing field: {0}")]
    MissingField(&'static str),

    #[error("tracker response has invalid type for field: {0}")]
    InvalidFieldType(&'static str),

    #[error("compact peer list length {0} is not a multiple of 6")]
    InvalidPeerList(usize),

    #[error("tracker response body ended mid-value")]
    Truncated,
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// Configuration for tracker announces.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// The peer ID to identify ourselves to the tracker and peers.
    pub peer_id: [u8; 20],
    /// The port we advertise for incoming connections.
    pub port: u16,
    /// Whether to request compact peer lists.
    pub compact: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            peer_id: generate_peer_id(),
            port: 6881,
            compact: true,
        }
    }
}

/// A client communicating with a BitTorrent tracker.
#[derive(Debug)]
pub struct Client {
    peer_id: [u8; 20],
    port: u16,
    compact: bool,
}

/// The parameters of a tracker announce request.
#[derive(Debug)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub compact: bool,
    pub left: u64,
}

/// A peer received from the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// The parsed response from a tracker.
#[derive(Debug)]
pub struct AnnounceResponse {
    /// Seconds the tracker asks us to wait before re-announcing.
    pub interval: i64,
    /// Peers we can connect to, in the order the tracker listed them.
    pub peers: Vec<Peer>,
}

/// An announce URL under construction.
///
/// The base is validated once; parameters are appended verbatim, so keys and
/// values must already be percent-encoded by the caller. That is the point:
/// the infohash is 20 raw bytes encoded with [`url_encode`], and a
/// general-purpose query builder would encode the `%` signs a second time.
#[derive(Debug)]
pub struct AnnounceUrl {
    url: String,
    has_query: bool,
}

impl AnnounceUrl {
    pub fn new(base: &str) -> TrackerResult<Self> {
        let parsed = Url::parse(base)?;
        Ok(Self {
            url: base.to_string(),
            has_query: parsed.query().is_some(),
        })
    }

    /// Appends `?key=value` or `&key=value`, whichever applies.
    pub fn param(&mut self, key: &str, value: &str) -> &mut Self {
        self.url.push(if self.has_query { '&' } else { '?' });
        self.has_query = true;
        self.url.push_str(key);
        self.url.push('=');
        self.url.push_str(value);
        self
    }

    pub fn into_string(self) -> String {
        self.url
    }
}

impl Client {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            peer_id: config.peer_id,
            port: config.port,
            compact: config.compact,
        }
    }

    /// Sends an announce request to the torrent's tracker.
    ///
    /// The response body is accumulated chunk by chunk and a decode is
    /// attempted after every arrival; an incomplete value means "keep
    /// reading", anything else malformed aborts the transfer. A body that
    /// ends while the value is still incomplete is reported as truncated.
    #[tracing::instrument(skip(self, torrent), level = "debug")]
    pub async fn announce(&self, torrent: &Torrent) -> Result<AnnounceResponse> {
        let url = self.announce_url(torrent)?;
        tracing::debug!(%url, "sending announce request");

        let mut response = reqwest::get(url)
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(TrackerError::Http)?;

        let mut body = BytesMut::new();
        let value = loop {
            match response.chunk().await.map_err(TrackerError::Http)? {
                Some(chunk) => {
                    body.extend_from_slice(&chunk);
                    match bencode::decode(&body) {
                        Ok((value, _)) => break value,
                        Err(err) if err.is_incomplete() => continue,
                        Err(err) => return Err(TrackerError::Bencode(err).into()),
                    }
                }
                None => return Err(TrackerError::Truncated.into()),
            }
        };

        let parsed = Self::parse_announce_response(&value)?;
        tracing::debug!(peers = parsed.peers.len(), interval = parsed.interval, "announce complete");
        Ok(parsed)
    }

    /// Builds the announce URL. Parameter order is fixed: `info_hash`,
    /// `peer_id`, `port`, `uploaded`, `downloaded`, `compact`, `left`.
    fn announce_url(&self, torrent: &Torrent) -> TrackerResult<String> {
        let request = AnnounceRequest {
            info_hash: torrent.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: 0,
            downloaded: 0,
            compact: self.compact,
            left: torrent.info.length,
        };

        let mut url = AnnounceUrl::new(&torrent.announce)?;
        url.param("info_hash", &url_encode(&request.info_hash))
            .param("peer_id", &url_encode(&request.peer_id))
            .param("port", &request.port.to_string())
            .param("uploaded", &request.uploaded.to_string())
            .param("downloaded", &request.downloaded.to_string())
            .param("compact", if request.compact { "1" } else { "0" })
            .param("left", &request.left.to_string());
        Ok(url.into_string())
    }

    /// Parses a decoded announce response dictionary.
    ///
    /// A `failure reason` key makes the whole response a failure; otherwise
    /// `interval` and `peers` are required. The peer list keeps tracker
    /// order and comes in two shapes: the compact byte string of 6-byte
    /// `(IPv4, big-endian port)` groups we ask for with `compact=1`, or a
    /// list of `{ip, port}` dictionaries from trackers that ignore the flag.
    fn parse_announce_response(value: &BencodeValue) -> TrackerResult<AnnounceResponse> {
        if value.as_dict().is_none() {
            return Err(TrackerError::InvalidFieldType("response"));
        }

        if let Some(reason) = value.get(b"failure reason") {
            let text = reason
                .as_bytes()
                .ok_or(TrackerError::InvalidFieldType("failure reason"))?;
            return Err(TrackerError::Failure(
                String::from_utf8_lossy(text).into_owned(),
            ));
        }

        let interval = value
            .get(b"interval")
            .ok_or(TrackerError::MissingField("interval"))?
            .as_integer()
            .ok_or(TrackerError::InvalidFieldType("interval"))?;

        let peers = match value.get(b"peers").ok_or(TrackerError::MissingField("peers"))? {
            BencodeValue::String(bytes) => parse_compact_peers(bytes)?,
            BencodeValue::List(entries) => parse_peer_dicts(entries)?,
            _ => return Err(TrackerError::InvalidFieldType("peers")),
        };

        Ok(AnnounceResponse { interval, peers })
    }
}

/// Parses the compact peer list: 6 bytes per peer, 4 IPv4 octets followed by
/// a big-endian port.
fn parse_compact_peers(bytes: &[u8]) -> TrackerResult<Vec<Peer>> {
    if bytes.len() % 6 != 0 {
        return Err(TrackerError::InvalidPeerList(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| Peer {
            ip: IpAddr::V4(Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3])),
            port: BigEndian::read_u16(&chunk[4..6]),
        })
        .collect())
}

/// Parses the non-compact peer list: one dictionary per peer with `ip` and
/// `port` entries.
fn parse_peer_dicts(entries: &[BencodeValue]) -> TrackerResult<Vec<Peer>> {
    entries
        .iter()
        .map(|entry| {
            let ip_bytes = entry
                .get(b"ip")
                .and_then(BencodeValue::as_bytes)
                .ok_or(TrackerError::InvalidFieldType("ip"))?;
            let ip = String::from_utf8_lossy(ip_bytes)
                .parse::<IpAddr>()
                .map_err(|_| TrackerError::InvalidFieldType("ip"))?;
            let port = entry
                .get(b"port")
                .and_then(BencodeValue::as_integer)
                .and_then(|p| u16::try_from(p).ok())
                .ok_or(TrackerError::InvalidFieldType("port"))?;
            Ok(Peer { ip, port })
        })
        .collect()
}

/// Generates a peer ID: the `-RB0001-` client prefix followed by 12 random
/// bytes for uniqueness.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-RB0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    let mut rng = rand::rng();
    rng.fill(&mut peer_id[prefix.len()..]);
    peer_id
}

/// Percent-encodes a byte slice according to RFC 3986.
///
/// Unreserved bytes (`A-Z a-z 0-9 - . _ ~`) pass through; every other byte
/// becomes `%XX`. The input is raw bytes, not text; this is how the binary
/// infohash travels in a query string.
pub fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{byte:02X}"));
            }
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::Torrent;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const FIXTURE_PEER_ID: [u8; 20] = *b"00112233445566778899";

    fn torrent_bytes(announce: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("d8:announce{}:{}", announce.len(), announce).as_bytes());
        out.extend_from_slice(b"4:infod6:lengthi100e4:name5:t.txt12:piece lengthi32e6:pieces80:");
        for i in 0u8..4 {
            out.extend(std::iter::repeat(i).take(20));
        }
        out.extend_from_slice(b"ee");
        out
    }

    fn fixture_client() -> Client {
        Client::new(TrackerConfig {
            peer_id: FIXTURE_PEER_ID,
            port: 6881,
            compact: true,
        })
    }

    #[test]
    fn percent_encodes_raw_bytes() {
        assert_eq!(url_encode(b"Az09-._~"), "Az09-._~");
        assert_eq!(url_encode(&[0x1a, 0xe1, b' ']), "%1A%E1%20");
        assert_eq!(url_encode(&[0x00, 0xff]), "%00%FF");
    }

    #[test]
    fn announce_url_params_are_ordered_and_preencoded() {
        let torrent = Torrent::from_bytes(&torrent_bytes("http://tracker.example/announce")).unwrap();
        let url = fixture_client().announce_url(&torrent).unwrap();

        let expected_hash = url_encode(&torrent.info_hash);
        assert_eq!(
            url,
            format!(
                "http://tracker.example/announce?info_hash={expected_hash}\
                 &peer_id=00112233445566778899&port=6881&uploaded=0&downloaded=0&compact=1&left=100"
            )
        );
    }

    #[test]
    fn announce_url_respects_existing_query() {
        let mut url = AnnounceUrl::new("http://t.example/a?key=1").unwrap();
        url.param("x", "2").param("y", "3");
        assert_eq!(url.into_string(), "http://t.example/a?key=1&x=2&y=3");
    }

    #[test]
    fn parses_compact_peers_in_order() {
        let peers = parse_compact_peers(&[
            0x0a, 0x00, 0x00, 0x01, 0x1a, 0xe1, // 10.0.0.1:6881
            192, 168, 1, 9, 0x00, 0x50, // 192.168.1.9:80
        ])
        .unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].to_string(), "10.0.0.1:6881");
        assert_eq!(peers[1].to_string(), "192.168.1.9:80");
    }

    #[test]
    fn rejects_ragged_compact_peers() {
        assert!(matches!(
            parse_compact_peers(&[1, 2, 3, 4, 5, 6, 7]),
            Err(TrackerError::InvalidPeerList(7))
        ));
    }

    #[test]
    fn parses_response_shapes() {
        // Compact.
        let value = BencodeValue::Dict(vec![
            (b"interval".to_vec(), BencodeValue::Integer(1800)),
            (
                b"peers".to_vec(),
                BencodeValue::String(vec![0x0a, 0x00, 0x00, 0x01, 0x1a, 0xe1]),
            ),
        ]);
        let response = Client::parse_announce_response(&value).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.peers[0].to_string(), "10.0.0.1:6881");

        // Non-compact.
        let value = BencodeValue::Dict(vec![
            (b"interval".to_vec(), BencodeValue::Integer(900)),
            (
                b"peers".to_vec(),
                BencodeValue::List(vec![BencodeValue::Dict(vec![
                    (b"ip".to_vec(), BencodeValue::String(b"10.0.0.2".to_vec())),
                    (b"port".to_vec(), BencodeValue::Integer(51413)),
                ])]),
            ),
        ]);
        let response = Client::parse_announce_response(&value).unwrap();
        assert_eq!(response.peers[0].to_string(), "10.0.0.2:51413");

        // Failure reason wins over everything else.
        let value = BencodeValue::Dict(vec![(
            b"failure reason".to_vec(),
            BencodeValue::String(b"unregistered torrent".to_vec()),
        )]);
        let err = Client::parse_announce_response(&value).unwrap_err();
        assert!(matches!(err, TrackerError::Failure(ref msg) if msg == "unregistered torrent"));

        // Missing interval.
        let value = BencodeValue::Dict(vec![(
            b"peers".to_vec(),
            BencodeValue::String(Vec::new()),
        )]);
        assert!(matches!(
            Client::parse_announce_response(&value),
            Err(TrackerError::MissingField("interval"))
        ));
    }

    #[test]
    fn generated_peer_ids_carry_the_client_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-RB0001-");
        assert_ne!(generate_peer_id(), id);
    }

    /// Serves one HTTP response, the body written in small flushed chunks,
    /// and returns the request head it saw.
    async fn mock_tracker(listener: TcpListener, body: Vec<u8>) -> String {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            if n == 0 || request.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }

        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes()).await.unwrap();
        for chunk in body.chunks(7) {
            stream.write_all(chunk).await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        String::from_utf8_lossy(&request).into_owned()
    }

    #[tokio::test]
    async fn announce_decodes_streamed_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let body = b"d8:intervali1800e5:peers6:\x0a\x00\x00\x01\x1a\xe1e".to_vec();
        let server = tokio::spawn(mock_tracker(listener, body));

        let torrent =
            Torrent::from_bytes(&torrent_bytes(&format!("http://{addr}/announce"))).unwrap();
        let response = fixture_client().announce(&torrent).await.unwrap();

        assert_eq!(response.interval, 1800);
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].to_string(), "10.0.0.1:6881");

        // The GET line must carry the percent-encoded infohash verbatim.
        let request = server.await.unwrap();
        let expected = format!("info_hash={}", url_encode(&torrent.info_hash));
        assert!(
            request.contains(&expected),
            "request head missing {expected}: {request}"
        );
        assert!(request.contains("peer_id=00112233445566778899"));
    }

    #[tokio::test]
    async fn announce_reports_truncated_body() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // A clean HTTP body that stops mid-value.
        let body = b"d8:intervali18".to_vec();
        let server = tokio::spawn(mock_tracker(listener, body));

        let torrent =
            Torrent::from_bytes(&torrent_bytes(&format!("http://{addr}/announce"))).unwrap();
        let err = fixture_client().announce(&torrent).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrackerError>(),
            Some(TrackerError::Truncated)
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn announce_surfaces_tracker_failure_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let body = b"d14:failure reason9:not founde".to_vec();
        let server = tokio::spawn(mock_tracker(listener, body));

        let torrent =
            Torrent::from_bytes(&torrent_bytes(&format!("http://{addr}/announce"))).unwrap();
        let err = fixture_client().announce(&torrent).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrackerError>(),
            Some(TrackerError::Failure(_))
        ));
        server.await.unwrap();
    }
}
