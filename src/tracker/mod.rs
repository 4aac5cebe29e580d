//! Tracker client: builds the announce GET request, applies the custom
//! percent-encoding rule for binary query parameters, and parses the
//! bencoded response into a peer list.
use std::net::{Ipv4Addr, SocketAddrV4};

use thiserror::Error;
use tracing::instrument;

use crate::bencode::{self, BencodeError, BencodeValue};
use crate::metainfo::Metainfo;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("bencode decoding error in tracker response: {0}")]
    Bencode(#[from] BencodeError),

    #[error("tracker response is not a dictionary")]
    NotADictionary,

    #[error("tracker returned a failure reason: {0}")]
    Failure(String),

    #[error("tracker response missing `peers`")]
    MissingPeers,

    #[error("`peers` length {0} is not a multiple of 6")]
    InvalidPeersLength(usize),

    #[error("tracker returned HTTP status {0}")]
    HttpStatus(u16),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid tracker URL: {0}")]
    UrlParse(#[from] url::ParseError),
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// A peer endpoint as advertised by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl PeerAddr {
    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A client announcing to exactly one tracker for one torrent at a time.
#[derive(Debug)]
pub struct Client {
    peer_id: [u8; 20],
    port: u16,
}

impl Client {
    pub fn new(port: u16) -> Self {
        Self {
            peer_id: generate_peer_id(),
            port,
        }
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Sends the announce GET request to `metainfo.announce` and returns
    /// the peer list the tracker hands back.
    ///
    /// Builds the query string by hand rather than through
    /// `Url::query_pairs_mut`: `info_hash` and `peer_id` need the custom
    /// percent-encoding rule from spec §4.3 (unreserved bytes verbatim,
    /// everything else `%xx` lowercase hex), which doesn't match the
    /// general-purpose encoding the `url` crate applies to query values.
    ///
    /// # Arguments
    /// * `metainfo` - supplies the announce URL, info-hash, and total length
    ///   (sent as `left`).
    ///
    /// # Returns
    /// The peers decoded from the tracker's compact peer list, or a
    /// [`TrackerError`] on a non-2xx HTTP status, a `failure reason` in
    /// the response, or a malformed body.
    #[instrument(skip(self, metainfo), level = "debug")]
    pub async fn announce(&self, metainfo: &Metainfo) -> TrackerResult<Vec<PeerAddr>> {
        let mut url = url::Url::parse(&metainfo.announce)?;
        // info_hash/peer_id need the spec's custom percent-encoding, not
        // the general-purpose one `Url::query_pairs_mut` applies, so the
        // query string is built by hand instead.
        let mut query_string = String::new();
        query_string.push_str("info_hash=");
        query_string.push_str(&percent_encode(&metainfo.info_hash));
        query_string.push_str("&peer_id=");
        query_string.push_str(&percent_encode(&self.peer_id));
        query_string.push_str(&format!("&port={}", self.port));
        query_string.push_str("&uploaded=0&downloaded=0");
        query_string.push_str(&format!("&left={}", metainfo.length));
        query_string.push_str("&compact=1");
        url.set_query(Some(&query_string));

        tracing::debug!(%url, "announcing to tracker");
        let response = reqwest::get(url).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::HttpStatus(status.as_u16()));
        }
        let body = response.bytes().await?;
        parse_announce_response(&body)
    }
}

/// Parses a bencoded tracker response into a peer list.
fn parse_announce_response(body: &[u8]) -> TrackerResult<Vec<PeerAddr>> {
    let value = bencode::decode(body)?;
    let dict = value.as_dict().ok_or(TrackerError::NotADictionary)?;

    if let Some(BencodeValue::String(reason)) = dict.get(b"failure reason".as_slice()) {
        return Err(TrackerError::Failure(
            String::from_utf8_lossy(reason).into_owned(),
        ));
    }

    let peers_bytes = match dict.get(b"peers".as_slice()) {
        Some(BencodeValue::String(s)) => s,
        _ => return Err(TrackerError::MissingPeers),
    };
    if peers_bytes.len() % 6 != 0 {
        return Err(TrackerError::InvalidPeersLength(peers_bytes.len()));
    }

    Ok(peers_bytes
        .chunks_exact(6)
        .map(|chunk| PeerAddr {
            ip: Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]),
            port: u16::from_be_bytes([chunk[4], chunk[5]]),
        })
        .collect())
}

/// Generates a 20-byte peer-id: an 8-byte client tag followed by random
/// bytes, stable for the lifetime of the process.
fn generate_peer_id() -> [u8; 20] {
    use rand::Rng;
    let mut peer_id = [0u8; 20];
    let prefix = b"-RS0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    let mut rng = rand::rng();
    rng.fill(&mut peer_id[prefix.len()..]);
    peer_id
}

/// The percent-encoding rule from spec §4.3: unreserved bytes (letters,
/// digits, `-_.~`) pass through verbatim; everything else becomes `%xx`
/// with lowercase hex digits.
pub fn percent_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02x}")),
        }
    }
    out
}
