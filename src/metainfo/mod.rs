//! Metainfo loader: decodes a `.torrent` file, validates the required
//! fields, and computes the info-hash. Single-file torrents only — see
//! spec.md's Non-goals (multi-file torrents are out of scope for this
//! client).
use std::collections::BTreeMap;

use thiserror::Error;

use crate::bencode::{decoder, BencodeError, BencodeValue};

mod info_hash;
pub use info_hash::compute_info_hash;

pub const HASH_LEN: usize = 20;

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode decoding error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("top-level value is not a dictionary")]
    NotADictionary,

    #[error("`info` is not a dictionary")]
    InfoNotADictionary,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{0}` has the wrong type")]
    WrongType(&'static str),

    #[error("`pieces` length {0} is not a multiple of {HASH_LEN}")]
    InvalidPiecesLength(usize),

    #[error("`announce` is not valid UTF-8")]
    InvalidAnnounce,

    #[error("`name` is not valid UTF-8")]
    InvalidName,

    #[error("`piece length` must be greater than zero")]
    NonPositivePieceLength,

    #[error("trailing data after top-level dictionary at offset {0}")]
    TrailingData(usize),
}

pub type MetainfoResult<T> = std::result::Result<T, MetainfoError>;

/// A loaded, validated `.torrent` file (single-file torrents only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    pub announce: String,
    pub name: String,
    pub length: u64,
    pub piece_length: u64,
    pub piece_hashes: Vec<[u8; HASH_LEN]>,
    pub info_hash: [u8; HASH_LEN],
}

impl Metainfo {
    /// Decodes a `.torrent` byte stream, validates the required fields,
    /// and computes the info-hash.
    ///
    /// The info-hash is hashed from the exact original byte span of the
    /// `info` sub-dictionary, captured during decode rather than
    /// re-derived by re-encoding the parsed value (spec §4.2, §9) — this
    /// keeps the hash stable even against a decoder that might someday
    /// normalize something re-encoding would change.
    ///
    /// # Arguments
    /// * `data` - the raw bytes of a `.torrent` file.
    ///
    /// # Returns
    /// A validated [`Metainfo`], or a [`MetainfoError`] if the top-level
    /// value isn't a canonical bencoded dictionary, a required field is
    /// missing or has the wrong type, or `pieces` isn't a multiple of
    /// [`HASH_LEN`] bytes.
    pub fn load(data: &[u8]) -> MetainfoResult<Metainfo> {
        let (top, end) = decoder::decode_dict_with_spans(data, 0).map_err(|e| match e {
            BencodeError::UnexpectedByte(..) | BencodeError::UnexpectedEof => {
                MetainfoError::NotADictionary
            }
            other => MetainfoError::Bencode(other),
        })?;
        // `decode_dict_with_spans` stops at the closing `e` of the top-level
        // dict; anything left over is garbage appended after the torrent,
        // same rejection `bencode::decode` applies to its callers.
        if end != data.len() {
            return Err(MetainfoError::TrailingData(end));
        }

        let announce = match top.get(b"announce".as_slice()) {
            Some((BencodeValue::String(s), _)) => String::from_utf8(s.clone())
                .map_err(|_| MetainfoError::InvalidAnnounce)?,
            Some(_) => return Err(MetainfoError::WrongType("announce")),
            None => return Err(MetainfoError::MissingField("announce")),
        };

        let (info_value, info_span) = top
            .get(b"info".as_slice())
            .ok_or(MetainfoError::MissingField("info"))?;
        let info_dict = match info_value {
            BencodeValue::Dict(d) => d,
            _ => return Err(MetainfoError::InfoNotADictionary),
        };
        let info_bytes = &data[info_span.clone()];
        let info_hash = compute_info_hash(info_bytes);

        let (name, length, piece_length, piece_hashes) = parse_info_fields(info_dict)?;

        Ok(Metainfo {
            announce,
            name,
            length,
            piece_length,
            piece_hashes,
            info_hash,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Size of the piece at `index`, accounting for the (possibly
    /// shorter) final piece.
    pub fn piece_size(&self, index: usize) -> u64 {
        if index + 1 == self.piece_count() {
            self.length - (self.piece_count() as u64 - 1) * self.piece_length
        } else {
            self.piece_length
        }
    }
}

fn parse_info_fields(
    dict: &BTreeMap<Vec<u8>, BencodeValue>,
) -> MetainfoResult<(String, u64, u64, Vec<[u8; HASH_LEN]>)> {
    let name = match dict.get(b"name".as_slice()) {
        Some(BencodeValue::String(s)) => {
            String::from_utf8(s.clone()).map_err(|_| MetainfoError::InvalidName)?
        }
        Some(_) => return Err(MetainfoError::WrongType("name")),
        None => return Err(MetainfoError::MissingField("name")),
    };

    let length = match dict.get(b"length".as_slice()) {
        Some(BencodeValue::Integer(i)) if *i >= 0 => *i as u64,
        Some(BencodeValue::Integer(_)) => return Err(MetainfoError::WrongType("length")),
        Some(_) => return Err(MetainfoError::WrongType("length")),
        None => return Err(MetainfoError::MissingField("length")),
    };

    let piece_length = match dict.get(b"piece length".as_slice()) {
        Some(BencodeValue::Integer(i)) if *i > 0 => *i as u64,
        Some(BencodeValue::Integer(_)) => return Err(MetainfoError::NonPositivePieceLength),
        Some(_) => return Err(MetainfoError::WrongType("piece length")),
        None => return Err(MetainfoError::MissingField("piece length")),
    };

    let pieces_bytes = match dict.get(b"pieces".as_slice()) {
        Some(BencodeValue::String(s)) => s,
        Some(_) => return Err(MetainfoError::WrongType("pieces")),
        None => return Err(MetainfoError::MissingField("pieces")),
    };
    if pieces_bytes.len() % HASH_LEN != 0 {
        return Err(MetainfoError::InvalidPiecesLength(pieces_bytes.len()));
    }
    let piece_hashes = pieces_bytes
        .chunks_exact(HASH_LEN)
        .map(|chunk| {
            let mut hash = [0u8; HASH_LEN];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect();

    Ok((name, length, piece_length, piece_hashes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bytes() -> Vec<u8> {
        // announce, info{length, name, piece length, pieces (one 20-byte hash)}
        let mut pieces = vec![0u8; 20];
        pieces[0] = 0xaa;
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce20:http://tracker.local4:infod6:lengthi12345e4:name8:file.bin12:piece lengthi16384e6:pieces20:");
        data.extend_from_slice(&pieces);
        data.extend_from_slice(b"ee");
        data
    }

    #[test]
    fn loads_a_well_formed_metainfo() {
        let data = sample_bytes();
        let metainfo = Metainfo::load(&data).unwrap();
        assert_eq!(metainfo.announce, "http://tracker.local");
        assert_eq!(metainfo.name, "file.bin");
        assert_eq!(metainfo.length, 12345);
        assert_eq!(metainfo.piece_length, 16384);
        assert_eq!(metainfo.piece_hashes.len(), 1);
        assert_eq!(metainfo.piece_hashes[0][0], 0xaa);
    }

    #[test]
    fn info_hash_is_stable_regardless_of_source_key_order() {
        // info dict keys are already canonical (length < name < piece length < pieces)
        // because the decoder rejects non-canonical input; re-running load on the
        // same bytes must reproduce the same hash.
        let data = sample_bytes();
        let first = Metainfo::load(&data).unwrap().info_hash;
        let second = Metainfo::load(&data).unwrap().info_hash;
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_pieces_length_not_a_multiple_of_20() {
        let data = b"d8:announce3:url4:infod6:lengthi1e4:name1:a12:piece lengthi1e6:pieces5:abcdeee".to_vec();
        assert!(matches!(
            Metainfo::load(&data),
            Err(MetainfoError::InvalidPiecesLength(5))
        ));
    }

    #[test]
    fn rejects_missing_info() {
        let data = b"d8:announce3:urle".to_vec();
        assert!(matches!(
            Metainfo::load(&data),
            Err(MetainfoError::MissingField("info"))
        ));
    }

    #[test]
    fn rejects_trailing_garbage_after_top_level_dict() {
        let mut data = sample_bytes();
        data.extend_from_slice(b"garbage");
        assert!(matches!(
            Metainfo::load(&data),
            Err(MetainfoError::TrailingData(_))
        ));
    }
}
