//! Bencode codec: the wire format BitTorrent uses for metainfo files and
//! tracker responses.
//!
//! A [`BencodeValue`] is a tagged variant over the four kinds bencode
//! supports. Dictionaries are stored in a `BTreeMap` rather than a
//! `HashMap` so that in-memory order always matches the canonical
//! ascending-by-key wire order the decoder already enforces on the way in.
use std::collections::BTreeMap;
use thiserror::Error;

pub mod decoder;
pub mod encoder;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Integer(i64),
    String(Vec<u8>),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
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
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }
}

/// Errors from decoding malformed bencode. Maps onto the spec's single
/// *MalformedInput* error kind; the variants exist for diagnostics only.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("invalid integer literal at offset {0}")]
    InvalidInteger(usize),

    #[error("invalid string length at offset {0}")]
    InvalidStringLength(usize),

    #[error("dictionary key out of order or duplicated at offset {0}")]
    DictKeyOrder(usize),

    #[error("dictionary key is not a byte string at offset {0}")]
    DictKeyNotString(usize),

    #[error("unexpected byte {0:#04x} at offset {1}")]
    UnexpectedByte(u8, usize),

    #[error("trailing data after top-level value at offset {0}")]
    TrailingData(usize),
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;

/// Decodes a single bencode value from `buf`, failing if trailing bytes
/// remain. Most callers (metainfo, tracker responses) want "the whole
/// buffer is one value"; `decoder::decode` is available directly for
/// callers that need the raw offset-advancing contract from spec §4.1.
pub fn decode(buf: &[u8]) -> BencodeResult<BencodeValue> {
    let (value, next) = decoder::decode(buf, 0)?;
    if next != buf.len() {
        return Err(BencodeError::TrailingData(next));
    }
    Ok(value)
}

/// Encodes a bencode value to its canonical byte representation.
pub fn encode(value: &BencodeValue) -> Vec<u8> {
    encoder::encode(value)
}
