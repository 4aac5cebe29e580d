//! Offset-advancing bencode decoder: `decode(buf, offset)` yields a value
//! and the offset just past it, per spec §4.1's decode contract. Working
//! over a byte buffer rather than a `Read` stream lets callers capture the
//! exact byte span of a sub-value (used by [`crate::metainfo`] to hash the
//! `info` dictionary without re-encoding it).
use std::collections::BTreeMap;
use std::ops::Range;

use super::{BencodeError, BencodeResult, BencodeValue};

/// Decodes one bencode value starting at `offset`, dispatching on a single
/// byte of lookahead per spec §4.1's grammar (`i` integer, `l` list, `d`
/// dictionary, an ASCII digit starting a byte-string length).
///
/// # Arguments
/// * `buf` - the full input buffer; `offset` need not be `0`, so callers
///   can decode one value out of a larger stream (used recursively by
///   [`decode_list`] and [`decode_dict`]).
/// * `offset` - index of the first byte of the value to decode.
///
/// # Returns
/// The decoded value and the offset of the first byte after it, or a
/// [`BencodeError`] if the bytes at `offset` don't form a valid value.
pub fn decode(buf: &[u8], offset: usize) -> BencodeResult<(BencodeValue, usize)> {
    match buf.get(offset) {
        None => Err(BencodeError::UnexpectedEof),
        Some(b'i') => {
            let (v, next) = decode_integer(buf, offset)?;
            Ok((BencodeValue::Integer(v), next))
        }
        Some(b'l') => {
            let (v, next) = decode_list(buf, offset)?;
            Ok((BencodeValue::List(v), next))
        }
        Some(b'd') => {
            let (v, next) = decode_dict(buf, offset)?;
            Ok((BencodeValue::Dict(v), next))
        }
        Some(b'0'..=b'9') => {
            let (v, next) = decode_string(buf, offset)?;
            Ok((BencodeValue::String(v), next))
        }
        Some(&b) => Err(BencodeError::UnexpectedByte(b, offset)),
    }
}

/// Decodes `<decimal-length>:<bytes>`. `offset` must point at the first
/// length digit.
pub fn decode_string(buf: &[u8], offset: usize) -> BencodeResult<(Vec<u8>, usize)> {
    let colon = find(buf, b':', offset).ok_or(BencodeError::UnexpectedEof)?;
    let digits = &buf[offset..colon];
    if digits.is_empty() || (digits.len() > 1 && digits[0] == b'0') || !digits.iter().all(u8::is_ascii_digit)
    {
        return Err(BencodeError::InvalidStringLength(offset));
    }
    let len: usize = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(BencodeError::InvalidStringLength(offset))?;

    let start = colon + 1;
    let end = start
        .checked_add(len)
        .ok_or(BencodeError::InvalidStringLength(offset))?;
    if end > buf.len() {
        return Err(BencodeError::UnexpectedEof);
    }
    Ok((buf[start..end].to_vec(), end))
}

/// Decodes `i<digits>e`. `offset` must point at `i`.
fn decode_integer(buf: &[u8], offset: usize) -> BencodeResult<(i64, usize)> {
    debug_assert_eq!(buf[offset], b'i');
    let start = offset + 1;
    let e = find(buf, b'e', start).ok_or(BencodeError::UnexpectedEof)?;
    let digits = &buf[start..e];

    if digits.is_empty() {
        return Err(BencodeError::InvalidInteger(offset));
    }
    let (sign, magnitude) = if digits[0] == b'-' {
        (true, &digits[1..])
    } else {
        (false, digits)
    };
    if magnitude.is_empty() || !magnitude.iter().all(u8::is_ascii_digit) {
        return Err(BencodeError::InvalidInteger(offset));
    }
    if magnitude.len() > 1 && magnitude[0] == b'0' {
        return Err(BencodeError::InvalidInteger(offset));
    }
    if sign && magnitude == b"0" {
        // "-0" is forbidden.
        return Err(BencodeError::InvalidInteger(offset));
    }

    let text = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInteger(offset))?;
    let value = text
        .parse::<i64>()
        .map_err(|_| BencodeError::InvalidInteger(offset))?;
    Ok((value, e + 1))
}

/// Decodes `l<value>*e`. `offset` must point at `l`.
fn decode_list(buf: &[u8], offset: usize) -> BencodeResult<(Vec<BencodeValue>, usize)> {
    debug_assert_eq!(buf[offset], b'l');
    let mut pos = offset + 1;
    let mut items = Vec::new();
    loop {
        match buf.get(pos) {
            None => return Err(BencodeError::UnexpectedEof),
            Some(b'e') => {
                pos += 1;
                break;
            }
            Some(_) => {
                let (value, next) = decode(buf, pos)?;
                items.push(value);
                pos = next;
            }
        }
    }
    Ok((items, pos))
}

/// Decodes `d(<string-key><value>)*e`. `offset` must point at `d`. Keys
/// must be byte strings in strictly ascending byte order; anything else
/// fails per spec §4.1.
fn decode_dict(buf: &[u8], offset: usize) -> BencodeResult<(BTreeMap<Vec<u8>, BencodeValue>, usize)> {
    debug_assert_eq!(buf[offset], b'd');
    let mut pos = offset + 1;
    let mut dict = BTreeMap::new();
    let mut last_key: Option<Vec<u8>> = None;

    loop {
        match buf.get(pos) {
            None => return Err(BencodeError::UnexpectedEof),
            Some(b'e') => {
                pos += 1;
                break;
            }
            Some(b'0'..=b'9') => {
                let key_start = pos;
                let (key, next) = decode_string(buf, pos)?;
                if let Some(last) = &last_key {
                    if key <= *last {
                        return Err(BencodeError::DictKeyOrder(key_start));
                    }
                }
                let (value, next2) = decode(buf, next)?;
                last_key = Some(key.clone());
                dict.insert(key, value);
                pos = next2;
            }
            Some(_) => return Err(BencodeError::DictKeyNotString(pos)),
        }
    }
    Ok((dict, pos))
}

/// Decodes a dictionary exactly like the `d` arm of [`decode`], but also
/// records the raw byte span of each value's encoding alongside it. The
/// metainfo loader uses this to hash the `info` sub-dictionary from its
/// original bytes instead of re-encoding it (spec §4.2, §9).
pub fn decode_dict_with_spans(
    buf: &[u8],
    offset: usize,
) -> BencodeResult<(BTreeMap<Vec<u8>, (BencodeValue, Range<usize>)>, usize)> {
    if buf.get(offset) != Some(&b'd') {
        return Err(buf
            .get(offset)
            .map(|&b| BencodeError::UnexpectedByte(b, offset))
            .unwrap_or(BencodeError::UnexpectedEof));
    }
    let mut pos = offset + 1;
    let mut dict = BTreeMap::new();
    let mut last_key: Option<Vec<u8>> = None;

    loop {
        match buf.get(pos) {
            None => return Err(BencodeError::UnexpectedEof),
            Some(b'e') => {
                pos += 1;
                break;
            }
            Some(b'0'..=b'9') => {
                let key_start = pos;
                let (key, value_start) = decode_string(buf, pos)?;
                if let Some(last) = &last_key {
                    if key <= *last {
                        return Err(BencodeError::DictKeyOrder(key_start));
                    }
                }
                let (value, next) = decode(buf, value_start)?;
                last_key = Some(key.clone());
                dict.insert(key, (value, value_start..next));
                pos = next;
            }
            Some(_) => return Err(BencodeError::DictKeyNotString(pos)),
        }
    }
    Ok((dict, pos))
}

fn find(buf: &[u8], needle: u8, from: usize) -> Option<usize> {
    buf[from..].iter().position(|&b| b == needle).map(|i| from + i)
}
