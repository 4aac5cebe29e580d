//! Bencode encoder: the inverse of [`super::decoder`]. Dictionary keys are
//! always emitted in ascending byte order because [`super::BencodeValue`]
//! stores them in a `BTreeMap`; no separate sort step is needed.
use super::BencodeValue;

pub fn encode(value: &BencodeValue) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(&mut buf, value);
    buf
}

fn encode_into(buf: &mut Vec<u8>, value: &BencodeValue) {
    match value {
        BencodeValue::Integer(i) => {
            buf.extend_from_slice(b"i");
            buf.extend_from_slice(i.to_string().as_bytes());
            buf.extend_from_slice(b"e");
        }
        BencodeValue::String(s) => {
            buf.extend_from_slice(s.len().to_string().as_bytes());
            buf.extend_from_slice(b":");
            buf.extend_from_slice(s);
        }
        BencodeValue::List(items) => {
            buf.extend_from_slice(b"l");
            for item in items {
                encode_into(buf, item);
            }
            buf.extend_from_slice(b"e");
        }
        BencodeValue::Dict(dict) => {
            buf.extend_from_slice(b"d");
            for (key, value) in dict {
                encode_into(buf, &BencodeValue::String(key.clone()));
                encode_into(buf, value);
            }
            buf.extend_from_slice(b"e");
        }
    }
}
