//! Info-hash computation: the 20-byte SHA-1 digest that identifies a
//! torrent swarm-wide.
use sha1::{Digest, Sha1};

/// Hashes the raw bencoded bytes of an `info` dictionary. Callers must
/// pass the exact byte span as it appeared on the wire — this function
/// never re-encodes, so it can't accidentally produce a different hash
/// for a non-canonically-ordered (and thus already-rejected) input.
pub fn compute_info_hash(info_bytes: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(info_bytes);
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}
