//! The 68-byte BitTorrent handshake (spec §4.4): protocol identifier,
//! reserved bytes, info-hash, and peer-id, exchanged once at connect.
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::instrument;

use super::{PeerError, PeerResult};

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
const HANDSHAKE_LEN: usize = 68;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake { info_hash, peer_id }
    }

    /// Serializes to the fixed 68-byte wire form.
    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = 19;
        buf[1..20].copy_from_slice(PROTOCOL);
        // bytes 20..28 stay zero (reserved)
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parses a 68-byte buffer, checking the protocol header but not the
    /// info-hash (callers compare that against their own expectation).
    pub fn parse(buf: &[u8; HANDSHAKE_LEN]) -> PeerResult<Self> {
        if buf[0] != 19 || &buf[1..20] != PROTOCOL {
            return Err(PeerError::HandshakeProtocolMismatch);
        }
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);
        Ok(Handshake { info_hash, peer_id })
    }

    /// Performs a complete handshake over `stream`: sends ours, reads
    /// theirs, and validates the protocol header and info-hash. Returns
    /// the remote peer's handshake (primarily its `peer_id`).
    #[instrument(skip(stream), level = "debug")]
    pub async fn exchange(
        stream: &mut TcpStream,
        info_hash: [u8; 20],
        local_peer_id: [u8; 20],
        idle_timeout: Duration,
    ) -> PeerResult<Handshake> {
        let ours = Handshake::new(info_hash, local_peer_id);
        timeout(idle_timeout, stream.write_all(&ours.serialize())).await??;

        let mut buf = [0u8; HANDSHAKE_LEN];
        timeout(idle_timeout, stream.read_exact(&mut buf)).await??;
        let theirs = Handshake::parse(&buf)?;
        if theirs.info_hash != info_hash {
            return Err(PeerError::HandshakeInfoHashMismatch);
        }
        Ok(theirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_then_parse_round_trips() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = hs.serialize();
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], PROTOCOL);
        let parsed = Handshake::parse(&bytes).unwrap();
        assert_eq!(parsed, hs);
    }

    #[test]
    fn rejects_bad_protocol_length() {
        let mut bytes = Handshake::new([0u8; 20], [0u8; 20]).serialize();
        bytes[0] = 18;
        assert!(matches!(
            Handshake::parse(&bytes),
            Err(PeerError::HandshakeProtocolMismatch)
        ));
    }

    #[test]
    fn rejects_bad_protocol_string() {
        let mut bytes = Handshake::new([0u8; 20], [0u8; 20]).serialize();
        bytes[5] = b'X';
        assert!(matches!(
            Handshake::parse(&bytes),
            Err(PeerError::HandshakeProtocolMismatch)
        ));
    }
}
