//! Peer-protocol engine: handshake, message framing, per-peer session
//! state, and pipelined block download with hash verification.
use thiserror::Error;

pub mod bitfield;
pub mod handshake;
pub mod message;
pub mod session;

pub use session::PeerSession;

/// Wire block size, fixed by the BitTorrent protocol (spec §4.4).
pub const BLOCK_SIZE: u32 = 16384;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out waiting for peer")]
    Timeout,

    #[error("handshake protocol identifier mismatch")]
    HandshakeProtocolMismatch,

    #[error("handshake info-hash mismatch")]
    HandshakeInfoHashMismatch,

    #[error("unexpected message id {0}")]
    UnexpectedMessageId(u8),

    #[error("message payload has invalid length: {0}")]
    InvalidPayloadLength(usize),

    #[error("peer sent a block we didn't request (index {0}, offset {1})")]
    UnsolicitedBlock(u32, u32),

    #[error("piece {0} failed hash verification")]
    HashMismatch(usize),

    #[error("peer is choking us")]
    Choked,

    #[error("peer closed the connection")]
    ConnectionClosed,
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;

impl From<tokio::time::error::Elapsed> for PeerError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        PeerError::Timeout
    }
}
