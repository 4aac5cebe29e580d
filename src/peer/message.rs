//! Peer-wire message framing (spec §4.4): a 4-byte big-endian length
//! prefix followed by that many payload bytes; length 0 is keep-alive,
//! otherwise the first payload byte is the message id.
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{PeerError, PeerResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    /// Serializes to the length-prefixed wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::KeepAlive => buf.extend_from_slice(&0u32.to_be_bytes()),
            Message::Choke => encode_fixed(&mut buf, 0, &[]),
            Message::Unchoke => encode_fixed(&mut buf, 1, &[]),
            Message::Interested => encode_fixed(&mut buf, 2, &[]),
            Message::NotInterested => encode_fixed(&mut buf, 3, &[]),
            Message::Have(index) => encode_fixed(&mut buf, 4, &index.to_be_bytes()),
            Message::Bitfield(bits) => encode_fixed(&mut buf, 5, bits),
            Message::Request { index, begin, length } => {
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
                encode_fixed(&mut buf, 6, &payload);
            }
            Message::Piece { index, begin, block } => {
                let mut payload = Vec::with_capacity(8 + block.len());
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
                encode_fixed(&mut buf, 7, &payload);
            }
            Message::Cancel { index, begin, length } => {
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
                encode_fixed(&mut buf, 8, &payload);
            }
        }
        buf
    }

    /// Parses a message from its payload (the bytes after the 4-byte
    /// length prefix); an empty payload is keep-alive.
    pub fn decode(payload: &[u8]) -> PeerResult<Message> {
        if payload.is_empty() {
            return Ok(Message::KeepAlive);
        }
        let id = payload[0];
        let rest = &payload[1..];
        match id {
            0 => Ok(Message::Choke),
            1 => Ok(Message::Unchoke),
            2 => Ok(Message::Interested),
            3 => Ok(Message::NotInterested),
            4 => {
                if rest.len() != 4 {
                    return Err(PeerError::InvalidPayloadLength(payload.len()));
                }
                Ok(Message::Have(u32::from_be_bytes(rest.try_into().unwrap())))
            }
            5 => Ok(Message::Bitfield(rest.to_vec())),
            6 | 8 => {
                if rest.len() != 12 {
                    return Err(PeerError::InvalidPayloadLength(payload.len()));
                }
                let index = u32::from_be_bytes(rest[0..4].try_into().unwrap());
                let begin = u32::from_be_bytes(rest[4..8].try_into().unwrap());
                let length = u32::from_be_bytes(rest[8..12].try_into().unwrap());
                Ok(if id == 6 {
                    Message::Request { index, begin, length }
                } else {
                    Message::Cancel { index, begin, length }
                })
            }
            7 => {
                if rest.len() < 8 {
                    return Err(PeerError::InvalidPayloadLength(payload.len()));
                }
                let index = u32::from_be_bytes(rest[0..4].try_into().unwrap());
                let begin = u32::from_be_bytes(rest[4..8].try_into().unwrap());
                Ok(Message::Piece {
                    index,
                    begin,
                    block: rest[8..].to_vec(),
                })
            }
            other => Err(PeerError::UnexpectedMessageId(other)),
        }
    }

    /// Reads one framed message from `stream`, bounded by `idle_timeout`.
    pub async fn read(stream: &mut TcpStream, idle_timeout: Duration) -> PeerResult<Message> {
        let mut len_buf = [0u8; 4];
        timeout(idle_timeout, stream.read_exact(&mut len_buf)).await??;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Ok(Message::KeepAlive);
        }
        let mut payload = vec![0u8; len];
        timeout(idle_timeout, stream.read_exact(&mut payload)).await??;
        Message::decode(&payload)
    }

    /// Writes this message to `stream`.
    pub async fn write(&self, stream: &mut TcpStream, idle_timeout: Duration) -> PeerResult<()> {
        timeout(idle_timeout, stream.write_all(&self.encode())).await??;
        Ok(())
    }
}

fn encode_fixed(buf: &mut Vec<u8>, id: u8, payload: &[u8]) {
    let len = 1 + payload.len() as u32;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.push(id);
    buf.extend_from_slice(payload);
}
