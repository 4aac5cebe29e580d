//! A stateful connection to one peer (spec §4.4): handshake, choke/
//! interest tracking, and pipelined block requests assembled into a
//! hash-verified piece.
use std::collections::HashMap;
use std::net::SocketAddrV4;

use sha1::{Digest, Sha1};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::instrument;

use crate::config::Config;

use super::bitfield::Bitfield;
use super::handshake::Handshake;
use super::message::Message;
use super::{PeerError, PeerResult, BLOCK_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Handshaked,
    Ready,
    Unchoked,
    Closed,
}

/// A live TCP connection to one peer, tracking the wire-level state the
/// spec requires to be allowed to request blocks.
pub struct PeerSession {
    stream: TcpStream,
    pub addr: SocketAddrV4,
    pub remote_peer_id: [u8; 20],
    pub state: State,
    pub am_choked: bool,
    pub am_interested: bool,
    pub peer_has: Bitfield,
}

impl PeerSession {
    /// Connects, performs the handshake, and leaves the session in
    /// `Ready` (having consumed an immediately-following bitfield, if
    /// the peer sent one, per spec §4.4).
    #[instrument(skip(config), level = "debug")]
    pub async fn connect(
        addr: SocketAddrV4,
        info_hash: [u8; 20],
        local_peer_id: [u8; 20],
        piece_count: usize,
        config: &Config,
    ) -> PeerResult<Self> {
        let mut stream = timeout(config.idle_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Timeout)??;
        let remote = Handshake::exchange(&mut stream, info_hash, local_peer_id, config.idle_timeout)
            .await?;

        let mut session = PeerSession {
            stream,
            addr,
            remote_peer_id: remote.peer_id,
            state: State::Handshaked,
            am_choked: true,
            am_interested: false,
            peer_has: Bitfield::empty(piece_count),
        };
        session.state = State::Ready;
        Ok(session)
    }

    /// Sends `interested` and waits for `unchoke`, absorbing any
    /// `bitfield`/`have` messages that arrive first.
    pub async fn ready_to_unchoked(&mut self, config: &Config) -> PeerResult<()> {
        Message::Interested.write(&mut self.stream, config.idle_timeout).await?;
        self.am_interested = true;

        loop {
            match Message::read(&mut self.stream, config.idle_timeout).await? {
                Message::Unchoke => {
                    self.am_choked = false;
                    self.state = State::Unchoked;
                    return Ok(());
                }
                Message::Bitfield(bytes) => {
                    self.peer_has = Bitfield::from_payload(bytes, self.peer_has.piece_count());
                }
                Message::Have(index) => self.peer_has.set(index as usize),
                Message::Choke => self.am_choked = true,
                Message::KeepAlive => {}
                // We never seed, so requests/cancels/interest from the
                // remote side are simply ignored.
                _ => {}
            }
        }
    }

    /// Downloads and hash-verifies one piece, pipelining up to
    /// `config.pipeline_depth` concurrent block requests.
    ///
    /// Every incoming `piece` message for this index is checked against
    /// the block plan derived from `piece_len` before being accepted: a
    /// `begin` that isn't one of our offsets, or a block whose length
    /// doesn't match what was requested there, is rejected as
    /// [`PeerError::UnsolicitedBlock`] rather than silently counted
    /// towards completion. A mid-download `choke` pauses new requests
    /// until `unchoke` arrives again (spec §4.4) rather than aborting the
    /// attempt; calling this while already choked (no prior `unchoke`
    /// received) fails immediately with [`PeerError::Choked`].
    ///
    /// # Arguments
    /// * `index` - the piece index, echoed back on every `request`/`piece`.
    /// * `piece_len` - this piece's length, used to derive the block plan.
    /// * `expected_hash` - the digest the assembled piece must match.
    /// * `config` - supplies pipeline depth and socket timeouts.
    ///
    /// # Returns
    /// The verified piece bytes, or a [`PeerError`] if the peer misbehaves,
    /// times out, disconnects, or the assembled piece fails verification.
    #[instrument(skip(self, config), fields(index = index, len = piece_len))]
    pub async fn download_piece(
        &mut self,
        index: u32,
        piece_len: u32,
        expected_hash: [u8; 20],
        config: &Config,
    ) -> PeerResult<Vec<u8>> {
        if self.am_choked {
            return Err(PeerError::Choked);
        }
        let blocks = block_plan(piece_len);
        let mut received: HashMap<u32, Vec<u8>> = HashMap::new();
        let mut next_to_request = 0usize;
        let mut choked = self.am_choked;

        let deadline = config.block_timeout * (blocks.len() as u32).max(1);
        let work = async {
            while received.len() < blocks.len() {
                while !choked
                    && next_to_request < blocks.len()
                    && in_flight(&blocks, &received, next_to_request, config.pipeline_depth)
                {
                    let (begin, length) = blocks[next_to_request];
                    Message::Request { index, begin, length }
                        .write(&mut self.stream, config.idle_timeout)
                        .await?;
                    next_to_request += 1;
                }

                match Message::read(&mut self.stream, config.idle_timeout).await? {
                    Message::Piece { index: pi, begin, block } if pi == index => {
                        let expected_len = blocks.iter().find(|&&(b, _)| b == begin).map(|&(_, l)| l);
                        match expected_len {
                            Some(len) if len == block.len() as u32 => {
                                received.insert(begin, block);
                            }
                            _ => return Err(PeerError::UnsolicitedBlock(index, begin)),
                        }
                    }
                    Message::Piece { .. } => {
                        // Block for a different piece (e.g. a stale
                        // in-flight request); not ours, ignore it.
                    }
                    Message::Choke => {
                        choked = true;
                        self.am_choked = true;
                        self.state = State::Ready;
                    }
                    Message::Unchoke => {
                        choked = false;
                        self.am_choked = false;
                        self.state = State::Unchoked;
                    }
                    Message::Have(i) => self.peer_has.set(i as usize),
                    Message::Bitfield(bytes) => {
                        self.peer_has = Bitfield::from_payload(bytes, self.peer_has.piece_count());
                    }
                    Message::KeepAlive => {}
                    _ => {}
                }
            }
            Ok::<_, PeerError>(())
        };
        timeout(deadline, work).await.map_err(|_| PeerError::Timeout)??;

        let mut piece = Vec::with_capacity(piece_len as usize);
        for (begin, _) in &blocks {
            let block = received.get(begin).ok_or(PeerError::ConnectionClosed)?;
            piece.extend_from_slice(block);
        }

        let mut hasher = Sha1::new();
        hasher.update(&piece);
        let digest = hasher.finalize();
        if digest.as_slice() != expected_hash.as_slice() {
            return Err(PeerError::HashMismatch(index as usize));
        }
        Ok(piece)
    }

    pub async fn close(&mut self) {
        self.state = State::Closed;
        let _ = self.stream.shutdown().await;
    }
}

/// Whether another request may be sent: caps concurrent in-flight
/// requests at `pipeline_depth` (spec §4.4).
fn in_flight(
    blocks: &[(u32, u32)],
    received: &HashMap<u32, Vec<u8>>,
    next_to_request: usize,
    pipeline_depth: usize,
) -> bool {
    let requested = next_to_request;
    let completed = blocks[..next_to_request]
        .iter()
        .filter(|(begin, _)| received.contains_key(begin))
        .count();
    requested - completed < pipeline_depth
}

/// Splits a piece of length `piece_len` into `(offset, length)` blocks of
/// [`BLOCK_SIZE`], with a possibly shorter final block.
pub fn block_plan(piece_len: u32) -> Vec<(u32, u32)> {
    let mut blocks = Vec::new();
    let mut offset = 0;
    while offset < piece_len {
        let length = BLOCK_SIZE.min(piece_len - offset);
        blocks.push((offset, length));
        offset += length;
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::time::Duration as StdDuration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn block_plan_splits_full_blocks_plus_a_short_tail() {
        // piece_length 262144, final piece length 100000: 6 full blocks
        // of 16384 plus a short tail of 1696 bytes (spec §8).
        let blocks = block_plan(100_000);
        assert_eq!(blocks.len(), 7);
        for (offset, length) in &blocks[..6] {
            assert_eq!(*length, BLOCK_SIZE);
            assert_eq!(*offset % BLOCK_SIZE, 0);
        }
        assert_eq!(blocks[6], (6 * BLOCK_SIZE, 100_000 - 6 * BLOCK_SIZE));
        assert_eq!(blocks[6].1, 1696);
    }

    #[test]
    fn block_plan_exact_multiple_has_no_short_tail() {
        let blocks = block_plan(BLOCK_SIZE * 3);
        assert_eq!(blocks.len(), 3);
        assert!(blocks.iter().all(|(_, len)| *len == BLOCK_SIZE));
    }

    fn as_v4(addr: SocketAddr) -> SocketAddrV4 {
        match addr {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => panic!("expected a loopback v4 address"),
        }
    }

    /// Drives the full choke -> unchoke -> pipelined-request -> piece path
    /// over a real loopback socket, standing in for a remote peer (spec
    /// §8's worked block-sizing scenario, exercised end to end).
    #[tokio::test]
    async fn full_piece_download_over_loopback_succeeds() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = as_v4(listener.local_addr().unwrap());

        let info_hash = [7u8; 20];
        let local_peer_id = [1u8; 20];
        let remote_peer_id = [2u8; 20];
        // Two full blocks plus a short tail, matching the spec's block-sizing scenario.
        let piece_len = BLOCK_SIZE * 2 + 1696;
        let piece_data: Vec<u8> = (0..piece_len).map(|i| (i % 251) as u8).collect();
        let mut hasher = Sha1::new();
        hasher.update(&piece_data);
        let expected_hash: [u8; 20] = hasher.finalize().into();

        let server_data = piece_data.clone();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 68];
            stream.read_exact(&mut buf).await.unwrap();
            let theirs = Handshake::parse(&buf).unwrap();
            assert_eq!(theirs.info_hash, info_hash);
            stream
                .write_all(&Handshake::new(info_hash, remote_peer_id).serialize())
                .await
                .unwrap();

            Message::Bitfield(vec![0b1000_0000])
                .write(&mut stream, StdDuration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(
                Message::read(&mut stream, StdDuration::from_secs(5)).await.unwrap(),
                Message::Interested
            );
            Message::Unchoke.write(&mut stream, StdDuration::from_secs(5)).await.unwrap();

            let blocks = block_plan(piece_len);
            let mut served = 0;
            while served < blocks.len() {
                match Message::read(&mut stream, StdDuration::from_secs(5)).await.unwrap() {
                    Message::Request { index, begin, length } => {
                        let block = server_data[begin as usize..(begin + length) as usize].to_vec();
                        Message::Piece { index, begin, block }
                            .write(&mut stream, StdDuration::from_secs(5))
                            .await
                            .unwrap();
                        served += 1;
                    }
                    other => panic!("unexpected message from client: {other:?}"),
                }
            }
        });

        let config = Config::default();
        let mut session = PeerSession::connect(addr, info_hash, local_peer_id, 1, &config)
            .await
            .unwrap();
        assert_eq!(session.remote_peer_id, remote_peer_id);
        session.ready_to_unchoked(&config).await.unwrap();
        assert!(session.peer_has.has(0));

        let piece = session
            .download_piece(0, piece_len, expected_hash, &config)
            .await
            .unwrap();
        assert_eq!(piece, piece_data);

        server.await.unwrap();
    }

    /// A peer that disconnects partway through a piece must surface as a
    /// recoverable peer error, not hang or silently return a short piece
    /// (spec §8: hash-mismatch/failure scenarios must be reattempted
    /// elsewhere, never accepted as-is).
    #[tokio::test]
    async fn disconnect_mid_piece_is_reported_as_an_error() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = as_v4(listener.local_addr().unwrap());

        let info_hash = [8u8; 20];
        let local_peer_id = [1u8; 20];
        let remote_peer_id = [2u8; 20];
        let piece_len = BLOCK_SIZE * 2;

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 68];
            stream.read_exact(&mut buf).await.unwrap();
            Handshake::parse(&buf).unwrap();
            stream
                .write_all(&Handshake::new(info_hash, remote_peer_id).serialize())
                .await
                .unwrap();

            Message::Bitfield(vec![0b1000_0000])
                .write(&mut stream, StdDuration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(
                Message::read(&mut stream, StdDuration::from_secs(5)).await.unwrap(),
                Message::Interested
            );
            Message::Unchoke.write(&mut stream, StdDuration::from_secs(5)).await.unwrap();

            // Serve exactly one of the two requested blocks, then drop the
            // connection before the second arrives.
            match Message::read(&mut stream, StdDuration::from_secs(5)).await.unwrap() {
                Message::Request { index, begin, length } => {
                    let block = vec![0u8; length as usize];
                    Message::Piece { index, begin, block }
                        .write(&mut stream, StdDuration::from_secs(5))
                        .await
                        .unwrap();
                }
                other => panic!("unexpected message from client: {other:?}"),
            }
            drop(stream);
        });

        let config = Config::default();
        let mut session = PeerSession::connect(addr, info_hash, local_peer_id, 1, &config)
            .await
            .unwrap();
        session.ready_to_unchoked(&config).await.unwrap();

        let result = session
            .download_piece(0, piece_len, [0u8; 20], &config)
            .await;
        assert!(result.is_err());

        server.await.unwrap();
    }
}
