//! Download coordinator (spec §4.5): fetches a single piece from one
//! peer, or drives the whole file by handing out pieces from a shared
//! queue to a pool of concurrently-connected peers.
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddrV4;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use crate::config::Config;
use crate::metainfo::Metainfo;
use crate::peer::{PeerError, PeerResult, PeerSession};
use crate::tracker::PeerAddr;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("no peers available")]
    NoPeersAvailable,

    #[error("piece {0} exhausted its retry budget")]
    PieceExhausted(usize),

    #[error(transparent)]
    Peer(#[from] PeerError),
}

pub type DownloadResult<T> = std::result::Result<T, DownloadError>;

/// Downloads and hash-verifies a single piece, trying each peer in order
/// until one succeeds (spec §6, `download_piece` command).
///
/// # Arguments
/// * `peers` - candidates to try, in order; the first to complete a
///   handshake, unchoke, and deliver a verified piece wins.
/// * `index` - the piece index to fetch.
///
/// # Returns
/// The verified piece bytes, or the last peer's error (wrapped as
/// [`DownloadError::Peer`]) if every peer failed, or
/// [`DownloadError::NoPeersAvailable`] if `peers` is empty.
#[instrument(skip(metainfo, peers, config), fields(index = index))]
pub async fn download_piece(
    metainfo: &Metainfo,
    peers: &[PeerAddr],
    local_peer_id: [u8; 20],
    index: usize,
    config: &Config,
) -> DownloadResult<Vec<u8>> {
    if peers.is_empty() {
        return Err(DownloadError::NoPeersAvailable);
    }
    let piece_len = metainfo.piece_size(index) as u32;
    let expected_hash = metainfo.piece_hashes[index];

    let mut last_err = None;
    for peer in peers {
        match fetch_from_peer(
            peer.socket_addr(),
            metainfo.info_hash,
            local_peer_id,
            metainfo.piece_count(),
            index as u32,
            piece_len,
            expected_hash,
            config,
        )
        .await
        {
            Ok(piece) => return Ok(piece),
            Err(err) => {
                warn!(%peer, error = %err, "peer failed to deliver piece");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.map(DownloadError::Peer).unwrap_or(DownloadError::NoPeersAvailable))
}

async fn fetch_from_peer(
    addr: SocketAddrV4,
    info_hash: [u8; 20],
    local_peer_id: [u8; 20],
    piece_count: usize,
    index: u32,
    piece_len: u32,
    expected_hash: [u8; 20],
    config: &Config,
) -> PeerResult<Vec<u8>> {
    let mut session = PeerSession::connect(addr, info_hash, local_peer_id, piece_count, config).await?;
    session.ready_to_unchoked(config).await?;
    let piece = session.download_piece(index, piece_len, expected_hash, config).await;
    session.close().await;
    piece
}

/// Downloads and hash-verifies every piece of the torrent, assembling
/// the complete file in memory.
///
/// One tokio task is spawned per peer; all tasks pull from a shared
/// piece-index queue and write their completed piece directly into its
/// slot in a pre-allocated output buffer (disjoint `[index * piece_length,
/// ...)` ranges, so no task ever contends with another over the same
/// bytes). A piece whose peer fails is returned to the queue, up to
/// `config.piece_retry_budget` attempts (default: one per known peer).
#[instrument(skip(metainfo, peers, config))]
pub async fn download(
    metainfo: &Metainfo,
    peers: &[PeerAddr],
    local_peer_id: [u8; 20],
    config: &Config,
) -> DownloadResult<Vec<u8>> {
    if peers.is_empty() {
        return Err(DownloadError::NoPeersAvailable);
    }

    let piece_count = metainfo.piece_count();
    let retry_budget = config.piece_retry_budget.unwrap_or(peers.len().max(1));

    let queue = Arc::new(Mutex::new((0..piece_count).collect::<VecDeque<usize>>()));
    let attempts: Arc<Mutex<HashMap<usize, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let buffer = Arc::new(Mutex::new(vec![0u8; metainfo.length as usize]));
    let failed = Arc::new(Mutex::new(Vec::<usize>::new()));

    let mut workers = Vec::with_capacity(peers.len());
    for peer in peers {
        let addr = peer.socket_addr();
        let info_hash = metainfo.info_hash;
        let piece_lengths: Vec<(u32, [u8; 20])> = (0..piece_count)
            .map(|i| (metainfo.piece_size(i) as u32, metainfo.piece_hashes[i]))
            .collect();
        let piece_length = metainfo.piece_length;
        let queue = Arc::clone(&queue);
        let attempts = Arc::clone(&attempts);
        let buffer = Arc::clone(&buffer);
        let failed = Arc::clone(&failed);
        let config = config.clone();

        workers.push(tokio::spawn(async move {
            let mut session = match PeerSession::connect(addr, info_hash, local_peer_id, piece_count, &config).await {
                Ok(s) => s,
                Err(err) => {
                    warn!(%addr, error = %err, "could not connect to peer");
                    return;
                }
            };
            if let Err(err) = session.ready_to_unchoked(&config).await {
                warn!(%addr, error = %err, "peer never unchoked");
                return;
            }

            loop {
                let index = {
                    let mut queue = queue.lock().await;
                    match queue.pop_front() {
                        Some(i) => i,
                        None => break,
                    }
                };
                let (piece_len, expected_hash) = piece_lengths[index];

                match session.download_piece(index as u32, piece_len, expected_hash, &config).await {
                    Ok(piece) => {
                        let offset = index * piece_length as usize;
                        let mut buffer = buffer.lock().await;
                        buffer[offset..offset + piece.len()].copy_from_slice(&piece);
                    }
                    Err(err) => {
                        warn!(%addr, index, error = %err, "piece attempt failed, requeuing");
                        let mut attempts = attempts.lock().await;
                        let count = attempts.entry(index).or_insert(0);
                        *count += 1;
                        if *count >= retry_budget {
                            failed.lock().await.push(index);
                        } else {
                            queue.lock().await.push_back(index);
                        }
                        break;
                    }
                }
            }
            session.close().await;
        }));
    }

    for worker in workers {
        let _ = worker.await;
    }

    if let Some(index) = failed.lock().await.first() {
        return Err(DownloadError::PieceExhausted(*index));
    }
    if !queue.lock().await.is_empty() {
        // Every worker exited (peers disconnected or errored) before the
        // queue drained and no piece exhausted its retry budget outright;
        // report the next undone piece so the caller knows where it stalled.
        let index = queue.lock().await.pop_front().unwrap();
        return Err(DownloadError::PieceExhausted(index));
    }

    let buffer = Arc::try_unwrap(buffer)
        .unwrap_or_else(|_| unreachable!("all worker tasks have joined, no other Arc clone remains"))
        .into_inner();
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::time::Duration as StdDuration;

    use sha1::{Digest, Sha1};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use crate::peer::handshake::Handshake;
    use crate::peer::message::Message;
    use crate::peer::BLOCK_SIZE;

    fn as_v4(addr: SocketAddr) -> SocketAddrV4 {
        match addr {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => panic!("expected a loopback v4 address"),
        }
    }

    /// Simulates a cooperative peer: handshakes, advertises every piece,
    /// unchokes on request, and serves whatever blocks it's asked for
    /// against `data` until the coordinator closes the connection.
    async fn serve_full_peer(
        mut stream: TcpStream,
        info_hash: [u8; 20],
        remote_peer_id: [u8; 20],
        data: Vec<u8>,
        piece_length: u64,
    ) {
        let mut buf = [0u8; 68];
        if stream.read_exact(&mut buf).await.is_err() {
            return;
        }
        let Ok(theirs) = Handshake::parse(&buf) else { return };
        assert_eq!(theirs.info_hash, info_hash);
        if stream
            .write_all(&Handshake::new(info_hash, remote_peer_id).serialize())
            .await
            .is_err()
        {
            return;
        }

        let piece_count = (data.len() as u64).div_ceil(piece_length).max(1);
        let bitfield_len = (piece_count as usize).div_ceil(8);
        let _ = Message::Bitfield(vec![0xffu8; bitfield_len])
            .write(&mut stream, StdDuration::from_secs(5))
            .await;

        loop {
            match Message::read(&mut stream, StdDuration::from_secs(5)).await {
                Ok(Message::Interested) => {
                    if Message::Unchoke.write(&mut stream, StdDuration::from_secs(5)).await.is_err() {
                        return;
                    }
                }
                Ok(Message::Request { index, begin, length }) => {
                    let start = index as u64 * piece_length + begin as u64;
                    let end = start + length as u64;
                    let block = data[start as usize..end as usize].to_vec();
                    if Message::Piece { index, begin, block }
                        .write(&mut stream, StdDuration::from_secs(5))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(_) => {}
                Err(_) => return,
            }
        }
    }

    /// Full download against a multi-peer swarm completes even when one
    /// peer disconnects right after the handshake and never serves a
    /// single block (spec §8's swarm-with-a-disconnecting-peer scenario).
    #[tokio::test]
    async fn full_download_completes_despite_one_peer_disconnecting() {
        let piece_length: u64 = BLOCK_SIZE as u64;
        let piece_count = 4usize;
        let length = piece_length * piece_count as u64;
        let file_data: Vec<u8> = (0..length).map(|i| (i % 256) as u8).collect();

        let piece_hashes = (0..piece_count)
            .map(|i| {
                let start = i * piece_length as usize;
                let end = start + piece_length as usize;
                let mut hasher = Sha1::new();
                hasher.update(&file_data[start..end]);
                let digest = hasher.finalize();
                let mut hash = [0u8; 20];
                hash.copy_from_slice(&digest);
                hash
            })
            .collect();

        let info_hash = [9u8; 20];
        let metainfo = Metainfo {
            announce: "http://tracker.local".into(),
            name: "file.bin".into(),
            length,
            piece_length,
            piece_hashes,
            info_hash,
        };

        let good_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let good_addr = as_v4(good_listener.local_addr().unwrap());
        let good_data = file_data.clone();
        let good_server = tokio::spawn(async move {
            let (stream, _) = good_listener.accept().await.unwrap();
            serve_full_peer(stream, info_hash, [4u8; 20], good_data, piece_length).await;
        });

        // Handshakes successfully, then disconnects before ever unchoking;
        // its worker must give up without blocking the other peer.
        let flaky_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let flaky_addr = as_v4(flaky_listener.local_addr().unwrap());
        let flaky_server = tokio::spawn(async move {
            let (mut stream, _) = flaky_listener.accept().await.unwrap();
            let mut buf = [0u8; 68];
            stream.read_exact(&mut buf).await.unwrap();
            stream
                .write_all(&Handshake::new(info_hash, [3u8; 20]).serialize())
                .await
                .unwrap();
            drop(stream);
        });

        let peers = vec![
            PeerAddr { ip: *good_addr.ip(), port: good_addr.port() },
            PeerAddr { ip: *flaky_addr.ip(), port: flaky_addr.port() },
        ];
        let config = Config::default();
        let result = download(&metainfo, &peers, [1u8; 20], &config).await.unwrap();
        assert_eq!(result, file_data);

        good_server.await.unwrap();
        flaky_server.await.unwrap();
    }

    /// `download_piece` tries the next peer in the list when the first
    /// one fails to deliver a verifiable piece (spec §4.5 step 2-4).
    #[tokio::test]
    async fn download_piece_falls_back_to_the_next_peer_on_hash_mismatch() {
        let piece_length: u64 = BLOCK_SIZE as u64;
        let real_data = vec![0x42u8; piece_length as usize];
        let mut hasher = Sha1::new();
        hasher.update(&real_data);
        let digest = hasher.finalize();
        let mut expected_hash = [0u8; 20];
        expected_hash.copy_from_slice(&digest);

        let info_hash = [5u8; 20];
        let metainfo = Metainfo {
            announce: "http://tracker.local".into(),
            name: "file.bin".into(),
            length: piece_length,
            piece_length,
            piece_hashes: vec![expected_hash],
            info_hash,
        };

        // First peer serves tampered data that fails hash verification.
        let bad_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let bad_addr = as_v4(bad_listener.local_addr().unwrap());
        let bad_server = tokio::spawn(async move {
            let (stream, _) = bad_listener.accept().await.unwrap();
            let tampered = vec![0xffu8; piece_length as usize];
            serve_full_peer(stream, info_hash, [6u8; 20], tampered, piece_length).await;
        });

        // Second peer serves the correct data.
        let good_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let good_addr = as_v4(good_listener.local_addr().unwrap());
        let good_data = real_data.clone();
        let good_server = tokio::spawn(async move {
            let (stream, _) = good_listener.accept().await.unwrap();
            serve_full_peer(stream, info_hash, [7u8; 20], good_data, piece_length).await;
        });

        let peers = vec![
            PeerAddr { ip: *bad_addr.ip(), port: bad_addr.port() },
            PeerAddr { ip: *good_addr.ip(), port: good_addr.port() },
        ];
        let config = Config::default();
        let piece = download_piece(&metainfo, &peers, [1u8; 20], 0, &config)
            .await
            .unwrap();
        assert_eq!(piece, real_data);

        bad_server.await.unwrap();
        good_server.await.unwrap();
    }

    #[tokio::test]
    async fn download_piece_without_peers_is_rejected() {
        let metainfo = Metainfo {
            announce: "http://tracker.local".into(),
            name: "file.bin".into(),
            length: 16384,
            piece_length: 16384,
            piece_hashes: vec![[0u8; 20]],
            info_hash: [0u8; 20],
        };
        let config = Config::default();
        let result = download_piece(&metainfo, &[], [0u8; 20], 0, &config).await;
        assert!(matches!(result, Err(DownloadError::NoPeersAvailable)));
    }

    #[tokio::test]
    async fn download_without_peers_is_rejected() {
        let metainfo = Metainfo {
            announce: "http://tracker.local".into(),
            name: "file.bin".into(),
            length: 16384,
            piece_length: 16384,
            piece_hashes: vec![[0u8; 20]],
            info_hash: [0u8; 20],
        };
        let config = Config::default();
        let result = download(&metainfo, &[], [0u8; 20], &config).await;
        assert!(matches!(result, Err(DownloadError::NoPeersAvailable)));
    }
}
