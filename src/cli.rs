//! Command-line dispatcher (spec §6): six subcommands covering the
//! bencode codec, metainfo inspection, tracker queries, the peer
//! handshake, and single-piece/whole-file downloads.
use std::fs;
use std::net::SocketAddrV4;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value as Json;
use tracing::info;

use crate::bencode::{self, BencodeValue};
use crate::config::Config;
use crate::download;
use crate::metainfo::Metainfo;
use crate::peer::handshake::Handshake;
use crate::tracker;

#[derive(Debug, Parser)]
#[command(name = "rstorrent", about = "A minimal BitTorrent client")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Decode a bencoded value and print it as JSON.
    Decode { value: String },
    /// Print a metainfo file's tracker URL, length, info hash, and piece hashes.
    Info { path: PathBuf },
    /// Query the tracker and print the peers it returns.
    Peers { path: PathBuf },
    /// Perform the peer handshake and print the remote peer id.
    Handshake { path: PathBuf, peer_addr: SocketAddrV4 },
    /// Download a single piece and write it to a file.
    DownloadPiece {
        #[arg(short, long)]
        output: PathBuf,
        path: PathBuf,
        piece_index: usize,
    },
    /// Download the whole file.
    Download {
        #[arg(short, long)]
        output: PathBuf,
        path: PathBuf,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Decode { value } => decode(&value),
        Command::Info { path } => info_cmd(&path),
        Command::Peers { path } => peers(&path).await,
        Command::Handshake { path, peer_addr } => handshake(&path, peer_addr).await,
        Command::DownloadPiece { output, path, piece_index } => {
            download_piece(&path, piece_index, &output).await
        }
        Command::Download { output, path } => download_cmd(&path, &output).await,
    }
}

fn decode(value: &str) -> Result<()> {
    let decoded = bencode::decode(value.as_bytes()).context("decoding bencoded value")?;
    println!("{}", bencode_to_json(&decoded));
    Ok(())
}

/// Renders a decoded value as JSON text (spec §6: integers as numbers,
/// byte strings as UTF-8 with lossy replacement, lists/dicts recursively).
fn bencode_to_json(value: &BencodeValue) -> Json {
    match value {
        BencodeValue::Integer(i) => Json::from(*i),
        BencodeValue::String(bytes) => Json::String(String::from_utf8_lossy(bytes).into_owned()),
        BencodeValue::List(items) => Json::Array(items.iter().map(bencode_to_json).collect()),
        BencodeValue::Dict(entries) => {
            let map = entries
                .iter()
                .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), bencode_to_json(v)))
                .collect();
            Json::Object(map)
        }
    }
}

fn load_metainfo(path: &PathBuf) -> Result<Metainfo> {
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Metainfo::load(&data).context("parsing metainfo")
}

fn info_cmd(path: &PathBuf) -> Result<()> {
    let metainfo = load_metainfo(path)?;
    println!("Tracker URL: {}", metainfo.announce);
    println!("Length: {}", metainfo.length);
    println!("Info Hash: {}", hex::encode(metainfo.info_hash));
    println!("Piece Length: {}", metainfo.piece_length);
    println!("Piece Hashes:");
    for hash in &metainfo.piece_hashes {
        println!("{}", hex::encode(hash));
    }
    Ok(())
}

async fn peers(path: &PathBuf) -> Result<()> {
    let metainfo = load_metainfo(path)?;
    let client = tracker::Client::new(6881);
    let peers = client.announce(&metainfo).await.context("announcing to tracker")?;
    for peer in peers {
        println!("{peer}");
    }
    Ok(())
}

async fn handshake(path: &PathBuf, peer_addr: SocketAddrV4) -> Result<()> {
    let metainfo = load_metainfo(path)?;
    let config = Config::from_env();
    let local_peer_id = tracker::Client::new(6881).peer_id();

    let mut stream = tokio::time::timeout(config.idle_timeout, tokio::net::TcpStream::connect(peer_addr))
        .await
        .context("connecting to peer timed out")??;
    let remote = Handshake::exchange(&mut stream, metainfo.info_hash, local_peer_id, config.idle_timeout)
        .await
        .context("peer handshake failed")?;
    println!("Peer ID: {}", hex::encode(remote.peer_id));
    Ok(())
}

async fn download_piece(path: &PathBuf, piece_index: usize, output: &PathBuf) -> Result<()> {
    let metainfo = load_metainfo(path)?;
    if piece_index >= metainfo.piece_count() {
        anyhow::bail!("piece index {piece_index} out of range (torrent has {} pieces)", metainfo.piece_count());
    }
    let config = Config::from_env();
    let client = tracker::Client::new(6881);
    let peer_list = client.announce(&metainfo).await.context("announcing to tracker")?;

    info!(piece_index, peers = peer_list.len(), "downloading piece");
    let piece = download::download_piece(&metainfo, &peer_list, client.peer_id(), piece_index, &config)
        .await
        .context("downloading piece")?;
    fs::write(output, &piece).with_context(|| format!("writing {}", output.display()))?;
    println!("Piece {piece_index} downloaded to {}.", output.display());
    Ok(())
}

async fn download_cmd(path: &PathBuf, output: &PathBuf) -> Result<()> {
    let metainfo = load_metainfo(path)?;
    let config = Config::from_env();
    let client = tracker::Client::new(6881);
    let peer_list = client.announce(&metainfo).await.context("announcing to tracker")?;

    info!(peers = peer_list.len(), pieces = metainfo.piece_count(), "downloading file");
    let file = download::download(&metainfo, &peer_list, client.peer_id(), &config)
        .await
        .context("downloading file")?;
    fs::write(output, &file).with_context(|| format!("writing {}", output.display()))?;
    println!("Downloaded {} to {}.", metainfo.name, output.display());
    Ok(())
}
