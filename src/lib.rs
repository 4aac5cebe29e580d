//! Library root for rstorrent.
//!
//! Re-exports the core modules: bencode codec, metainfo loader, tracker
//! client, peer protocol engine, download coordinator, and runtime
//! configuration, for use by the CLI binary and its tests.
pub mod bencode;
pub mod cli;
pub mod config;
pub mod download;
pub mod metainfo;
pub mod peer;
pub mod tracker;
