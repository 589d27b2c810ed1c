//! A BitTorrent client for single-file torrents.
//!
//! The pipeline runs left to right: [`bencode`] turns metainfo and tracker
//! bytes into values, [`torrent`] decomposes an info dictionary into pieces
//! and blocks and derives the infohash, [`tracker`] trades that hash for a
//! peer list over HTTP, and [`peer`] speaks the TCP wire protocol to fetch
//! and verify the data. The binary in `main.rs` is a thin `clap` front end
//! over these modules.
pub mod bencode;
pub mod peer;
pub mod torrent;
pub mod tracker;
