//! Command-line driver for rbit.
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use rbit::bencode;
use rbit::peer::{self, download::Downloader, Handshake};
use rbit::torrent::Torrent;
use rbit::tracker::{Client, TrackerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "A single-file BitTorrent client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a bencoded value and print it as JSON
    Decode {
        /// The bencoded value
        value: String,
    },
    /// Print the metainfo of a torrent file
    Info {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
    /// Ask the tracker for peers
    Peers {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
    /// Perform the handshake with one peer
    Handshake {
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Peer address as ip:port
        peer: String,
    },
    /// Download a single verified piece
    #[command(name = "download_piece")]
    DownloadPiece {
        /// Where to write the piece
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Piece index
        piece: u32,
    },
    /// Download the whole file
    Download {
        /// Where to write the file
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        /// Path to the .torrent file
        torrent: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Decode { value } => {
            let (decoded, _) = bencode::decode(value.as_bytes())?;
            println!("{}", decoded.to_json());
        }
        Command::Info { torrent } => {
            let torrent = load_torrent(&torrent)?;
            println!("Tracker URL: {}", torrent.announce);
            println!("Length: {}", torrent.info.length);
            println!("Info Hash: {}", hex::encode(torrent.info_hash));
            println!("Piece Length: {}", torrent.info.piece_length);
            println!("Piece Hashes:");
            for piece in &torrent.info.pieces {
                println!("{}", hex::encode(piece.hash));
            }
        }
        Command::Peers { torrent } => {
            let torrent = load_torrent(&torrent)?;
            let response = Client::new(TrackerConfig::default())
                .announce(&torrent)
                .await?;
            for peer in response.peers {
                println!("{peer}");
            }
        }
        Command::Handshake { torrent, peer } => {
            let torrent = load_torrent(&torrent)?;
            let addr = peer::parse_peer_addr(&peer)?;
            let mut stream = peer::connect(addr).await?;
            let remote = Handshake::perform(
                &mut stream,
                torrent.info_hash,
                TrackerConfig::default().peer_id,
            )
            .await?;
            println!("Peer ID: {}", hex::encode(remote.peer_id));
        }
        Command::DownloadPiece {
            output,
            torrent,
            piece,
        } => {
            let torrent = load_torrent(&torrent)?;
            let downloader = Downloader::new(torrent).await?;
            let data = downloader.download_piece(piece).await?;
            tokio::fs::write(&output, data).await?;
            info!(piece, output = %output.display(), "piece downloaded and verified");
        }
        Command::Download { output, torrent } => {
            let torrent = load_torrent(&torrent)?;
            let downloader = Downloader::new(torrent).await?;
            let data = downloader.download().await?;
            tokio::fs::write(&output, data).await?;
            info!(output = %output.display(), "download complete");
        }
    }

    std::io::stdout().flush()?;
    Ok(())
}

fn load_torrent(path: &Path) -> Result<Torrent> {
    let bytes = std::fs::read(path)?;
    Torrent::from_bytes(&bytes)
}
