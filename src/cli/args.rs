//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::protocol::CryptoPolicy;

/// CLI arguments for the torrent engine
#[derive(Debug, Parser)]
#[command(name = "rust-torrent-engine")]
#[command(about = "BitTorrent engine with DHT, MSE encryption and tracker support", long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// JSON configuration file
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Download a torrent file or magnet link
    Download(DownloadArgs),
    /// Print the metadata of a .torrent file
    Info {
        #[arg(value_name = "TORRENT_FILE")]
        torrent_file: PathBuf,
    },
    /// Ping a single DHT node
    DhtPing {
        /// host:port of the node
        #[arg(value_name = "ADDRESS")]
        address: String,
        /// Local UDP port (0 picks any)
        #[arg(long, default_value_t = 0)]
        port: u16,
    },
}

/// Options of the `download` command; unset values fall back to the config
#[derive(Debug, Clone, Args)]
pub struct DownloadArgs {
    /// Path to a .torrent file or a magnet link
    #[arg(value_name = "SOURCE")]
    pub source: String,

    /// Download directory
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Listening port for incoming connections
    #[arg(short, long)]
    pub port: Option<u16>,

    /// UDP port of the DHT node
    #[arg(long)]
    pub dht_port: Option<u16>,

    /// Connection encryption: plaintext, prefer-plaintext, prefer-encrypt or encrypt
    #[arg(long, value_name = "POLICY")]
    pub crypto: Option<CryptoPolicy>,

    /// Disable DHT peer discovery
    #[arg(long)]
    pub no_dht: bool,

    /// Disable local service discovery
    #[arg(long)]
    pub no_lsd: bool,

    /// Supplement torrents declaring fewer trackers than this
    #[arg(long)]
    pub min_trackers: Option<usize>,

    /// Tracker for the supplemental pool (repeatable)
    #[arg(long = "tracker", value_name = "URL")]
    pub tracker: Vec<String>,

    /// Only download these file indices (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub select: Vec<usize>,

    /// Maximum number of peer connections
    #[arg(short, long)]
    pub max_connections: Option<usize>,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_command() {
        let args = CliArgs::try_parse_from([
            "rust-torrent-engine",
            "download",
            "file.torrent",
            "--crypto",
            "encrypt",
            "--no-dht",
            "--tracker",
            "udp://a:1/announce",
            "--tracker",
            "http://b/announce",
            "--select",
            "0,3",
            "-v",
        ])
        .unwrap();
        assert!(args.verbose);
        assert_eq!(args.log_level(), tracing::Level::DEBUG);
        match args.command {
            Command::Download(download) => {
                assert_eq!(download.source, "file.torrent");
                assert_eq!(download.crypto, Some(CryptoPolicy::Encrypt));
                assert!(download.no_dht);
                assert!(!download.no_lsd);
                assert_eq!(download.tracker.len(), 2);
                assert_eq!(download.select, vec![0, 3]);
                assert_eq!(download.port, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_other_commands() {
        let args = CliArgs::try_parse_from(["rust-torrent-engine", "-q", "info", "a.torrent"]).unwrap();
        assert!(matches!(args.command, Command::Info { .. }));
        assert_eq!(args.log_level(), tracing::Level::ERROR);

        let args = CliArgs::try_parse_from(["rust-torrent-engine", "dht-ping", "127.0.0.1:6881"]).unwrap();
        match args.command {
            Command::DhtPing { address, port } => {
                assert_eq!(address, "127.0.0.1:6881");
                assert_eq!(port, 0);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_bad_crypto_rejected() {
        assert!(CliArgs::try_parse_from(["rust-torrent-engine", "download", "x", "--crypto", "rot13"]).is_err());
    }
}
