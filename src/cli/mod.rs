//! CLI module
//!
//! Command-line arguments, engine configuration and the progress line.

pub mod args;
pub mod config;
pub mod progress;

pub use args::{CliArgs, Command, DownloadArgs};
pub use config::{Config, DhtConfig, PeerConfig, StorageConfig, TrackerConfig};
pub use progress::{ProgressDisplay, ProgressSnapshot};
