//! rust-torrent-engine - Main entry point
//!
//! Parses the command line, sets up logging and dispatches to the
//! `download`, `info` and `dht-ping` commands.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use rust_torrent_engine::cli::progress::format_bytes;
use rust_torrent_engine::cli::{DhtConfig, DownloadArgs};
use rust_torrent_engine::dht::resolve_bootstrap_nodes;
use rust_torrent_engine::{
    CliArgs, Command, Config, DhtNode, Downloader, ProgressDisplay, TorrentError, TorrentInfo, TorrentParser,
    TorrentSource,
};
use tracing::{debug, error, info};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at an unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    debug!("CLI arguments: {:?}", args);

    let result = match &args.command {
        Command::Download(download) => run_download(&args, download).await,
        Command::Info { torrent_file } => show_info(torrent_file),
        Command::DhtPing { address, port } => dht_ping(address, *port).await,
    };
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

/// Initialize logging based on verbosity
fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.verbose {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
    debug!("Logging initialized at {}", args.log_level());
}

fn load_config(args: &CliArgs, download: &DownloadArgs) -> Result<Config> {
    let base = match &args.config {
        Some(path) => Some(
            Config::from_file(path).with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        ),
        None => None,
    };
    let config = Config::from_args(download, base);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run_download(args: &CliArgs, download: &DownloadArgs) -> Result<()> {
    let config = load_config(args, download)?;
    let source = TorrentSource::load(&download.source).context("Failed to load torrent")?;

    if let TorrentSource::Metainfo { info, .. } = &source {
        if !args.quiet {
            print_info(info);
        }
    }
    info!("Saving to {}", config.storage.output_dir.display());

    let downloader = Downloader::new(config).context("Failed to start downloader")?;
    let mut updates = downloader.subscribe();
    let mut progress = ProgressDisplay::new(args.quiet);
    let display = tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow_and_update().clone();
            if let Err(e) = progress.update(&snapshot) {
                debug!("Progress line not written: {}", e);
            }
        }
        progress
    });

    let summary = downloader.run(source).await.context("Download failed")?;
    drop(downloader);
    let progress = display.await.context("Progress task failed")?;

    if summary.complete {
        progress.print_complete(&summary)?;
    } else {
        println!();
        println!(
            "Stopped with {} of {} left",
            format_bytes(summary.left),
            format_bytes(summary.wanted)
        );
    }
    Ok(())
}

fn print_info(info: &TorrentInfo) {
    println!("Torrent Information:");
    println!("  Name: {}", info.name);
    println!("  Size: {} ({})", info.total_size(), format_bytes(info.total_size()));
    println!("  Pieces: {}", info.piece_count());
    println!("  Piece length: {}", format_bytes(info.piece_length));
    println!("  Info hash: {}", info.info_hash_hex());
    println!("  Private: {}", if info.private { "yes" } else { "no" });
    if info.is_multi_file() {
        println!("  Files:");
        for (index, file) in info.files().iter().enumerate().filter(|(_, f)| !f.is_padding()) {
            println!("    [{}] {} ({})", index, file.path.join("/"), format_bytes(file.length));
        }
    }
    let trackers = info.trackers();
    if !trackers.is_empty() {
        println!("  Trackers:");
        for url in trackers {
            println!("    {}", url);
        }
    }
    println!();
}

fn show_info(path: &Path) -> Result<()> {
    let info = TorrentParser::parse_file(path).with_context(|| format!("Failed to parse {}", path.display()))?;
    print_info(&info);
    Ok(())
}

async fn dht_ping(address: &str, port: u16) -> Result<()> {
    let target = resolve_bootstrap_nodes(&[address.to_string()])
        .await
        .into_iter()
        .next()
        .ok_or_else(|| TorrentError::network_error_with_address("Could not resolve DHT node", address))?;

    let config = DhtConfig {
        port,
        ..DhtConfig::default()
    };
    let node = DhtNode::bind(SocketAddr::from(([0, 0, 0, 0], port)), config)
        .await
        .context("Failed to bind DHT socket")?;
    node.start();

    let reply = node.ping(target).await;
    node.stop();
    match reply {
        Some(session) => {
            println!("{} answered as node {}", target, session.id.to_hex());
            Ok(())
        }
        None => Err(TorrentError::dht_error_with_node("No reply to ping", target.to_string()).into()),
    }
}
