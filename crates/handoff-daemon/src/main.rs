//! handoff: share files and text between two local profiles.
//!
//! Uses handoff-core with the native filesystem adapters. `share` runs the
//! listening side; `watch`, `list` and `fetch` are the polling side.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use handoff_daemon::config::{Args, Command};
use handoff_daemon::notifier::{describe, LogNotifier};
use handoff_daemon::watcher::run_watch;
use handoff_daemon::{DownloadDir, FileWatermark, NativeFiles};

use handoff_core::watermark::{MemoryWatermark, WatermarkStore};
use handoff_core::{ClientPoller, HandoffConfig, SharingStatus, TransportListener};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = args.handoff_config()?;
    debug!(
        "Port {}, encryption {}",
        config.port,
        if config.encryption_enabled() { "on" } else { "off" }
    );

    match args.command {
        Command::Share { files, texts } => share(config, files, texts).await,
        Command::Watch {
            state,
            download_dir,
            interval_ms,
        } => watch(config, state, download_dir, interval_ms).await,
        Command::List { since } => {
            let poller = one_shot_poller(&config, PathBuf::from("."));
            let items = poller.list_since(since).await?;
            println!("{}", serde_json::to_string_pretty(&items)?);
            Ok(())
        }
        Command::Fetch {
            locator,
            size,
            name,
            download_dir,
        } => {
            let poller = one_shot_poller(&config, download_dir);
            let bytes = poller.fetch_file(&locator, size, &name).await?;
            info!("Fetched {} bytes", bytes);
            Ok(())
        }
    }
}

async fn share(config: HandoffConfig, files: Vec<PathBuf>, texts: Vec<String>) -> Result<()> {
    if files.is_empty() && texts.is_empty() {
        bail!("Nothing to share: pass --file and/or --text");
    }

    let listener = TransportListener::new(config, Arc::new(NativeFiles::new()));

    for path in files {
        let absolute = tokio::fs::canonicalize(&path)
            .await
            .with_context(|| format!("Cannot resolve {:?}", path))?;
        let item = listener.share_file(&absolute.to_string_lossy()).await?;
        info!("Offering {}", describe(&item));
    }
    for text in texts {
        let item = listener.share_text(&text).await?;
        info!("Offering {}", describe(&item));
    }

    info!("Sharing {} item(s). Press Ctrl+C to stop.", listener.registry().len());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        _ = listener.closed() => {
            info!("Another instance took over the port");
        }
    }

    listener.stop().await;
    info!("Shutting down");
    Ok(())
}

async fn watch(
    config: HandoffConfig,
    state: Option<PathBuf>,
    download_dir: Option<PathBuf>,
    interval_ms: u64,
) -> Result<()> {
    let watermark: Arc<dyn WatermarkStore> = match state {
        Some(path) => {
            info!("Watermark file: {:?}", path);
            Arc::new(FileWatermark::new(path))
        }
        None => Arc::new(MemoryWatermark::default()),
    };

    let (notifier, delivered) = LogNotifier::forwarding();
    let store = DownloadDir::new(download_dir.clone().unwrap_or_else(|| PathBuf::from(".")));
    let poller = Arc::new(ClientPoller::new(
        &config,
        SharingStatus::new(),
        watermark,
        Arc::new(notifier),
        Arc::new(store),
    ));

    info!("Watching port {}. Press Ctrl+C to stop.", config.port);

    run_watch(
        poller,
        delivered,
        download_dir.is_some(),
        Duration::from_millis(interval_ms),
        async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
            }
        },
    )
    .await;

    info!("Shutting down");
    Ok(())
}

/// Poller for a single request; nothing is persisted.
fn one_shot_poller(config: &HandoffConfig, download_dir: PathBuf) -> ClientPoller {
    ClientPoller::new(
        config,
        SharingStatus::new(),
        Arc::new(MemoryWatermark::default()),
        Arc::new(LogNotifier::new()),
        Arc::new(DownloadDir::new(download_dir)),
    )
}
