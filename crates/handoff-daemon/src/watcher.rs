//! The polling side's run loop.
//!
//! Checks the port on a fixed tick and, when asked to, fetches every file
//! of each delivery in a background task. Fetches never hold up the next
//! tick or a shutdown request: on shutdown the ones still running are
//! aborted and their partial downloads dropped.

use handoff_core::registry::ItemGroups;
use handoff_core::ClientPoller;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::notifier::describe;

/// Name used for file items that advertise none.
const UNNAMED: &str = "download";

/// Run checks every `interval` until `shutdown` resolves.
///
/// `delivered` carries the groups handed to the poller's notifier. With
/// `fetch` set, the files in each are downloaded into the poller's store.
pub async fn run_watch<F>(
    poller: Arc<ClientPoller>,
    mut delivered: mpsc::UnboundedReceiver<ItemGroups>,
    fetch: bool,
    interval: Duration,
    shutdown: F,
) where
    F: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut fetches = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,

            _ = ticker.tick() => {
                match poller.check().await {
                    Ok(outcome) => debug!("Check: {:?}", outcome),
                    Err(e) => warn!("Check failed: {}", e),
                }
            }

            Some(groups) = delivered.recv() => {
                if fetch {
                    let poller = Arc::clone(&poller);
                    fetches.spawn(async move { fetch_all(&poller, &groups).await });
                }
            }

            Some(joined) = fetches.join_next(), if !fetches.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("Fetch task panicked: {}", e);
                    }
                }
            }
        }
    }

    if !fetches.is_empty() {
        info!("Abandoning {} download(s) in progress", fetches.len());
    }
    fetches.shutdown().await;
}

/// Fetch every file item of a delivery into the poller's store.
pub async fn fetch_all(poller: &ClientPoller, groups: &ItemGroups) {
    for item in groups.iter().filter(|item| item.is_file()) {
        let (Some(locator), Some(size)) = (item.locator.as_deref(), item.size) else {
            warn!("Skipping {}: no locator or size advertised", describe(item));
            continue;
        };
        let name = item.name.as_deref().unwrap_or(UNNAMED);

        if let Err(e) = poller.fetch_file(locator, size, name).await {
            warn!("Failed to fetch {}: {}", name, e);
        }
    }
}
