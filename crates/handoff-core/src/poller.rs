//! Consumer side: checking for new shares and fetching files.
//!
//! A check is opportunistic. If nobody is listening there is simply nothing
//! to report. Each check asks only for items newer than the persisted
//! watermark, so an item is reported once.

use crate::channel::{self, ChannelKey, ChannelReader};
use crate::config::HandoffConfig;
use crate::files::{Download, FileStore};
use crate::item::SharedItem;
use crate::protocol::{
    connect, decode_listing, read_line, ClientRequest, CONNECT_TIMEOUT, MAX_RESPONSE_LINE,
};
use crate::registry::{group_items, ItemGroups};
use crate::status::SharingStatus;
use crate::watermark::WatermarkStore;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Minimum spacing between executed checks.
pub const CHECK_INTERVAL: Duration = Duration::from_millis(1000);

const FETCH_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("Connection failed: {0}")]
    Connect(#[source] io::Error),

    #[error("Transport error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed response: {0}")]
    Protocol(String),

    #[error("Stream ended after {received} of {expected} bytes")]
    ShortRead { expected: u64, received: u64 },

    #[error("Storage error: {0}")]
    Storage(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, PollError>;

/// Receives new items, partitioned for presentation.
#[async_trait]
pub trait ShareNotifier: Send + Sync {
    async fn notify(&self, groups: ItemGroups);
}

/// What an executed (or skipped) check did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Too soon after the previous check
    Throttled,
    /// This process is sharing; nothing to pick up from ourselves
    SelfSharing,
    /// No listener on the port
    Unreachable,
    /// Listener answered with no new items
    NothingNew,
    /// `count` new items were handed to the notifier
    Delivered { count: usize, watermark: i64 },
}

/// Coalesces bursts of triggers into one action per interval.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// Claim the slot if `interval` has passed since the last claim.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(previous) if now.saturating_duration_since(previous) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Polls the loopback listener of the other profile.
pub struct ClientPoller {
    addr: SocketAddr,
    key: Option<ChannelKey>,
    status: SharingStatus,
    watermark: Arc<dyn WatermarkStore>,
    notifier: Arc<dyn ShareNotifier>,
    store: Arc<dyn FileStore>,
    throttle: Throttle,
}

impl ClientPoller {
    /// `status` is this process's own sharing flag (see
    /// [`TransportListener::status`](crate::listener::TransportListener::status)).
    pub fn new(
        config: &HandoffConfig,
        status: SharingStatus,
        watermark: Arc<dyn WatermarkStore>,
        notifier: Arc<dyn ShareNotifier>,
        store: Arc<dyn FileStore>,
    ) -> Self {
        Self {
            addr: config.loopback_addr(),
            key: config.encryption.clone(),
            status,
            watermark,
            notifier,
            store,
            throttle: Throttle::new(CHECK_INTERVAL),
        }
    }

    pub fn watermark(&self) -> i64 {
        self.watermark.load()
    }

    /// Check for new items, at most once per [`CHECK_INTERVAL`].
    pub async fn check(&self) -> Result<CheckOutcome> {
        if !self.throttle.try_acquire() {
            return Ok(CheckOutcome::Throttled);
        }
        if self.status.is_active() {
            debug!("Skipping check while sharing from this process");
            return Ok(CheckOutcome::SelfSharing);
        }

        let since = self.watermark.load();
        let stream = match connect(self.addr, CONNECT_TIMEOUT).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("Nothing to check on {}: {}", self.addr, e);
                return Ok(CheckOutcome::Unreachable);
            }
        };

        let items = self.request_listing(stream, since).await?;
        let Some(newest) = items.iter().map(|item| item.timestamp).max() else {
            return Ok(CheckOutcome::NothingNew);
        };

        let watermark = newest.max(since);
        if let Err(e) = self.watermark.store(watermark) {
            warn!("Failed to persist watermark {}: {}", watermark, e);
        }

        let count = items.len();
        info!("Found {} new shared item(s)", count);
        self.notifier.notify(group_items(items)).await;

        Ok(CheckOutcome::Delivered { count, watermark })
    }

    /// List items newer than `since` without touching the watermark.
    pub async fn list_since(&self, since: i64) -> Result<Vec<SharedItem>> {
        let stream = connect(self.addr, CONNECT_TIMEOUT)
            .await
            .map_err(PollError::Connect)?;
        self.request_listing(stream, since).await
    }

    async fn request_listing(&self, stream: TcpStream, since: i64) -> Result<Vec<SharedItem>> {
        let (reader, mut writer) = channel::split(stream, self.key.as_ref());
        writer.write_all(&ClientRequest::list_since(since).to_line()).await?;
        writer.flush().await?;

        let mut reader = BufReader::new(reader);
        let line = read_line(&mut reader, MAX_RESPONSE_LINE)
            .await?
            .ok_or_else(|| PollError::Protocol("connection closed without a response".into()))?;

        decode_listing(&line).map_err(|e| PollError::Protocol(e.to_string()))
    }

    /// Fetch exactly `expected_size` bytes of an offered file into the store
    /// under `name`. Returns the number of bytes stored.
    ///
    /// On any failure the partial download is discarded.
    pub async fn fetch_file(&self, locator: &str, expected_size: u64, name: &str) -> Result<u64> {
        let stream = connect(self.addr, CONNECT_TIMEOUT)
            .await
            .map_err(PollError::Connect)?;
        let (reader, mut writer) = channel::split(stream, self.key.as_ref());
        writer.write_all(&ClientRequest::fetch(locator).to_line()).await?;
        writer.flush().await?;

        let mut download = self.store.create(name).await.map_err(PollError::Storage)?;
        let copied = copy_exact(reader, &mut download, expected_size).await;

        match copied {
            Ok(()) => {
                download.commit().await.map_err(PollError::Storage)?;
                info!("Fetched {} ({} bytes)", name, expected_size);
                Ok(expected_size)
            }
            Err(e) => {
                if let Err(discard_err) = download.discard().await {
                    warn!("Failed to discard partial download {}: {}", name, discard_err);
                }
                Err(e)
            }
        }
    }
}

/// Copy exactly `expected` bytes, never reading past them.
async fn copy_exact<R>(
    mut reader: ChannelReader<R>,
    download: &mut Box<dyn Download>,
    expected: u64,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; FETCH_CHUNK_SIZE];
    let mut received = 0u64;

    while received < expected {
        let want = (expected - received).min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(PollError::ShortRead { expected, received });
        }
        download
            .write_all(&buf[..n])
            .await
            .map_err(PollError::Storage)?;
        received += n as u64;
    }

    download.flush().await.map_err(PollError::Storage)
}
