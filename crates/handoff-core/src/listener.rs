//! Loopback listener owning the sharing lifecycle.
//!
//! `start()` arbitrates the port, binds, and spawns an accept loop that runs
//! one [`ProtocolSession`] task per connection. The loop ends on `stop()` or
//! when a peer preempts us; either way the socket is closed, running
//! sessions are aborted, the registry is cleared and the sharing flag drops.

use crate::arbiter::{PortArbiter, PortStatus};
use crate::config::HandoffConfig;
use crate::files::FileSource;
use crate::item::SharedItem;
use crate::registry::ShareRegistry;
use crate::session::{ProtocolSession, SessionOutcome};
use crate::status::SharingStatus;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Pause after a failed accept, so fd exhaustion does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Port {port} unavailable (preemption: {status:?}): {source}")]
    Bind {
        port: u16,
        status: PortStatus,
        #[source]
        source: io::Error,
    },

    #[error("Cannot describe {locator}: {source}")]
    Describe {
        locator: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ListenerError>;

/// A started accept loop.
struct Running {
    local_addr: SocketAddr,
    shutdown: Arc<watch::Sender<bool>>,
    task: JoinHandle<()>,
}

impl Running {
    fn is_live(&self) -> bool {
        !*self.shutdown.borrow() && !self.task.is_finished()
    }
}

/// Loopback server for the sharing side.
pub struct TransportListener {
    config: HandoffConfig,
    registry: Arc<ShareRegistry>,
    files: Arc<dyn FileSource>,
    status: SharingStatus,
    arbiter: PortArbiter,
    running: Mutex<Option<Running>>,
}

impl TransportListener {
    pub fn new(config: HandoffConfig, files: Arc<dyn FileSource>) -> Self {
        let arbiter = PortArbiter::new(&config);
        Self {
            config,
            registry: Arc::new(ShareRegistry::new()),
            files,
            status: SharingStatus::new(),
            arbiter,
            running: Mutex::new(None),
        }
    }

    /// Replace the port arbiter (e.g. to shorten the grace period).
    pub fn with_arbiter(mut self, arbiter: PortArbiter) -> Self {
        self.arbiter = arbiter;
        self
    }

    pub fn registry(&self) -> &Arc<ShareRegistry> {
        &self.registry
    }

    /// Handle to the sharing flag, for pollers in this process.
    pub fn status(&self) -> SharingStatus {
        self.status.clone()
    }

    pub fn is_running(&self) -> bool {
        self.status.is_active()
    }

    /// Address bound by the current accept loop, if any.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .await
            .as_ref()
            .filter(|r| r.is_live())
            .map(|r| r.local_addr)
    }

    /// Start listening. No-op if already running.
    ///
    /// A fresh accept loop starts with an empty registry: anything left from
    /// a stopped or preempted loop is dropped.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        self.start_locked(&mut running).await
    }

    async fn start_locked(&self, running: &mut Option<Running>) -> Result<SocketAddr> {
        if let Some(current) = running.take() {
            if current.is_live() {
                let addr = current.local_addr;
                *running = Some(current);
                return Ok(addr);
            }
            // Preempted loop still winding down: let it finish its cleanup
            // before new items arrive.
            if let Err(e) = current.task.await {
                warn!("Previous accept loop ended abnormally: {}", e);
            }
        }
        self.registry.clear();

        let status = self.arbiter.ensure_available().await;
        let listener = TcpListener::bind(self.config.loopback_addr())
            .await
            .map_err(|source| ListenerError::Bind {
                port: self.config.port,
                status,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ListenerError::Bind {
            port: self.config.port,
            status,
            source,
        })?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let shutdown = Arc::new(shutdown);
        let session = Arc::new(ProtocolSession::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.files),
            self.config.encryption.clone(),
            Arc::clone(&shutdown),
        ));

        self.status.set_active(true);
        let task = tokio::spawn(accept_loop(
            listener,
            session,
            shutdown_rx,
            Arc::clone(&self.registry),
            self.status.clone(),
        ));

        info!(
            "Sharing on {} (encryption {})",
            local_addr,
            if self.config.encryption_enabled() { "on" } else { "off" }
        );

        *running = Some(Running {
            local_addr,
            shutdown,
            task,
        });
        Ok(local_addr)
    }

    /// Stop listening and drop every shared item. Idempotent.
    pub async fn stop(&self) {
        let current = self.running.lock().await.take();
        if let Some(current) = current {
            current.shutdown.send_replace(true);
            if let Err(e) = current.task.await {
                warn!("Accept loop ended abnormally: {}", e);
            }
        }
        self.registry.clear();
        self.status.set_active(false);
    }

    /// Resolves once the current accept loop has been told to shut down,
    /// whether by `stop()` or by a peer's PREEMPT. Immediate if not running.
    pub async fn closed(&self) {
        let mut rx = {
            let running = self.running.lock().await;
            match running.as_ref() {
                Some(current) => current.shutdown.subscribe(),
                None => return,
            }
        };
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Offer an item, starting the listener if needed.
    pub async fn share(&self, item: SharedItem) -> Result<SharedItem> {
        let mut running = self.running.lock().await;
        self.start_locked(&mut running).await?;
        Ok(self.registry.put(item))
    }

    /// Offer a file by locator, described through the file source.
    pub async fn share_file(&self, locator: &str) -> Result<SharedItem> {
        let descriptor = self
            .files
            .describe(locator)
            .await
            .map_err(|source| ListenerError::Describe {
                locator: locator.to_string(),
                source,
            })?;

        self.share(SharedItem::file(
            locator,
            descriptor.name,
            descriptor.size,
            descriptor.mime_type,
        ))
        .await
    }

    /// Offer a text snippet, starting the listener if needed.
    pub async fn share_text(&self, text: &str) -> Result<SharedItem> {
        self.share(SharedItem::text(text)).await
    }
}

async fn accept_loop(
    listener: TcpListener,
    session: Arc<ProtocolSession>,
    mut shutdown: watch::Receiver<bool>,
    registry: Arc<ShareRegistry>,
    status: SharingStatus,
) {
    let mut sessions = JoinSet::new();

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {}", peer);
                    let session = Arc::clone(&session);
                    sessions.spawn(async move {
                        match session.serve(stream).await {
                            Ok(outcome) => log_outcome(peer, outcome),
                            Err(e) => warn!("Session with {} failed: {}", peer, e),
                        }
                    });
                }
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("Session task panicked: {}", e);
                    }
                }
            }
        }
    }

    drop(listener);
    sessions.shutdown().await;
    registry.clear();
    status.set_active(false);
    info!("Stopped sharing");
}

fn log_outcome(peer: SocketAddr, outcome: SessionOutcome) {
    match outcome {
        SessionOutcome::Listed { count } => debug!("Listed {} item(s) for {}", count, peer),
        SessionOutcome::Streamed { bytes } => debug!("Streamed {} bytes to {}", bytes, peer),
        SessionOutcome::Denied => debug!("Denied fetch from {}", peer),
        SessionOutcome::Preempted => debug!("Preempted by {}", peer),
        SessionOutcome::Rejected => debug!("Rejected request from {}", peer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::PREEMPT_GRACE;
    use crate::files::MemoryFiles;
    use crate::protocol::{decode_listing, ClientRequest};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    fn listener(port: u16) -> TransportListener {
        TransportListener::new(HandoffConfig::new(port), Arc::new(MemoryFiles::new()))
    }

    async fn list_since(addr: SocketAddr, since: i64) -> Vec<SharedItem> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(&ClientRequest::list_since(since).to_line())
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        decode_listing(&response).unwrap()
    }

    async fn wait_inactive(status: &SharingStatus) {
        timeout(Duration::from_secs(2), async {
            while status.is_active() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Sharing flag should drop");
    }

    #[tokio::test]
    async fn test_start_sets_flag_and_stop_clears_everything() {
        let listener = listener(0);
        let status = listener.status();
        assert!(!status.is_active());

        listener.share_text("hello").await.unwrap();
        assert!(status.is_active());
        assert!(listener.local_addr().await.is_some());

        listener.stop().await;
        assert!(!status.is_active());
        assert!(listener.registry().is_empty());
        assert!(listener.local_addr().await.is_none());

        // Idempotent
        listener.stop().await;
        assert!(!status.is_active());
    }

    #[tokio::test]
    async fn test_start_twice_keeps_same_address() {
        let listener = listener(0);
        let first = listener.start().await.unwrap();
        let second = listener.start().await.unwrap();
        assert_eq!(first, second);
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_share_file_requires_describable_locator() {
        let listener = listener(0);
        let err = listener.share_file("/nope").await.unwrap_err();
        assert!(matches!(err, ListenerError::Describe { .. }));
    }

    #[tokio::test]
    async fn test_closed_resolves_after_stop() {
        let listener = Arc::new(listener(0));
        listener.start().await.unwrap();

        let waiter = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.closed().await })
        };

        listener.stop().await;
        tokio::time::timeout(PREEMPT_GRACE, waiter)
            .await
            .expect("closed() should resolve after stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_restart_after_preempt_drops_stale_items() {
        let listener = listener(0);
        let status = listener.status();
        let addr = listener.start().await.unwrap();

        let mut peer = TcpStream::connect(addr).await.unwrap();
        peer.write_all(&ClientRequest::preempt().to_line()).await.unwrap();
        peer.shutdown().await.unwrap();

        timeout(Duration::from_secs(2), listener.closed())
            .await
            .expect("PREEMPT should close the listener");
        wait_inactive(&status).await;

        // Inserted behind the listener's back while nothing is serving.
        listener.registry().put_text("stale");

        let addr = listener.start().await.unwrap();
        assert!(status.is_active());
        assert!(listener.registry().is_empty());
        assert!(list_since(addr, 0).await.is_empty());

        let fresh = listener.share_text("fresh").await.unwrap();
        assert_eq!(list_since(addr, 0).await, vec![fresh]);

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_idle_connection_does_not_block_others() {
        let listener = listener(0);
        listener.share_text("x").await.unwrap();
        let addr = listener.local_addr().await.unwrap();

        let mut idle = TcpStream::connect(addr).await.unwrap();
        idle.write_all(b"{\"action\":").await.unwrap();

        let items = timeout(Duration::from_secs(2), list_since(addr, 0))
            .await
            .expect("LIST_SINCE should not wait on the idle connection");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].text.as_deref(), Some("x"));

        timeout(Duration::from_secs(2), listener.stop())
            .await
            .expect("stop() should not wait on the idle connection");

        let mut buf = [0u8; 16];
        let read = timeout(Duration::from_secs(2), idle.read(&mut buf))
            .await
            .expect("Idle connection should be closed by stop()");
        // A reset counts as closed too.
        if let Ok(n) = read {
            assert_eq!(n, 0, "Idle connection received data");
        }
    }

    #[tokio::test]
    async fn test_start_fails_when_holder_ignores_preempt() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();
        let holding = tokio::spawn(async move {
            let mut ignored = Vec::new();
            while let Ok((stream, _)) = holder.accept().await {
                ignored.push(stream);
            }
        });

        let config = HandoffConfig::new(port);
        let listener = TransportListener::new(config.clone(), Arc::new(MemoryFiles::new()))
            .with_arbiter(PortArbiter::new(&config).with_grace(Duration::from_millis(50)));

        let err = listener.start().await.unwrap_err();
        assert!(
            matches!(
                err,
                ListenerError::Bind {
                    status: PortStatus::Preempted,
                    ..
                }
            ),
            "unexpected error: {:?}",
            err
        );
        assert!(!listener.is_running());
        assert!(listener.local_addr().await.is_none());

        holding.abort();
    }
}
