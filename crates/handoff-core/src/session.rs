//! Serving one accepted connection.
//!
//! A session reads exactly one request, answers it, and closes:
//!
//! ```text
//! AwaitingRequest -> Dispatching -> Responding (LIST_SINCE)
//!                                -> Streaming  (FETCH of an offered file)
//!                                -> Terminating (PREEMPT, denial, bad input)
//!                                -> Closed
//! ```
//!
//! Protocol errors are never echoed to the peer. The connection is dropped
//! and the outcome is reported to the caller for logging.

use crate::channel::{self, ChannelKey};
use crate::files::FileSource;
use crate::item::ItemKind;
use crate::protocol::{encode_listing, read_line, Action, ClientRequest, MAX_REQUEST_LINE};
use crate::registry::ShareRegistry;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info};

/// Plaintext carried by each frame while streaming a file.
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// LIST_SINCE answered with `count` items
    Listed { count: usize },
    /// FETCH answered with `bytes` of file content
    Streamed { bytes: u64 },
    /// FETCH for a locator that is not offered; nothing was written
    Denied,
    /// PREEMPT received; the listener is shutting down
    Preempted,
    /// Empty, unreadable, or malformed request
    Rejected,
}

/// Per-listener request handler, shared by all of its sessions.
pub struct ProtocolSession {
    registry: Arc<ShareRegistry>,
    files: Arc<dyn FileSource>,
    key: Option<ChannelKey>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ProtocolSession {
    /// `shutdown` is set to `true` when a peer preempts this listener.
    pub fn new(
        registry: Arc<ShareRegistry>,
        files: Arc<dyn FileSource>,
        key: Option<ChannelKey>,
        shutdown: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            registry,
            files,
            key,
            shutdown,
        }
    }

    /// Serve one connection to completion.
    ///
    /// Transport and file errors are returned; protocol errors resolve to
    /// [`SessionOutcome::Rejected`]. The stream is closed when this returns.
    pub async fn serve<S>(&self, stream: S) -> io::Result<SessionOutcome>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        let (reader, mut writer) = channel::split(stream, self.key.as_ref());
        let mut reader = BufReader::new(reader);

        let line = match read_line(&mut reader, MAX_REQUEST_LINE).await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Connection closed before sending a request");
                return Ok(SessionOutcome::Rejected);
            }
            Err(e) => {
                debug!("Unreadable request: {}", e);
                return Ok(SessionOutcome::Rejected);
            }
        };

        let Some(request) = ClientRequest::from_line(&line) else {
            debug!("Malformed request ({} bytes), dropping connection", line.len());
            return Ok(SessionOutcome::Rejected);
        };

        match request.action {
            Action::ListSince => {
                let since = request.since_timestamp.unwrap_or(0);
                let items = self.registry.list_since(since);
                writer.write_all(&encode_listing(&items)).await?;
                writer.shutdown().await?;
                Ok(SessionOutcome::Listed { count: items.len() })
            }
            Action::Fetch => match request.locator {
                Some(locator) => self.stream_file(&locator, &mut writer).await,
                None => {
                    debug!("FETCH without a locator, dropping connection");
                    Ok(SessionOutcome::Rejected)
                }
            },
            Action::Preempt => {
                info!("Preempted by another instance, giving up the port");
                self.registry.clear();
                self.shutdown.send_replace(true);
                Ok(SessionOutcome::Preempted)
            }
        }
    }

    /// Stream an offered file's bytes, unframed, onto `writer`.
    async fn stream_file<W>(&self, locator: &str, writer: &mut W) -> io::Result<SessionOutcome>
    where
        W: AsyncWrite + Unpin,
    {
        if self.registry.find(ItemKind::File, locator).is_none() {
            debug!("Denied FETCH for a locator that is not shared");
            return Ok(SessionOutcome::Denied);
        }

        let mut source = self.files.open(locator).await?;
        let mut chunk = vec![0u8; STREAM_CHUNK_SIZE];
        let mut total = 0u64;

        loop {
            let n = source.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&chunk[..n]).await?;
            total += n as u64;
        }

        writer.shutdown().await?;
        debug!("Streamed {} bytes for {}", total, locator);
        Ok(SessionOutcome::Streamed { bytes: total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelReader, ChannelWriter};
    use crate::files::MemoryFiles;
    use crate::protocol::decode_listing;
    use tokio::io::DuplexStream;

    struct Harness {
        session: Arc<ProtocolSession>,
        registry: Arc<ShareRegistry>,
        files: Arc<MemoryFiles>,
        shutdown: watch::Receiver<bool>,
        key: Option<ChannelKey>,
    }

    fn harness(key: Option<ChannelKey>) -> Harness {
        let registry = Arc::new(ShareRegistry::new());
        let files = Arc::new(MemoryFiles::new());
        let (tx, rx) = watch::channel(false);
        let session = Arc::new(ProtocolSession::new(
            Arc::clone(&registry),
            files.clone(),
            key.clone(),
            Arc::new(tx),
        ));
        Harness {
            session,
            registry,
            files,
            shutdown: rx,
            key,
        }
    }

    /// Send `request` raw, return everything the session wrote plus its outcome.
    async fn exchange(h: &Harness, request: &[u8]) -> (io::Result<Vec<u8>>, SessionOutcome) {
        let (client, server): (DuplexStream, DuplexStream) = tokio::io::duplex(1 << 16);
        let session = Arc::clone(&h.session);
        let serve = tokio::spawn(async move { session.serve(server).await });

        let (read, write) = tokio::io::split(client);
        let mut writer = ChannelWriter::new(write, h.key.as_ref());
        writer.write_all(request).await.unwrap();
        writer.flush().await.unwrap();

        let mut reader = ChannelReader::new(read, h.key.as_ref());
        let mut response = Vec::new();
        let read_result = reader.read_to_end(&mut response).await.map(|_| response);

        let outcome = serve.await.unwrap().unwrap();
        (read_result, outcome)
    }

    #[tokio::test]
    async fn test_list_since_returns_snapshot_line() {
        let h = harness(None);
        let first = h.registry.put_text("one");
        let second = h.registry.put_text("two");

        let (response, outcome) = exchange(&h, &ClientRequest::list_since(0).to_line()).await;
        let items = decode_listing(&response.unwrap()).unwrap();
        assert_eq!(items, vec![first.clone(), second.clone()]);
        assert_eq!(outcome, SessionOutcome::Listed { count: 2 });

        let (response, _) =
            exchange(&h, &ClientRequest::list_since(first.timestamp).to_line()).await;
        assert_eq!(decode_listing(&response.unwrap()).unwrap(), vec![second]);
    }

    #[tokio::test]
    async fn test_list_since_defaults_to_everything() {
        let h = harness(None);
        h.registry.put_text("x");

        let (response, _) = exchange(&h, b"{\"action\":\"LIST_SINCE\"}\n").await;
        assert_eq!(decode_listing(&response.unwrap()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_streams_offered_file_over_encrypted_channel() {
        let h = harness(Some(ChannelKey::derive("pw")));
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 256) as u8).collect();
        h.files.insert("/data.bin", "data.bin", None, content.clone());
        h.registry.put_file("/data.bin", "data.bin", Some(content.len() as u64), None);

        let (response, outcome) = exchange(&h, &ClientRequest::fetch("/data.bin").to_line()).await;
        assert_eq!(response.unwrap(), content);
        assert_eq!(outcome, SessionOutcome::Streamed { bytes: 200_000 });
    }

    #[tokio::test]
    async fn test_fetch_of_unshared_locator_writes_nothing() {
        let h = harness(None);
        // Readable by the file source, but never offered.
        h.files.insert("/secret", "secret", None, b"private".to_vec());
        h.registry.put_text("/secret");

        let (response, outcome) = exchange(&h, &ClientRequest::fetch("/secret").to_line()).await;
        assert!(response.unwrap().is_empty());
        assert_eq!(outcome, SessionOutcome::Denied);
    }

    #[tokio::test]
    async fn test_fetch_after_clear_is_denied() {
        let h = harness(None);
        h.files.insert("/a", "a", None, b"a".to_vec());
        h.registry.put_file("/a", "a", Some(1), None);
        h.registry.clear();

        let (response, outcome) = exchange(&h, &ClientRequest::fetch("/a").to_line()).await;
        assert!(response.unwrap().is_empty());
        assert_eq!(outcome, SessionOutcome::Denied);
    }

    #[tokio::test]
    async fn test_malformed_request_is_dropped_silently() {
        let h = harness(None);
        h.registry.put_text("kept");

        let (response, outcome) = exchange(&h, b"GET / HTTP/1.1\r\n\r\n").await;
        assert!(response.unwrap().is_empty());
        assert_eq!(outcome, SessionOutcome::Rejected);
        assert_eq!(h.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_plaintext_client_rejected_by_encrypted_session() {
        let h = harness(Some(ChannelKey::derive("pw")));
        h.registry.put_text("hidden");

        let (client, server) = tokio::io::duplex(1 << 16);
        let session = Arc::clone(&h.session);
        let serve = tokio::spawn(async move { session.serve(server).await });

        let (mut read, mut write) = tokio::io::split(client);
        write.write_all(&ClientRequest::list_since(0).to_line()).await.unwrap();

        let mut response = Vec::new();
        read.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());
        assert_eq!(serve.await.unwrap().unwrap(), SessionOutcome::Rejected);
    }

    #[tokio::test]
    async fn test_preempt_clears_registry_and_signals_shutdown() {
        let h = harness(None);
        h.registry.put_text("gone soon");

        let (response, outcome) = exchange(&h, &ClientRequest::preempt().to_line()).await;
        assert!(response.unwrap().is_empty());
        assert_eq!(outcome, SessionOutcome::Preempted);
        assert!(h.registry.is_empty());
        assert!(*h.shutdown.borrow());
    }
}
