//! File access seams.
//!
//! The core never touches the filesystem directly. The sharing side reads
//! offered files through a [`FileSource`]; the receiving side writes fetched
//! bytes through a [`FileStore`].
//!
//! Implementations:
//! - `MemoryFiles` / `MemoryStore` - For testing
//! - `NativeFiles` / `DownloadDir` (in handoff-daemon) - Use tokio::fs

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte source for one offered file.
pub type FileReader = Box<dyn AsyncRead + Send + Unpin>;

/// What the producer needs to know to offer a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub name: String,
    /// Size in bytes, if known
    pub size: Option<u64>,
    /// MIME type, if known
    pub mime_type: Option<String>,
}

/// Resolves locators to file bytes on the sharing side.
#[async_trait]
pub trait FileSource: Send + Sync {
    /// Open the file behind `locator` for reading.
    async fn open(&self, locator: &str) -> io::Result<FileReader>;

    /// Describe the file behind `locator`.
    async fn describe(&self, locator: &str) -> io::Result<FileDescriptor>;
}

/// An in-progress download.
///
/// Bytes are written incrementally; the download only becomes visible once
/// committed. Discarding drops whatever was written.
#[async_trait]
pub trait Download: AsyncWrite + Send + Unpin {
    async fn commit(self: Box<Self>) -> io::Result<()>;

    async fn discard(self: Box<Self>) -> io::Result<()>;
}

/// Destination for fetched files on the receiving side.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Start a download named `name`.
    async fn create(&self, name: &str) -> io::Result<Box<dyn Download>>;
}

/// In-memory file source for testing.
#[derive(Debug, Default)]
pub struct MemoryFiles {
    files: Mutex<HashMap<String, (FileDescriptor, Vec<u8>)>>,
}

impl MemoryFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file under `locator`.
    pub fn insert(&self, locator: &str, name: &str, mime_type: Option<&str>, content: Vec<u8>) {
        let descriptor = FileDescriptor {
            name: name.to_string(),
            size: Some(content.len() as u64),
            mime_type: mime_type.map(str::to_string),
        };
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(locator.to_string(), (descriptor, content));
    }

    fn get(&self, locator: &str) -> io::Result<(FileDescriptor, Vec<u8>)> {
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(locator)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, locator.to_string()))
    }
}

#[async_trait]
impl FileSource for MemoryFiles {
    async fn open(&self, locator: &str) -> io::Result<FileReader> {
        let (_, content) = self.get(locator)?;
        Ok(Box::new(io::Cursor::new(content)))
    }

    async fn describe(&self, locator: &str) -> io::Result<FileDescriptor> {
        Ok(self.get(locator)?.0)
    }
}

#[derive(Debug, Default)]
struct StoreState {
    committed: HashMap<String, Vec<u8>>,
    discarded: HashSet<String>,
}

/// In-memory download store for testing.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents of a committed download.
    pub fn committed(&self, name: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .committed
            .get(name)
            .cloned()
    }

    /// Whether a download with this name was discarded.
    pub fn was_discarded(&self, name: &str) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .discarded
            .contains(name)
    }
}

#[async_trait]
impl FileStore for MemoryStore {
    async fn create(&self, name: &str) -> io::Result<Box<dyn Download>> {
        Ok(Box::new(MemoryDownload {
            name: name.to_string(),
            buffer: Vec::new(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryDownload {
    name: String,
    buffer: Vec<u8>,
    state: Arc<Mutex<StoreState>>,
}

impl AsyncWrite for MemoryDownload {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.buffer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.buffer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.buffer).poll_shutdown(cx)
    }
}

#[async_trait]
impl Download for MemoryDownload {
    async fn commit(self: Box<Self>) -> io::Result<()> {
        let MemoryDownload { name, buffer, state } = *self;
        state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .committed
            .insert(name, buffer);
        Ok(())
    }

    async fn discard(self: Box<Self>) -> io::Result<()> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .discarded
            .insert(self.name.clone());
        Ok(())
    }
}
