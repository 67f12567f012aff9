//! Native file source and download directory using tokio::fs.

use async_trait::async_trait;
use handoff_core::files::{Download, FileDescriptor, FileReader, FileSource, FileStore};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Name used when a requested download name has no usable file component.
const FALLBACK_NAME: &str = "download";

/// Serves offered files straight from disk. Locators are absolute paths.
#[derive(Debug, Default, Clone)]
pub struct NativeFiles;

impl NativeFiles {
    pub fn new() -> Self {
        Self
    }

    fn path(locator: &str) -> io::Result<&Path> {
        let path = Path::new(locator);
        if path.is_absolute() {
            Ok(path)
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("locator must be an absolute path: {}", locator),
            ))
        }
    }
}

#[async_trait]
impl FileSource for NativeFiles {
    async fn open(&self, locator: &str) -> io::Result<FileReader> {
        let file = fs::File::open(Self::path(locator)?).await?;
        Ok(Box::new(file))
    }

    async fn describe(&self, locator: &str) -> io::Result<FileDescriptor> {
        let path = Self::path(locator)?;
        let metadata = fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a regular file: {}", locator),
            ));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| FALLBACK_NAME.to_string());
        let mime_type = mime_guess::from_path(path).first().map(|m| m.to_string());

        Ok(FileDescriptor {
            name,
            size: Some(metadata.len()),
            mime_type,
        })
    }
}

/// Writes fetched files into a directory.
///
/// Bytes land in `<name>.part` and are renamed on commit to `<name>`, or to
/// `<stem> (n).<ext>` if that name is already taken.
#[derive(Debug, Clone)]
pub struct DownloadDir {
    base_path: PathBuf,
}

impl DownloadDir {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn path(&self) -> &Path {
        &self.base_path
    }
}

#[async_trait]
impl FileStore for DownloadDir {
    async fn create(&self, name: &str) -> io::Result<Box<dyn Download>> {
        fs::create_dir_all(&self.base_path).await?;

        let name = sanitize_name(name);
        let part_path = self.base_path.join(format!("{}.part", name));
        let file = fs::File::create(&part_path).await?;
        debug!("Receiving into {:?}", part_path);

        Ok(Box::new(NativeDownload {
            file,
            part: PartFile::new(part_path),
            base_path: self.base_path.clone(),
            name,
        }))
    }
}

/// Removes the part file when dropped, unless the download was settled.
///
/// Covers downloads that are dropped mid-transfer, e.g. when the task
/// fetching them is aborted.
struct PartFile {
    path: PathBuf,
    settled: bool,
}

impl PartFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            settled: false,
        }
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed abandoned {:?}", self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove abandoned {:?}: {}", self.path, e),
        }
    }
}

struct NativeDownload {
    file: fs::File,
    part: PartFile,
    base_path: PathBuf,
    name: String,
}

impl AsyncWrite for NativeDownload {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.file).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

#[async_trait]
impl Download for NativeDownload {
    async fn commit(self: Box<Self>) -> io::Result<()> {
        let NativeDownload {
            mut file,
            mut part,
            base_path,
            name,
        } = *self;

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let destination = unique_destination(&base_path, &name).await?;
        fs::rename(&part.path, &destination).await?;
        part.settled = true;
        info!("Saved {:?}", destination);
        Ok(())
    }

    async fn discard(self: Box<Self>) -> io::Result<()> {
        let NativeDownload { file, mut part, .. } = *self;
        drop(file);

        let removed = fs::remove_file(&part.path).await;
        part.settled = true;
        match removed {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Reduce a peer-supplied name to a single, non-special path component.
fn sanitize_name(name: &str) -> String {
    let last = name
        .rsplit(['/', '\\'])
        .find(|part| !part.is_empty())
        .unwrap_or("");
    let trimmed = last.trim();

    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        FALLBACK_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// First of `name`, `stem (1).ext`, `stem (2).ext`, ... not present in `dir`.
async fn unique_destination(dir: &Path, name: &str) -> io::Result<PathBuf> {
    let candidate = dir.join(name);
    if !fs::try_exists(&candidate).await? {
        return Ok(candidate);
    }

    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string());
    let extension = path.extension().map(|e| e.to_string_lossy().to_string());

    let mut n = 1u32;
    loop {
        let numbered = match &extension {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let candidate = dir.join(numbered);
        if !fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("photo.png"), "photo.png");
        assert_eq!(sanitize_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_name("dir\\evil.txt"), "evil.txt");
        assert_eq!(sanitize_name("trailing/"), "trailing");
        assert_eq!(sanitize_name(".."), "download");
        assert_eq!(sanitize_name(""), "download");
    }

    #[tokio::test]
    async fn test_describe_guesses_mime_from_extension() {
        let temp_dir = TempDir::new().unwrap();
        let png = temp_dir.path().join("shot.png");
        let blob = temp_dir.path().join("blob.zzunknown");
        std::fs::write(&png, b"12345").unwrap();
        std::fs::write(&blob, b"x").unwrap();

        let files = NativeFiles::new();
        let described = files.describe(png.to_str().unwrap()).await.unwrap();
        assert_eq!(described.name, "shot.png");
        assert_eq!(described.size, Some(5));
        assert_eq!(described.mime_type.as_deref(), Some("image/png"));

        let described = files.describe(blob.to_str().unwrap()).await.unwrap();
        assert_eq!(described.mime_type, None);
    }

    #[tokio::test]
    async fn test_describe_rejects_relative_and_directories() {
        let temp_dir = TempDir::new().unwrap();
        let files = NativeFiles::new();

        let err = files.describe("relative.txt").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let err = files
            .describe(temp_dir.path().to_str().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_open_reads_content() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();

        let mut reader = NativeFiles::new().open(path.to_str().unwrap()).await.unwrap();
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"hello");
    }

    #[tokio::test]
    async fn test_commit_does_not_clobber() {
        let temp_dir = TempDir::new().unwrap();
        let store = DownloadDir::new(temp_dir.path().join("inbox"));

        for content in [&b"first"[..], b"second", b"third"] {
            let mut download = store.create("note.txt").await.unwrap();
            download.write_all(content).await.unwrap();
            download.commit().await.unwrap();
        }

        let inbox = temp_dir.path().join("inbox");
        assert_eq!(std::fs::read(inbox.join("note.txt")).unwrap(), b"first");
        assert_eq!(std::fs::read(inbox.join("note (1).txt")).unwrap(), b"second");
        assert_eq!(std::fs::read(inbox.join("note (2).txt")).unwrap(), b"third");
        assert!(!inbox.join("note.txt.part").exists());
    }

    #[tokio::test]
    async fn test_discard_removes_part_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = DownloadDir::new(temp_dir.path().to_path_buf());

        let mut download = store.create("../partial.bin").await.unwrap();
        download.write_all(b"half").await.unwrap();
        assert!(temp_dir.path().join("partial.bin.part").exists());

        download.discard().await.unwrap();
        assert!(!temp_dir.path().join("partial.bin.part").exists());
        assert!(!temp_dir.path().join("partial.bin").exists());
    }

    #[tokio::test]
    async fn test_dropped_download_removes_part_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = DownloadDir::new(temp_dir.path().to_path_buf());

        let mut download = store.create("cut.bin").await.unwrap();
        download.write_all(b"interrupted").await.unwrap();
        assert!(temp_dir.path().join("cut.bin.part").exists());

        drop(download);
        assert!(!temp_dir.path().join("cut.bin.part").exists());
        assert!(!temp_dir.path().join("cut.bin").exists());
    }
}
