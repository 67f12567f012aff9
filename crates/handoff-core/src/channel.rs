//! Length-prefixed AES-256-GCM framing over a byte stream.
//!
//! When a [`ChannelKey`] is configured, every logical write is sealed into
//! its own frame:
//!
//! ```text
//! [ciphertext length: u32 BE][nonce: 12 bytes][ciphertext || tag: length bytes]
//! ```
//!
//! Frames are explicit-length because file payloads are raw bytes and may
//! contain anything, including bytes that look like a frame header. The
//! reader is incremental: a frame can arrive across any number of underlying
//! reads, and plaintext is handed out as the caller asks for it.
//!
//! Without a key both wrappers pass bytes through untouched.
//!
//! # Security
//!
//! Every frame uses a fresh random 96-bit nonce. The key is derived from a
//! shared passphrase and only protects against other local users, not
//! against anyone who knows the passphrase.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Nonce size for AES-256-GCM.
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size for AES-256-GCM.
pub const TAG_SIZE: usize = 16;

/// Length prefix plus nonce.
pub const HEADER_SIZE: usize = 4 + NONCE_SIZE;

/// Largest ciphertext a reader accepts (100MB).
///
/// Also catches an unencrypted peer: the first four bytes of a JSON line
/// (`{"ac`) read as a length are far above this.
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Domain separator mixed into passphrase key derivation.
const KEY_DOMAIN: &[u8] = b"handoff.channel.v1";

/// Framing or authentication failure.
///
/// Surfaces to callers as an `io::Error` carrying this value.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame length {0} exceeds the {max} byte ceiling", max = MAX_FRAME_SIZE)]
    TooLarge(usize),

    #[error("Frame length {0} is shorter than the authentication tag")]
    TooShort(usize),

    #[error("Frame failed authentication")]
    Authentication,

    #[error("Stream ended inside a frame")]
    Truncated,

    #[error("Encryption failed")]
    Seal,
}

impl From<FrameError> for io::Error {
    fn from(err: FrameError) -> Self {
        let kind = match err {
            FrameError::Truncated => io::ErrorKind::UnexpectedEof,
            FrameError::Seal => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err)
    }
}

/// 256-bit symmetric key shared by both ends of a channel.
#[derive(Clone, PartialEq, Eq)]
pub struct ChannelKey([u8; 32]);

impl ChannelKey {
    /// Derive a key from a passphrase.
    ///
    /// `key = SHA256(SHA256(passphrase) || domain separator)`
    pub fn derive(passphrase: &str) -> Self {
        let inner = Sha256::digest(passphrase.as_bytes());

        let mut hasher = Sha256::new();
        hasher.update(inner);
        hasher.update(KEY_DOMAIN);

        let mut key = [0u8; 32];
        key.copy_from_slice(&hasher.finalize());
        Self(key)
    }

    fn cipher(&self) -> FrameCipher {
        FrameCipher {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0)),
        }
    }
}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChannelKey(..)")
    }
}

#[derive(Clone)]
struct FrameCipher {
    cipher: Aes256Gcm,
}

impl FrameCipher {
    /// Seal one plaintext into a complete frame.
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, FrameError> {
        if plaintext.len() + TAG_SIZE > MAX_FRAME_SIZE {
            return Err(FrameError::Seal);
        }

        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| FrameError::Seal)?;

        let mut frame = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
        frame.extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, FrameError> {
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| FrameError::Authentication)
    }
}

/// Read exactly what the underlying reader offers into `dst`.
fn poll_fill<R: AsyncRead + Unpin>(
    inner: &mut R,
    cx: &mut Context<'_>,
    dst: &mut [u8],
) -> Poll<io::Result<usize>> {
    let mut buf = ReadBuf::new(dst);
    ready!(Pin::new(inner).poll_read(cx, &mut buf))?;
    Poll::Ready(Ok(buf.filled().len()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadPhase {
    Header,
    Body,
    Plaintext,
}

/// Incremental frame decoder state.
struct FrameDecoder {
    cipher: FrameCipher,
    phase: ReadPhase,
    header: [u8; HEADER_SIZE],
    header_filled: usize,
    body: Vec<u8>,
    body_filled: usize,
    plaintext: Vec<u8>,
    plaintext_pos: usize,
    /// Set on the first framing error; the channel is unusable afterwards
    failed: Option<FrameError>,
}

impl FrameDecoder {
    fn new(cipher: FrameCipher) -> Self {
        Self {
            cipher,
            phase: ReadPhase::Header,
            header: [0u8; HEADER_SIZE],
            header_filled: 0,
            body: Vec::new(),
            body_filled: 0,
            plaintext: Vec::new(),
            plaintext_pos: 0,
            failed: None,
        }
    }

    fn reset(&mut self) {
        self.phase = ReadPhase::Header;
        self.header_filled = 0;
        self.body = Vec::new();
        self.body_filled = 0;
        self.plaintext = Vec::new();
        self.plaintext_pos = 0;
    }

    fn fail(&mut self, err: FrameError) -> io::Error {
        self.failed = Some(err);
        err.into()
    }

    fn poll_read<R: AsyncRead + Unpin>(
        &mut self,
        inner: &mut R,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(err) = self.failed {
            return Poll::Ready(Err(err.into()));
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            match self.phase {
                ReadPhase::Plaintext => {
                    let pending = &self.plaintext[self.plaintext_pos..];
                    if pending.is_empty() {
                        // Empty frame: move on to the next one.
                        self.reset();
                        continue;
                    }

                    let n = pending.len().min(buf.remaining());
                    buf.put_slice(&pending[..n]);
                    self.plaintext_pos += n;
                    if self.plaintext_pos == self.plaintext.len() {
                        self.reset();
                    }
                    return Poll::Ready(Ok(()));
                }
                ReadPhase::Header => {
                    let n = ready!(poll_fill(inner, cx, &mut self.header[self.header_filled..]))?;
                    if n == 0 {
                        if self.header_filled == 0 {
                            return Poll::Ready(Ok(()));
                        }
                        return Poll::Ready(Err(self.fail(FrameError::Truncated)));
                    }

                    self.header_filled += n;
                    if self.header_filled < HEADER_SIZE {
                        continue;
                    }

                    let mut len_bytes = [0u8; 4];
                    len_bytes.copy_from_slice(&self.header[..4]);
                    let len = u32::from_be_bytes(len_bytes) as usize;

                    if len > MAX_FRAME_SIZE {
                        return Poll::Ready(Err(self.fail(FrameError::TooLarge(len))));
                    }
                    if len < TAG_SIZE {
                        return Poll::Ready(Err(self.fail(FrameError::TooShort(len))));
                    }

                    self.body = vec![0u8; len];
                    self.body_filled = 0;
                    self.phase = ReadPhase::Body;
                }
                ReadPhase::Body => {
                    let n = ready!(poll_fill(inner, cx, &mut self.body[self.body_filled..]))?;
                    if n == 0 {
                        return Poll::Ready(Err(self.fail(FrameError::Truncated)));
                    }

                    self.body_filled += n;
                    if self.body_filled < self.body.len() {
                        continue;
                    }

                    match self.cipher.open(&self.header[4..], &self.body) {
                        Ok(plaintext) => {
                            self.plaintext = plaintext;
                            self.plaintext_pos = 0;
                            self.body = Vec::new();
                            self.phase = ReadPhase::Plaintext;
                        }
                        Err(err) => return Poll::Ready(Err(self.fail(err))),
                    }
                }
            }
        }
    }
}

/// Reading half of a channel.
pub struct ChannelReader<R> {
    inner: R,
    decoder: Option<FrameDecoder>,
}

impl<R> ChannelReader<R> {
    /// Wrap a reader, decrypting frames when `key` is set.
    pub fn new(inner: R, key: Option<&ChannelKey>) -> Self {
        Self {
            inner,
            decoder: key.map(|k| FrameDecoder::new(k.cipher())),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.decoder.is_some()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ChannelReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.decoder.as_mut() {
            Some(decoder) => decoder.poll_read(&mut this.inner, cx, buf),
            None => Pin::new(&mut this.inner).poll_read(cx, buf),
        }
    }
}

/// Pending output of the frame encoder.
struct FrameEncoder {
    cipher: FrameCipher,
    pending: Vec<u8>,
    written: usize,
}

impl FrameEncoder {
    fn poll_drain<W: AsyncWrite + Unpin>(
        &mut self,
        inner: &mut W,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        while self.written < self.pending.len() {
            let n = ready!(Pin::new(&mut *inner).poll_write(cx, &self.pending[self.written..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.written += n;
        }
        self.pending.clear();
        self.written = 0;
        Poll::Ready(Ok(()))
    }
}

/// Writing half of a channel.
///
/// With encryption on, each `poll_write` that accepts bytes seals all of
/// them into exactly one frame.
pub struct ChannelWriter<W> {
    inner: W,
    encoder: Option<FrameEncoder>,
}

impl<W> ChannelWriter<W> {
    /// Wrap a writer, encrypting frames when `key` is set.
    pub fn new(inner: W, key: Option<&ChannelKey>) -> Self {
        Self {
            inner,
            encoder: key.map(|k| FrameEncoder {
                cipher: k.cipher(),
                pending: Vec::new(),
                written: 0,
            }),
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ChannelWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let Some(encoder) = this.encoder.as_mut() else {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        };

        // Finish the previous frame before accepting a new one.
        ready!(encoder.poll_drain(&mut this.inner, cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        encoder.pending = encoder.cipher.seal(buf)?;
        encoder.written = 0;

        if let Poll::Ready(Err(err)) = encoder.poll_drain(&mut this.inner, cx) {
            return Poll::Ready(Err(err));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(encoder) = this.encoder.as_mut() {
            ready!(encoder.poll_drain(&mut this.inner, cx))?;
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(encoder) = this.encoder.as_mut() {
            ready!(encoder.poll_drain(&mut this.inner, cx))?;
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// Split a duplex stream into channel halves sharing one key.
pub fn split<S>(
    stream: S,
    key: Option<&ChannelKey>,
) -> (
    ChannelReader<tokio::io::ReadHalf<S>>,
    ChannelWriter<tokio::io::WriteHalf<S>>,
)
where
    S: AsyncRead + AsyncWrite,
{
    let (read, write) = tokio::io::split(stream);
    (ChannelReader::new(read, key), ChannelWriter::new(write, key))
}
