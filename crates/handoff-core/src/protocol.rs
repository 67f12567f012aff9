//! Request/response wire format.
//!
//! One request per connection, sent as a single newline-terminated JSON line:
//!
//! ```text
//! {"action":"LIST_SINCE","sinceTimestamp":0}
//! {"action":"FETCH","locator":"/home/a/pic.png"}
//! {"action":"PREEMPT"}
//! ```
//!
//! LIST_SINCE is answered with one JSON array line of items. FETCH is
//! answered with the raw file bytes (exactly the advertised size) or with
//! nothing at all. PREEMPT is never answered.

use crate::item::SharedItem;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio::net::TcpStream;

/// Well-known loopback port.
pub const DEFAULT_PORT: u16 = 2411;

/// Upper bound for client connect attempts.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Longest request line a session accepts.
pub const MAX_REQUEST_LINE: usize = 64 * 1024;

/// Longest listing line a poller accepts.
pub const MAX_RESPONSE_LINE: usize = 64 * 1024 * 1024;

/// What a client asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// List items newer than a timestamp
    ListSince,
    /// Stream the bytes of one offered file
    Fetch,
    /// Ask the current listener to give up the port (one-way)
    Preempt,
}

/// A single client request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRequest {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,
}

impl ClientRequest {
    pub fn list_since(since: i64) -> Self {
        Self {
            action: Action::ListSince,
            since_timestamp: Some(since),
            locator: None,
        }
    }

    pub fn fetch(locator: impl Into<String>) -> Self {
        Self {
            action: Action::Fetch,
            since_timestamp: None,
            locator: Some(locator.into()),
        }
    }

    pub fn preempt() -> Self {
        Self {
            action: Action::Preempt,
            since_timestamp: None,
            locator: None,
        }
    }

    /// Serialize to a newline-terminated JSON line.
    pub fn to_line(&self) -> Vec<u8> {
        let mut line =
            serde_json::to_vec(self).expect("ClientRequest serialization should not fail");
        line.push(b'\n');
        line
    }

    /// Try to parse a request line (with or without its terminator).
    ///
    /// Returns `None` for anything that is not a well-formed request.
    pub fn from_line(line: &[u8]) -> Option<Self> {
        serde_json::from_slice(trim_line(line)).ok()
    }
}

/// Serialize a listing to a newline-terminated JSON array line.
pub fn encode_listing(items: &[SharedItem]) -> Vec<u8> {
    let mut line = serde_json::to_vec(items).expect("SharedItem serialization should not fail");
    line.push(b'\n');
    line
}

/// Parse a listing line.
pub fn decode_listing(line: &[u8]) -> Result<Vec<SharedItem>, serde_json::Error> {
    serde_json::from_slice(trim_line(line))
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Read one line of at most `limit` bytes.
///
/// Returns `Ok(None)` if the stream ends before any byte arrives. A final
/// line without a terminator is accepted; a line that reaches `limit`
/// without a terminator is rejected as `InvalidData`.
pub async fn read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    limit: usize,
) -> io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    let n = reader
        .take(limit as u64)
        .read_until(b'\n', &mut line)
        .await?;

    if n == 0 {
        return Ok(None);
    }
    if line.last() != Some(&b'\n') && n >= limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {} bytes", limit),
        ));
    }
    Ok(Some(line))
}

/// Connect to a loopback listener, giving up after `timeout`.
pub async fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to {} timed out", addr),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_request_wire_format() {
        let line = String::from_utf8(ClientRequest::list_since(42).to_line()).unwrap();
        assert_eq!(line, "{\"action\":\"LIST_SINCE\",\"sinceTimestamp\":42}\n");

        let line = String::from_utf8(ClientRequest::fetch("/a b").to_line()).unwrap();
        assert_eq!(line, "{\"action\":\"FETCH\",\"locator\":\"/a b\"}\n");

        let line = String::from_utf8(ClientRequest::preempt().to_line()).unwrap();
        assert_eq!(line, "{\"action\":\"PREEMPT\"}\n");
    }

    #[test]
    fn test_list_since_defaults_to_none() {
        let request = ClientRequest::from_line(b"{\"action\":\"LIST_SINCE\"}\r\n").unwrap();
        assert_eq!(request.action, Action::ListSince);
        assert_eq!(request.since_timestamp, None);
    }

    #[test]
    fn test_malformed_requests_rejected() {
        assert!(ClientRequest::from_line(b"").is_none());
        assert!(ClientRequest::from_line(b"not json\n").is_none());
        assert!(ClientRequest::from_line(b"{\"action\":\"DELETE\"}\n").is_none());
        assert!(ClientRequest::from_line(&[0xFF, 0xFE, b'\n']).is_none());
    }

    #[test]
    fn test_listing_roundtrip() {
        let items = vec![SharedItem::text("hi"), SharedItem::file("/f", "f", Some(1), None)];
        let line = encode_listing(&items);

        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(decode_listing(&line).unwrap(), items);
        assert!(decode_listing(b"{\"not\":\"a list\"}\n").is_err());
    }

    #[tokio::test]
    async fn test_read_line_limits() {
        let mut reader = BufReader::new(&b"first\nsecond"[..]);
        assert_eq!(read_line(&mut reader, 64).await.unwrap().unwrap(), b"first\n");
        assert_eq!(read_line(&mut reader, 64).await.unwrap().unwrap(), b"second");
        assert!(read_line(&mut reader, 64).await.unwrap().is_none());

        let mut reader = BufReader::new(&b"0123456789\n"[..]);
        let err = read_line(&mut reader, 4).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
