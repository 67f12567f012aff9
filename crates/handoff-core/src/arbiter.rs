//! Contention for the single well-known loopback port.
//!
//! Only one sharing session can own the port. When it is taken, the newcomer
//! always wins: it asks the incumbent to step down with a one-way PREEMPT
//! request and waits a short grace period before binding for real.

use crate::channel::{ChannelKey, ChannelWriter};
use crate::config::HandoffConfig;
use crate::protocol::{connect, ClientRequest, CONNECT_TIMEOUT};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Time given to a preempted listener to release the port.
pub const PREEMPT_GRACE: Duration = Duration::from_millis(500);

/// Result of [`PortArbiter::ensure_available`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortStatus {
    /// Port was free
    Available,
    /// Port was taken; the holder was sent PREEMPT
    Preempted,
    /// Port was taken but nothing accepted the PREEMPT connection
    Unreachable,
}

/// Checks the port and preempts whoever holds it.
#[derive(Debug, Clone)]
pub struct PortArbiter {
    addr: SocketAddr,
    key: Option<ChannelKey>,
    grace: Duration,
}

impl PortArbiter {
    pub fn new(config: &HandoffConfig) -> Self {
        Self {
            addr: config.loopback_addr(),
            key: config.encryption.clone(),
            grace: PREEMPT_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Make a best effort to free the port.
    ///
    /// Never fails: the caller's own bind decides whether the port was
    /// actually released.
    pub async fn ensure_available(&self) -> PortStatus {
        match TcpListener::bind(self.addr).await {
            Ok(trial) => {
                drop(trial);
                return PortStatus::Available;
            }
            Err(e) => debug!("Port {} is taken: {}", self.addr.port(), e),
        }

        let status = match self.send_preempt().await {
            Ok(()) => {
                info!("Sent PREEMPT to the listener on port {}", self.addr.port());
                PortStatus::Preempted
            }
            Err(e) => {
                warn!("Could not preempt the holder of port {}: {}", self.addr.port(), e);
                PortStatus::Unreachable
            }
        };

        tokio::time::sleep(self.grace).await;
        status
    }

    async fn send_preempt(&self) -> io::Result<()> {
        let stream = connect(self.addr, CONNECT_TIMEOUT).await?;
        let mut writer = ChannelWriter::new(stream, self.key.as_ref());
        writer.write_all(&ClientRequest::preempt().to_line()).await?;
        writer.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{read_line, MAX_REQUEST_LINE};
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_free_port_is_available() {
        let arbiter = PortArbiter::new(&HandoffConfig::new(0));
        assert_eq!(arbiter.ensure_available().await, PortStatus::Available);
    }

    #[tokio::test]
    async fn test_taken_port_receives_preempt() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();

        let received = tokio::spawn(async move {
            let (stream, _) = holder.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            read_line(&mut reader, MAX_REQUEST_LINE).await.unwrap().unwrap()
        });

        let arbiter =
            PortArbiter::new(&HandoffConfig::new(port)).with_grace(Duration::from_millis(10));
        assert_eq!(arbiter.ensure_available().await, PortStatus::Preempted);

        let line = received.await.unwrap();
        assert_eq!(ClientRequest::from_line(&line), Some(ClientRequest::preempt()));
    }
}
