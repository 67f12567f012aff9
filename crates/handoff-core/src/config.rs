//! Configuration consumed by the listener, arbiter and poller.

use crate::channel::ChannelKey;
use crate::protocol::DEFAULT_PORT;
use std::net::{Ipv4Addr, SocketAddr};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Port {0} is outside 0..=65535")]
    PortOutOfRange(i64),
}

/// Port and optional channel key shared by both profiles.
#[derive(Debug, Clone)]
pub struct HandoffConfig {
    /// Loopback port the listener binds (0 = ephemeral, for tests)
    pub port: u16,
    /// Channel key; `None` disables encryption
    pub encryption: Option<ChannelKey>,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            encryption: None,
        }
    }
}

impl HandoffConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            encryption: None,
        }
    }

    /// Enable encryption with a key derived from `passphrase`.
    pub fn with_passphrase(mut self, passphrase: &str) -> Self {
        self.encryption = Some(ChannelKey::derive(passphrase));
        self
    }

    pub fn with_key(mut self, key: Option<ChannelKey>) -> Self {
        self.encryption = key;
        self
    }

    pub fn encryption_enabled(&self) -> bool {
        self.encryption.is_some()
    }

    pub fn key(&self) -> Option<&ChannelKey> {
        self.encryption.as_ref()
    }

    /// `127.0.0.1:<port>`
    pub fn loopback_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }

    /// Validate a raw port value before it reaches the core.
    pub fn validate_port(port: i64) -> Result<u16, ConfigError> {
        u16::try_from(port).map_err(|_| ConfigError::PortOutOfRange(port))
    }
}
