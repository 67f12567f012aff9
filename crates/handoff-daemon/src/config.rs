//! Command-line configuration.

use clap::{Parser, Subcommand};
use handoff_core::channel::ChannelKey;
use handoff_core::config::{ConfigError, HandoffConfig};
use handoff_core::protocol::DEFAULT_PORT;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "handoff")]
#[command(about = "Hand files and text between two local profiles over loopback")]
pub struct Args {
    /// Loopback port shared by both profiles
    #[arg(
        short,
        long,
        global = true,
        env = "HANDOFF_PORT",
        default_value_t = DEFAULT_PORT as i64,
        allow_negative_numbers = true
    )]
    pub port: i64,

    /// Passphrase both profiles use to encrypt the channel (off if unset)
    #[arg(long, global = true, env = "HANDOFF_PASSPHRASE", hide_env_values = true)]
    pub passphrase: Option<String>,

    /// Enable verbose logging
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Offer files and text until interrupted or preempted
    Share {
        /// File to offer (repeatable)
        #[arg(long = "file")]
        files: Vec<PathBuf>,

        /// Text snippet to offer (repeatable)
        #[arg(long = "text")]
        texts: Vec<String>,
    },

    /// Poll for new shares
    Watch {
        /// File holding the watermark between runs
        #[arg(long)]
        state: Option<PathBuf>,

        /// Fetch every offered file into this directory
        #[arg(long)]
        download_dir: Option<PathBuf>,

        /// Milliseconds between checks
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },

    /// Print the current listing as JSON
    List {
        /// Only items newer than this timestamp (ms since epoch)
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        since: i64,
    },

    /// Fetch one offered file
    Fetch {
        #[arg(long)]
        locator: String,

        /// Advertised size in bytes
        #[arg(long)]
        size: u64,

        /// Name to save under
        #[arg(long)]
        name: String,

        #[arg(long)]
        download_dir: PathBuf,
    },
}

impl Args {
    /// Validate the port and derive the channel key.
    pub fn handoff_config(&self) -> Result<HandoffConfig, ConfigError> {
        let port = HandoffConfig::validate_port(self.port)?;
        let key = self
            .passphrase
            .as_deref()
            .filter(|passphrase| !passphrase.is_empty())
            .map(ChannelKey::derive);
        Ok(HandoffConfig::new(port).with_key(key))
    }

    /// Default log filter when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "debug,handoff_daemon=debug,handoff_core=debug"
        } else {
            "info,handoff_daemon=info,handoff_core=info"
        }
    }
}
