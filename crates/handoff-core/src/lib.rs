//! handoff-core: loopback share exchange between two local profiles.
//!
//! One side offers files and text snippets on a well-known loopback port;
//! the other side polls for what is new and fetches file bytes on demand.
//!
//! This crate provides:
//! - An optional AES-256-GCM framed channel over any byte stream
//! - The share registry and its presentation grouping
//! - The listener with port preemption, and the per-connection protocol
//! - The client poller with a persisted watermark
//! - FileSource / FileStore / WatermarkStore seams for the host

pub mod arbiter;
pub mod channel;
pub mod config;
pub mod files;
pub mod item;
pub mod listener;
pub mod poller;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod status;
pub mod watermark;

pub use arbiter::{PortArbiter, PortStatus};
pub use channel::{ChannelKey, ChannelReader, ChannelWriter, FrameError};
pub use config::{ConfigError, HandoffConfig};
pub use files::{Download, FileDescriptor, FileReader, FileSource, FileStore};
pub use item::{ItemKind, SharedItem};
pub use listener::{ListenerError, TransportListener};
pub use poller::{CheckOutcome, ClientPoller, PollError, ShareNotifier};
pub use protocol::{Action, ClientRequest, DEFAULT_PORT};
pub use registry::{group_items, ItemGroup, ItemGroups, ShareRegistry};
pub use session::{ProtocolSession, SessionOutcome};
pub use status::SharingStatus;
pub use watermark::{MemoryWatermark, WatermarkStore};
