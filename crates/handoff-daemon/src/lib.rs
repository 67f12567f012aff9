//! handoff-daemon library: native adapters behind the handoff binary.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod config;
pub mod native_fs;
pub mod notifier;
pub mod persistence;
pub mod watcher;

pub use config::{Args, Command};
pub use native_fs::{DownloadDir, NativeFiles};
pub use notifier::LogNotifier;
pub use persistence::FileWatermark;
pub use watcher::run_watch;
