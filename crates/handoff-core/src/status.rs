//! Process-wide "sharing is active" cell.
//!
//! Owned by the [`TransportListener`](crate::listener::TransportListener),
//! which flips it on start and off on stop. Pollers in the same process
//! query it so a profile never notifies itself about its own shares.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared, atomically read/written sharing flag.
#[derive(Debug, Clone, Default)]
pub struct SharingStatus {
    active: Arc<AtomicBool>,
}

impl SharingStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }
}
