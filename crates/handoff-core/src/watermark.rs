//! Poll watermark persistence seam.

use std::io;
use std::sync::atomic::{AtomicI64, Ordering};

/// Stores the last-seen item timestamp for a poller.
///
/// The poller only ever stores values that are not lower than what it
/// loaded, so implementations may persist blindly.
pub trait WatermarkStore: Send + Sync {
    /// Last stored watermark, or 0 if none.
    fn load(&self) -> i64;

    fn store(&self, watermark: i64) -> io::Result<()>;
}

/// Volatile watermark for tests and one-shot pollers.
#[derive(Debug, Default)]
pub struct MemoryWatermark(AtomicI64);

impl MemoryWatermark {
    pub fn new(initial: i64) -> Self {
        Self(AtomicI64::new(initial))
    }
}

impl WatermarkStore for MemoryWatermark {
    fn load(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }

    fn store(&self, watermark: i64) -> io::Result<()> {
        self.0.store(watermark, Ordering::SeqCst);
        Ok(())
    }
}
