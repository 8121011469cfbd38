//! Byte counters reported through a caller-supplied callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Receives the cumulative byte count and whether the transfer is done.
pub type ProgressFn = Arc<dyn Fn(u64, bool) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Progress {
    callback: Option<ProgressFn>,
    total: AtomicU64,
}

impl Progress {
    pub(crate) fn new(callback: Option<ProgressFn>) -> Self {
        Self {
            callback,
            total: AtomicU64::new(0),
        }
    }

    pub(crate) fn add(&self, bytes: u64) {
        let total = self.total.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if let Some(cb) = &self.callback {
            cb(total, false);
        }
    }

    pub(crate) fn done(&self) {
        if let Some(cb) = &self.callback {
            cb(self.total.load(Ordering::Relaxed), true);
        }
    }
}
