//! Live-resource accounting for staged documents and open handles

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::warn;

/// Counts resources a run acquires and releases.
///
/// Each [`LoadPipeline`](super::LoadPipeline) owns one ledger and hands clones
/// to the resources it creates; the resources record their own release, so the
/// counters stay correct on every exit path including unwinding.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    staged_created: AtomicUsize,
    staged_released: AtomicUsize,
    handles_opened: AtomicUsize,
    handles_closed: AtomicUsize,
}

impl ResourceLedger {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn record_stage_create(&self) {
        self.staged_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stage_release(&self) {
        self.staged_released.fetch_add(1, Ordering::Relaxed);
        self.audit();
    }

    pub(crate) fn record_handle_open(&self) {
        self.handles_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handle_close(&self) {
        self.handles_closed.fetch_add(1, Ordering::Relaxed);
        self.audit();
    }

    /// Staged resources that have not been released yet
    #[must_use]
    pub fn live_staged(&self) -> usize {
        let created = self.staged_created.load(Ordering::Relaxed);
        created.saturating_sub(self.staged_released.load(Ordering::Relaxed))
    }

    /// Document handles that have not been closed yet
    #[must_use]
    pub fn live_handles(&self) -> usize {
        let opened = self.handles_opened.load(Ordering::Relaxed);
        opened.saturating_sub(self.handles_closed.load(Ordering::Relaxed))
    }

    /// Total number of documents staged through this ledger
    #[must_use]
    pub fn total_staged(&self) -> usize {
        self.staged_created.load(Ordering::Relaxed)
    }

    /// Total number of handles opened through this ledger
    #[must_use]
    pub fn total_opened(&self) -> usize {
        self.handles_opened.load(Ordering::Relaxed)
    }

    /// True when nothing acquired through this ledger is still held
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.live_staged() == 0 && self.live_handles() == 0
    }

    fn audit(&self) {
        let staged = (
            self.staged_created.load(Ordering::Relaxed),
            self.staged_released.load(Ordering::Relaxed),
        );
        let handles = (
            self.handles_opened.load(Ordering::Relaxed),
            self.handles_closed.load(Ordering::Relaxed),
        );

        if staged.1 > staged.0 || handles.1 > handles.0 {
            if cfg!(debug_assertions) && !std::thread::panicking() {
                panic!(
                    "resource ledger released more than it acquired: staged={staged:?} handles={handles:?}"
                );
            } else {
                warn!(
                    "resource ledger released more than it acquired: staged={:?} handles={:?}",
                    staged, handles
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_live_resources() {
        let ledger = ResourceLedger::new();
        assert!(ledger.is_clean());

        ledger.record_stage_create();
        ledger.record_handle_open();
        assert_eq!(ledger.live_staged(), 1);
        assert_eq!(ledger.live_handles(), 1);
        assert!(!ledger.is_clean());

        ledger.record_handle_close();
        ledger.record_stage_release();
        assert!(ledger.is_clean());
        assert_eq!(ledger.total_staged(), 1);
        assert_eq!(ledger.total_opened(), 1);
    }
}
