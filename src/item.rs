//! Work item types: one concrete attempt to fetch one mirror.
//!
//! A [`DownloadItem`] is created by the mirror policy, owned by the
//! scheduler while queued or in flight, and dropped after its terminal
//! transition. The identifier is stable across retries of the same mirror,
//! so a retry reuses the id with a fresh cancel token and progress record.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::pqueue::Prioritized;

/// Byte-count progress record for a single transfer.
///
/// Shared between the transport writing bytes and any number of observers.
/// All fields are atomics so the record is safe to read from any thread
/// while the transfer runs.
#[derive(Debug, Default)]
pub struct TransferProgress {
    total_bytes: AtomicU64,
    completed_bytes: AtomicU64,
}

impl TransferProgress {
    /// Creates a fresh progress record with zero counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the expected total size in bytes, 0 when unknown.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::SeqCst)
    }

    /// Returns the bytes transferred so far.
    #[must_use]
    pub fn completed_bytes(&self) -> u64 {
        self.completed_bytes.load(Ordering::SeqCst)
    }

    /// Records the expected total size (from Content-Length or store metadata).
    pub fn set_total_bytes(&self, total: u64) {
        self.total_bytes.store(total, Ordering::SeqCst);
    }

    /// Adds transferred bytes and returns the new completed count.
    pub fn add_completed_bytes(&self, bytes: u64) -> u64 {
        self.completed_bytes.fetch_add(bytes, Ordering::SeqCst) + bytes
    }

    /// Fraction completed in `0.0..=1.0`, or 0.0 while the total is unknown.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction_completed(&self) -> f64 {
        let total = self.total_bytes();
        if total == 0 {
            return 0.0;
        }
        (self.completed_bytes() as f64 / total as f64).min(1.0)
    }
}

/// One concrete attempt to fetch one mirror.
///
/// Cheap to clone: the progress record and cancel token are shared, so a
/// clone observes and controls the same transfer. The priority is plain
/// data; a priority upgrade is expressed by replacing the queued entry with
/// a new item carrying the same id (see the scheduler contract).
#[derive(Debug, Clone)]
pub struct DownloadItem {
    id: String,
    location: Url,
    priority: i64,
    progress: Arc<TransferProgress>,
    cancel: CancellationToken,
}

impl DownloadItem {
    /// Creates a work item for a source location with priority 0.
    #[must_use]
    pub fn new(id: impl Into<String>, location: Url) -> Self {
        Self {
            id: id.into(),
            location,
            priority: 0,
            progress: Arc::new(TransferProgress::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Returns a copy of this item at a different priority.
    ///
    /// The progress record and cancel token are shared with the original,
    /// so the copy still refers to the same transfer attempt.
    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Stable identifier, shared across retries of the same mirror.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The source location to fetch.
    #[must_use]
    pub fn location(&self) -> &Url {
        &self.location
    }

    /// The location's scheme, used by processors to accept or decline work.
    #[must_use]
    pub fn scheme(&self) -> &str {
        self.location.scheme()
    }

    /// Dispatch priority; higher dispatches sooner.
    #[must_use]
    pub fn item_priority(&self) -> i64 {
        self.priority
    }

    /// The shared byte-count progress record.
    #[must_use]
    pub fn progress(&self) -> &Arc<TransferProgress> {
        &self.progress
    }

    /// Handle used by transports to observe cancellation.
    #[must_use]
    pub fn cancel_handle(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Requests cancellation of the transfer (best-effort).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Prioritized for DownloadItem {
    fn priority(&self) -> i64 {
        self.priority
    }
}

impl fmt::Display for DownloadItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DownloadItem {{ id: {}, location: {}, priority: {} }}",
            self.id, self.location, self.priority
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn item(id: &str) -> DownloadItem {
        DownloadItem::new(id, Url::parse("https://example.com/a.bin").unwrap())
    }

    // ==================== TransferProgress Tests ====================

    #[test]
    fn test_progress_starts_at_zero() {
        let progress = TransferProgress::new();
        assert_eq!(progress.total_bytes(), 0);
        assert_eq!(progress.completed_bytes(), 0);
        assert!((progress.fraction_completed() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_progress_accumulates() {
        let progress = TransferProgress::new();
        progress.set_total_bytes(100);
        assert_eq!(progress.add_completed_bytes(30), 30);
        assert_eq!(progress.add_completed_bytes(20), 50);
        assert!((progress.fraction_completed() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_progress_fraction_clamped() {
        let progress = TransferProgress::new();
        progress.set_total_bytes(10);
        progress.add_completed_bytes(25);
        assert!((progress.fraction_completed() - 1.0).abs() < f64::EPSILON);
    }

    // ==================== DownloadItem Tests ====================

    #[test]
    fn test_item_accessors() {
        let item = item("res-1/m1").with_priority(100);
        assert_eq!(item.id(), "res-1/m1");
        assert_eq!(item.scheme(), "https");
        assert_eq!(item.item_priority(), 100);
    }

    #[test]
    fn test_with_priority_shares_transfer_state() {
        let original = item("res-1/m1");
        let upgraded = original.clone().with_priority(100);

        original.progress().add_completed_bytes(42);
        assert_eq!(upgraded.progress().completed_bytes(), 42);

        upgraded.cancel();
        assert!(original.is_cancelled());
    }

    #[test]
    fn test_cancel_is_observable() {
        let item = item("res-1/m1");
        assert!(!item.is_cancelled());
        item.cancel();
        assert!(item.is_cancelled());
        assert!(item.cancel_handle().is_cancelled());
    }

    #[test]
    fn test_display_contains_id_and_priority() {
        let display = item("res-9/m0").with_priority(5).to_string();
        assert!(display.contains("res-9/m0"));
        assert!(display.contains('5'));
    }
}
