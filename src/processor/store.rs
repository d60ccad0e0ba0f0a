//! Object-store transport processor.
//!
//! Covers cloud asset fetches without binding the core to a vendor SDK:
//! the caller supplies an [`ObjectStore`] that knows how to resolve a
//! location into bytes on disk, and the processor wraps it with the
//! lifecycle, cancellation, and temp-file handover the scheduler expects.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{instrument, warn};
use url::Url;

use crate::error::DownloadError;
use crate::fsname::sanitize_component;
use crate::item::DownloadItem;
use crate::processor::{DownloadProcessor, TransferEventSink};

/// A pluggable backend resolving store locations into local bytes.
///
/// Implementations fetch the object at `location` into `dest`, returning
/// the byte count written. They are expected to be thread-safe and may be
/// called concurrently for distinct items.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// The URL scheme this store serves (e.g. `asset`).
    fn scheme(&self) -> &str;

    /// Fetches the object into `dest`, returning the bytes written.
    async fn fetch(&self, location: &Url, dest: &Path) -> Result<u64, DownloadError>;
}

/// Processor for work items served by an [`ObjectStore`].
pub struct ObjectStoreProcessor {
    store: Arc<dyn ObjectStore>,
    work_dir: PathBuf,
    active: AtomicBool,
}

impl ObjectStoreProcessor {
    /// Creates a processor fetching through `store` into `work_dir`.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            work_dir: work_dir.into(),
            active: AtomicBool::new(true),
        }
    }

    fn temp_path(&self, item: &DownloadItem) -> PathBuf {
        self.work_dir
            .join(format!("{}.part", sanitize_component(item.id())))
    }
}

impl std::fmt::Debug for ObjectStoreProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreProcessor")
            .field("scheme", &self.store.scheme())
            .field("work_dir", &self.work_dir)
            .field("active", &self.active)
            .finish()
    }
}

#[async_trait]
impl DownloadProcessor for ObjectStoreProcessor {
    fn can_process(&self, item: &DownloadItem) -> bool {
        self.is_active() && item.scheme() == self.store.scheme()
    }

    #[instrument(skip(self, events), fields(item_id = %item.id(), location = %item.location()))]
    async fn process(&self, item: DownloadItem, events: TransferEventSink) {
        let store = Arc::clone(&self.store);
        let temp_path = self.temp_path(&item);
        let work_dir = self.work_dir.clone();

        tokio::spawn(async move {
            events.began(item.clone());
            match fetch_to_file(store.as_ref(), &work_dir, &temp_path, &item, &events).await {
                Ok(()) => {
                    events
                        .transfer_finished(item.clone(), temp_path.clone())
                        .await;
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    events.finished(item);
                }
                Err(error) => {
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    warn!(item_id = %item.id(), error = %error, "store fetch failed");
                    events.errored(item, error);
                }
            }
        });
    }

    async fn enqueue_pending(&self, _events: TransferEventSink) {
        // Store fetches are always initiated by the scheduler; there is no
        // out-of-band session to reconcile.
    }

    fn pause(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Runs one store fetch with cancellation and progress accounting.
async fn fetch_to_file(
    store: &dyn ObjectStore,
    work_dir: &Path,
    temp_path: &Path,
    item: &DownloadItem,
    events: &TransferEventSink,
) -> Result<(), DownloadError> {
    tokio::fs::create_dir_all(work_dir)
        .await
        .map_err(|e| DownloadError::filesystem(work_dir, e))?;

    events.transfer_started(item.clone());

    let bytes = tokio::select! {
        biased;
        () = item.cancel_handle().cancelled() => {
            return Err(DownloadError::cancelled(item.id()));
        }
        result = store.fetch(item.location(), temp_path) => result?,
    };

    item.progress().set_total_bytes(bytes);
    item.progress().add_completed_bytes(bytes);
    events.data_transferred(item.clone());
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::processor::TransferEvent;

    struct FixedStore {
        payload: &'static [u8],
    }

    #[async_trait]
    impl ObjectStore for FixedStore {
        fn scheme(&self) -> &str {
            "asset"
        }

        async fn fetch(&self, _location: &Url, dest: &Path) -> Result<u64, DownloadError> {
            tokio::fs::write(dest, self.payload)
                .await
                .map_err(|e| DownloadError::filesystem(dest, e))?;
            Ok(self.payload.len() as u64)
        }
    }

    struct FailingStore;

    #[async_trait]
    impl ObjectStore for FailingStore {
        fn scheme(&self) -> &str {
            "asset"
        }

        async fn fetch(&self, location: &Url, _dest: &Path) -> Result<u64, DownloadError> {
            Err(DownloadError::store(location.as_str(), "bucket offline"))
        }
    }

    fn item(id: &str, url: &str) -> DownloadItem {
        DownloadItem::new(id, Url::parse(url).unwrap())
    }

    #[test]
    fn test_can_process_matches_store_scheme() {
        let processor = ObjectStoreProcessor::new(
            Arc::new(FixedStore { payload: b"x" }),
            "/tmp/fetchkit-test",
        );
        assert!(processor.can_process(&item("a", "asset://bucket/a.bin")));
        assert!(!processor.can_process(&item("a", "https://example.com/a.bin")));

        processor.pause();
        assert!(!processor.can_process(&item("a", "asset://bucket/a.bin")));
    }

    #[tokio::test]
    async fn test_fetch_hands_over_temp_file_and_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let processor =
            ObjectStoreProcessor::new(Arc::new(FixedStore { payload: b"hello" }), dir.path());
        let (sink, mut events) = TransferEventSink::channel();
        let item = item("res-1/m1", "asset://bucket/a.bin");

        processor.process(item.clone(), sink).await;

        // Began, TransferStarted, DataTransferred, then the handover.
        loop {
            match events.recv().await.unwrap() {
                TransferEvent::TransferFinished {
                    item: finished,
                    temp_path,
                    ack,
                } => {
                    assert_eq!(finished.id(), "res-1/m1");
                    let contents = tokio::fs::read(&temp_path).await.unwrap();
                    assert_eq!(contents, b"hello");
                    assert_eq!(finished.progress().completed_bytes(), 5);
                    ack.send(()).unwrap();
                    break;
                }
                TransferEvent::Errored { error, .. } => panic!("unexpected error: {error}"),
                _ => {}
            }
        }

        // Post-consume signal follows the ack.
        loop {
            match events.recv().await.unwrap() {
                TransferEvent::Finished { item: done } => {
                    assert_eq!(done.id(), "res-1/m1");
                    break;
                }
                TransferEvent::Errored { error, .. } => panic!("unexpected error: {error}"),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_terminal_errored() {
        let dir = tempfile::tempdir().unwrap();
        let processor = ObjectStoreProcessor::new(Arc::new(FailingStore), dir.path());
        let (sink, mut events) = TransferEventSink::channel();

        processor
            .process(item("res-1/m1", "asset://bucket/a.bin"), sink)
            .await;

        loop {
            match events.recv().await.unwrap() {
                TransferEvent::Errored { error, .. } => {
                    assert!(matches!(error, DownloadError::Store { .. }));
                    break;
                }
                TransferEvent::TransferFinished { .. } => panic!("expected failure"),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_fetch_reports_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let processor = ObjectStoreProcessor::new(Arc::new(FixedStore { payload: b"x" }), dir.path());
        let (sink, mut events) = TransferEventSink::channel();
        let item = item("res-1/m1", "asset://bucket/a.bin");
        item.cancel();

        processor.process(item, sink).await;

        loop {
            match events.recv().await.unwrap() {
                TransferEvent::Errored { error, .. } => {
                    assert!(error.is_cancelled());
                    break;
                }
                TransferEvent::TransferFinished { .. } => panic!("expected cancellation"),
                _ => {}
            }
        }
    }
}
