//! Stub transport processors for exercising the scheduler and manager.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use fetchkit_core::{DownloadError, DownloadItem, DownloadProcessor, TransferEventSink};

fn temp_name(item: &DownloadItem) -> String {
    let id: String = item
        .id()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("{id}.part")
}

/// Accepts every item and succeeds by spooling a fixed payload to a temp
/// file, emitting the full lifecycle.
pub struct SpoolProcessor {
    work_dir: PathBuf,
    payload: Vec<u8>,
    active: AtomicBool,
    processed: AtomicUsize,
}

impl SpoolProcessor {
    pub fn new(work_dir: impl Into<PathBuf>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            work_dir: work_dir.into(),
            payload: payload.into(),
            active: AtomicBool::new(true),
            processed: AtomicUsize::new(0),
        }
    }

    /// Number of items this processor has been handed.
    pub fn processed_count(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    async fn spool(
        work_dir: &PathBuf,
        payload: &[u8],
        item: &DownloadItem,
        events: &TransferEventSink,
    ) -> Result<PathBuf, DownloadError> {
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|e| DownloadError::filesystem(work_dir, e))?;
        let temp_path = work_dir.join(temp_name(item));
        tokio::fs::write(&temp_path, payload)
            .await
            .map_err(|e| DownloadError::filesystem(&temp_path, e))?;

        events.transfer_started(item.clone());
        item.progress().set_total_bytes(payload.len() as u64);
        item.progress().add_completed_bytes(payload.len() as u64);
        events.data_transferred(item.clone());
        Ok(temp_path)
    }
}

#[async_trait]
impl DownloadProcessor for SpoolProcessor {
    fn can_process(&self, _item: &DownloadItem) -> bool {
        self.is_active()
    }

    async fn process(&self, item: DownloadItem, events: TransferEventSink) {
        self.processed.fetch_add(1, Ordering::SeqCst);
        let work_dir = self.work_dir.clone();
        let payload = self.payload.clone();
        tokio::spawn(async move {
            events.began(item.clone());
            match Self::spool(&work_dir, &payload, &item, &events).await {
                Ok(temp_path) => {
                    events.transfer_finished(item.clone(), temp_path.clone()).await;
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    events.finished(item);
                }
                Err(error) => events.errored(item, error),
            }
        });
    }

    async fn enqueue_pending(&self, _events: TransferEventSink) {}

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

/// Fails items whose location host is in the failing set with a transient
/// HTTP 503; succeeds everything else like [`SpoolProcessor`].
pub struct FailingHostsProcessor {
    spool: SpoolProcessor,
    failing_hosts: HashSet<String>,
    failures: AtomicUsize,
}

impl FailingHostsProcessor {
    pub fn new(
        work_dir: impl Into<PathBuf>,
        payload: impl Into<Vec<u8>>,
        failing_hosts: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            spool: SpoolProcessor::new(work_dir, payload),
            failing_hosts: failing_hosts.into_iter().collect(),
            failures: AtomicUsize::new(0),
        }
    }

    /// Number of simulated transport failures emitted so far.
    pub fn failure_count(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DownloadProcessor for FailingHostsProcessor {
    fn can_process(&self, item: &DownloadItem) -> bool {
        self.spool.can_process(item)
    }

    async fn process(&self, item: DownloadItem, events: TransferEventSink) {
        let failing = item
            .location()
            .host_str()
            .is_some_and(|host| self.failing_hosts.contains(host));
        if failing {
            self.failures.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                events.began(item.clone());
                let error = DownloadError::http_status(item.location().as_str(), 503);
                events.errored(item, error);
            });
        } else {
            self.spool.process(item, events).await;
        }
    }

    async fn enqueue_pending(&self, _events: TransferEventSink) {}

    fn pause(&self) {
        self.spool.pause();
    }

    fn resume(&self) {
        self.spool.resume();
    }

    fn is_active(&self) -> bool {
        self.spool.is_active()
    }
}

/// Accepts items, reports a transfer start, then parks until the item is
/// cancelled and reports the cancellation.
pub struct CancelAwareProcessor;

#[async_trait]
impl DownloadProcessor for CancelAwareProcessor {
    fn can_process(&self, _item: &DownloadItem) -> bool {
        true
    }

    async fn process(&self, item: DownloadItem, events: TransferEventSink) {
        tokio::spawn(async move {
            events.began(item.clone());
            events.transfer_started(item.clone());
            item.cancel_handle().cancelled().await;
            let error = DownloadError::cancelled(item.id());
            events.errored(item, error);
        });
    }

    async fn enqueue_pending(&self, _events: TransferEventSink) {}

    fn pause(&self) {}

    fn resume(&self) {}

    fn is_active(&self) -> bool {
        true
    }
}
