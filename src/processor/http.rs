//! HTTP transport processor built on a shared `reqwest` client.
//!
//! Streams response bodies to a `.part` file in the processor's working
//! directory and hands the temp file over through the transfer event
//! stream. Designed to be created once and registered with a scheduler;
//! the underlying client pools connections across transfers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument, warn};

use crate::error::DownloadError;
use crate::fsname::sanitize_component;
use crate::item::DownloadItem;
use crate::processor::{DownloadProcessor, TransferEventSink};

/// Connection establishment timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Whole-request timeout, sized for large files.
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Emit a `DataTransferred` tick at most once per this many bytes.
const PROGRESS_TICK_BYTES: u64 = 256 * 1024;

/// Processor for `http` and `https` work items.
#[derive(Debug)]
pub struct HttpProcessor {
    client: Client,
    work_dir: PathBuf,
    active: AtomicBool,
    transfers: Arc<AtomicUsize>,
}

/// Counts a streaming transfer for the lifetime of the guard.
struct ActiveTransfer(Arc<AtomicUsize>);

impl ActiveTransfer {
    fn begin(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveTransfer {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl HttpProcessor {
    /// Creates a processor writing temp files under `work_dir`.
    ///
    /// The directory is created lazily on first transfer. For atomic
    /// promotion it should live on the same volume as the cache directory.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self::with_client(client, work_dir)
    }

    /// Creates a processor over a caller-configured client.
    #[must_use]
    pub fn with_client(client: Client, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            work_dir: work_dir.into(),
            active: AtomicBool::new(true),
            transfers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of transfers currently streaming.
    #[must_use]
    pub fn transfer_count(&self) -> usize {
        self.transfers.load(Ordering::SeqCst)
    }

    fn temp_path(&self, item: &DownloadItem) -> PathBuf {
        self.work_dir
            .join(format!("{}.part", sanitize_component(item.id())))
    }
}

#[async_trait]
impl DownloadProcessor for HttpProcessor {
    fn can_process(&self, item: &DownloadItem) -> bool {
        self.is_active() && matches!(item.scheme(), "http" | "https")
    }

    #[instrument(skip(self, events), fields(item_id = %item.id(), url = %item.location()))]
    async fn process(&self, item: DownloadItem, events: TransferEventSink) {
        let client = self.client.clone();
        let temp_path = self.temp_path(&item);
        let work_dir = self.work_dir.clone();
        let guard = ActiveTransfer::begin(&self.transfers);

        tokio::spawn(async move {
            let _guard = guard;
            events.began(item.clone());
            match stream_to_file(&client, &work_dir, &temp_path, &item, &events).await {
                Ok(()) => {
                    debug!(item_id = %item.id(), temp = %temp_path.display(), "transfer complete");
                    events
                        .transfer_finished(item.clone(), temp_path.clone())
                        .await;
                    // Consumer has moved the file (or given up); reclaim leftovers.
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    events.finished(item);
                }
                Err(error) => {
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    warn!(item_id = %item.id(), error = %error, "transfer failed");
                    events.errored(item, error);
                }
            }
        });
    }

    async fn enqueue_pending(&self, _events: TransferEventSink) {
        // This transport never resumes transfers out of band; nothing to
        // reconcile.
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

/// Streams the response body for `item` into `temp_path`.
async fn stream_to_file(
    client: &Client,
    work_dir: &Path,
    temp_path: &Path,
    item: &DownloadItem,
    events: &TransferEventSink,
) -> Result<(), DownloadError> {
    let url = item.location().clone();

    let response = tokio::select! {
        biased;
        () = item.cancel_handle().cancelled() => {
            return Err(DownloadError::cancelled(item.id()));
        }
        result = client.get(url.clone()).send() => {
            result.map_err(|e| map_request_error(url.as_str(), e))?
        }
    };

    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::http_status(url.as_str(), status.as_u16()));
    }

    if let Some(len) = response.content_length() {
        item.progress().set_total_bytes(len);
    }

    tokio::fs::create_dir_all(work_dir)
        .await
        .map_err(|e| DownloadError::filesystem(work_dir, e))?;
    let file = File::create(temp_path)
        .await
        .map_err(|e| DownloadError::filesystem(temp_path, e))?;
    let mut writer = BufWriter::new(file);

    let mut stream = response.bytes_stream();
    let mut started = false;
    let mut bytes_since_tick = 0u64;

    loop {
        let chunk = tokio::select! {
            biased;
            () = item.cancel_handle().cancelled() => {
                return Err(DownloadError::cancelled(item.id()));
            }
            chunk = stream.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                if !started {
                    events.transfer_started(item.clone());
                    started = true;
                }
                writer
                    .write_all(&bytes)
                    .await
                    .map_err(|e| DownloadError::filesystem(temp_path, e))?;
                let len = bytes.len() as u64;
                item.progress().add_completed_bytes(len);
                bytes_since_tick += len;
                if bytes_since_tick >= PROGRESS_TICK_BYTES {
                    events.data_transferred(item.clone());
                    bytes_since_tick = 0;
                }
            }
            Some(Err(e)) => return Err(map_request_error(url.as_str(), e)),
            None => break,
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::filesystem(temp_path, e))?;
    Ok(())
}

/// Maps a reqwest error to the crate taxonomy, distinguishing timeouts.
fn map_request_error(url: &str, error: reqwest::Error) -> DownloadError {
    if error.is_timeout() {
        DownloadError::timeout(url)
    } else {
        DownloadError::network(url, error)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use url::Url;

    fn item(id: &str, url: &str) -> DownloadItem {
        DownloadItem::new(id, Url::parse(url).unwrap())
    }

    #[test]
    fn test_can_process_by_scheme() {
        let processor = HttpProcessor::new("/tmp/fetchkit-test");
        assert!(processor.can_process(&item("a", "https://example.com/a.bin")));
        assert!(processor.can_process(&item("a", "http://example.com/a.bin")));
        assert!(!processor.can_process(&item("a", "asset://bucket/a.bin")));
    }

    #[test]
    fn test_pause_stops_accepting_work() {
        let processor = HttpProcessor::new("/tmp/fetchkit-test");
        let item = item("a", "https://example.com/a.bin");

        processor.pause();
        assert!(!processor.is_active());
        assert!(!processor.can_process(&item));

        processor.resume();
        assert!(processor.is_active());
        assert!(processor.can_process(&item));
    }

    #[test]
    fn test_temp_path_sanitizes_item_id() {
        let processor = HttpProcessor::new("/tmp/fetchkit-test");
        let path = processor.temp_path(&item("res-1/m one", "https://example.com/a"));
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "res-1_m_one.part"
        );
    }
}
