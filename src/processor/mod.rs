//! Transport processors: the components that actually move bytes.
//!
//! A [`DownloadProcessor`] abstracts one transport (HTTP, object store).
//! Processors do not hold a pointer back into the scheduler; lifecycle
//! reporting flows through a [`TransferEventSink`] handed to them per call,
//! and the scheduler consumes the resulting [`TransferEvent`] stream on its
//! own task.
//!
//! # Contract
//!
//! - `process` must return promptly (spawn the transfer onto a task) and
//!   the transfer must eventually emit exactly one terminal event for the
//!   item: `TransferFinished` or `Errored`.
//! - `TransferFinished` hands over a temporary file. The transport awaits
//!   the event's ack before reclaiming the temp location, so the consumer
//!   can move the file into place first.
//! - `pause` stops accepting new work (`can_process` returns false);
//!   in-flight transfers continue.

mod http;
mod store;

pub use http::HttpProcessor;
pub use store::{ObjectStore, ObjectStoreProcessor};

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::error::DownloadError;
use crate::item::DownloadItem;

/// Lifecycle events a transport emits for a work item.
#[derive(Debug)]
pub enum TransferEvent {
    /// The item was accepted by the transport.
    Began {
        /// The accepted item.
        item: DownloadItem,
    },

    /// First bytes observed.
    TransferStarted {
        /// The transferring item.
        item: DownloadItem,
    },

    /// Periodic progress tick; byte counts live on the item's progress record.
    DataTransferred {
        /// The transferring item.
        item: DownloadItem,
    },

    /// Bytes written to a temporary location; terminal on the success path.
    ///
    /// The transport awaits `ack` before reclaiming `temp_path`; the
    /// consumer must move or consume the file before acking.
    TransferFinished {
        /// The completed item.
        item: DownloadItem,
        /// Temporary file holding the transferred bytes.
        temp_path: PathBuf,
        /// Ack the transport awaits before reclaiming the temp file.
        ack: oneshot::Sender<()>,
    },

    /// Terminal failure; cancellation arrives as `DownloadError::Cancelled`.
    Errored {
        /// The failed item.
        item: DownloadItem,
        /// What went wrong.
        error: DownloadError,
    },

    /// Post-consume signal after the temp file was handed over.
    Finished {
        /// The fully finished item.
        item: DownloadItem,
    },
}

impl TransferEvent {
    /// The item this event concerns.
    #[must_use]
    pub fn item(&self) -> &DownloadItem {
        match self {
            Self::Began { item }
            | Self::TransferStarted { item }
            | Self::DataTransferred { item }
            | Self::TransferFinished { item, .. }
            | Self::Errored { item, .. }
            | Self::Finished { item } => item,
        }
    }
}

/// Capability handle transports use to report lifecycle events.
///
/// Clones share the same consumer. Sends are fire-and-forget except
/// [`TransferEventSink::transfer_finished`], which waits for the consumer
/// to take ownership of the temp file.
#[derive(Debug, Clone)]
pub struct TransferEventSink {
    tx: mpsc::UnboundedSender<TransferEvent>,
}

impl TransferEventSink {
    /// Creates a sink plus the receiving end the scheduler drains.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: TransferEvent) {
        if self.tx.send(event).is_err() {
            warn!("transfer event dropped: scheduler stopped");
        }
    }

    /// Reports that the transport accepted the item.
    pub fn began(&self, item: DownloadItem) {
        self.send(TransferEvent::Began { item });
    }

    /// Reports the first observed bytes.
    pub fn transfer_started(&self, item: DownloadItem) {
        self.send(TransferEvent::TransferStarted { item });
    }

    /// Reports a progress tick.
    pub fn data_transferred(&self, item: DownloadItem) {
        self.send(TransferEvent::DataTransferred { item });
    }

    /// Hands over the transferred bytes and waits until the consumer has
    /// moved or consumed the temp file.
    ///
    /// Returns once the consumer acks (or is gone); after this the caller
    /// may reclaim `temp_path`.
    pub async fn transfer_finished(&self, item: DownloadItem, temp_path: PathBuf) {
        let (ack, consumed) = oneshot::channel();
        self.send(TransferEvent::TransferFinished {
            item,
            temp_path,
            ack,
        });
        // A dropped ack means the consumer is gone; nothing left to wait for.
        let _ = consumed.await;
    }

    /// Reports a terminal failure.
    pub fn errored(&self, item: DownloadItem, error: DownloadError) {
        self.send(TransferEvent::Errored { item, error });
    }

    /// Reports the post-consume completion signal.
    pub fn finished(&self, item: DownloadItem) {
        self.send(TransferEvent::Finished { item });
    }
}

/// A transport that moves bytes for work items whose scheme it recognizes.
#[async_trait]
pub trait DownloadProcessor: Send + Sync {
    /// True iff this processor recognizes the item's source scheme and can
    /// currently accept work (false while paused).
    fn can_process(&self, item: &DownloadItem) -> bool;

    /// Begins transferring the item, reporting lifecycle through `events`.
    ///
    /// Must return promptly; the transfer runs on its own task and emits
    /// exactly one terminal event unless cancelled first.
    async fn process(&self, item: DownloadItem, events: TransferEventSink);

    /// Reattaches to any out-of-band transfers the transport resumed on its
    /// own, reporting them through `events`; returns once reconciliation is
    /// done.
    async fn enqueue_pending(&self, events: TransferEventSink);

    /// Stops initiating new transfers; in-flight transfers continue.
    fn pause(&self);

    /// Resumes accepting new transfers.
    fn resume(&self);

    /// True while the processor accepts new work.
    fn is_active(&self) -> bool;
}
