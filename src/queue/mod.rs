//! Bounded-concurrency download scheduler.
//!
//! [`DownloadQueue`] dispatches work items to registered transport
//! processors in priority order, bounds the number of simultaneous
//! transfers, and tracks queued vs in-flight state. All mutable state
//! lives on a single actor task; handles are cheap clones that talk to it
//! over a command channel, so access is serialized without shared locks.
//!
//! # Ordering
//!
//! Between two items with distinct priorities submitted before any
//! dispatch, the higher priority dispatches first. Equal priorities
//! dispatch in enqueue order. Re-submitting a queued id at a higher
//! priority replaces the queued entry (priority upgrade); at equal or
//! lower priority it is a no-op.
//!
//! # Outputs
//!
//! Terminal outcomes flow to the owning layer on the [`SchedulerEvent`]
//! stream (taken once via [`DownloadQueue::take_event_stream`]). Observers
//! can additionally subscribe to broadcast [`DownloadNotification`]s.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::DownloadError;
use crate::item::DownloadItem;
use crate::pqueue::PriorityQueue;
use crate::processor::{DownloadProcessor, TransferEvent, TransferEventSink};

/// Default cap on simultaneous transfers.
pub const DEFAULT_SIMULTANEOUS_DOWNLOADS: usize = 20;

/// Broadcast buffer for observer notifications.
const NOTIFICATION_CAPACITY: usize = 256;

/// Scheduler construction options.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct QueueOptions {
    /// Maximum transfers in flight at once; 0 dispatches nothing.
    pub simultaneous_downloads: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            simultaneous_downloads: DEFAULT_SIMULTANEOUS_DOWNLOADS,
        }
    }
}

/// Scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueMetrics {
    /// Items handed to a processor.
    pub processed: u64,
    /// Items that terminated in failure (including cancellation and
    /// missing-processor rejections).
    pub failed: u64,
    /// Items whose transfer finished.
    pub completed: u64,
}

/// Terminal and lifecycle outcomes delivered to the scheduler's owner.
#[derive(Debug)]
pub enum SchedulerEvent {
    /// The item was handed to a processor.
    Started {
        /// The dispatched item.
        item: DownloadItem,
    },
    /// First bytes observed for the item.
    TransferStarted {
        /// The transferring item.
        item: DownloadItem,
    },
    /// The transfer finished into a temp file.
    ///
    /// Consume or move the file, then ack; the transport reclaims the
    /// temp location afterwards.
    Finished {
        /// The finished item.
        item: DownloadItem,
        /// Temporary file holding the bytes.
        temp_path: PathBuf,
        /// Ack forwarded to the waiting transport.
        ack: oneshot::Sender<()>,
    },
    /// The item terminated in failure.
    Failed {
        /// The failed item.
        item: DownloadItem,
        /// What went wrong (shared with the error notification).
        error: Arc<DownloadError>,
    },
}

/// Observer notification kinds, named after the emitted events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// An item was handed to a processor.
    Started,
    /// First bytes were observed.
    TransferStarted,
    /// A transfer finished.
    Finished,
    /// An item terminated in failure.
    Errored,
}

impl NotificationKind {
    /// The stable notification name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Started => "download.started",
            Self::TransferStarted => "download.started_transfer",
            Self::Finished => "download.finished",
            Self::Errored => "download.error",
        }
    }
}

/// Broadcast payload for observers; errors ride along on failures.
#[derive(Debug, Clone)]
pub struct DownloadNotification {
    /// What happened.
    pub kind: NotificationKind,
    /// The item concerned.
    pub item: DownloadItem,
    /// The failure, present for [`NotificationKind::Errored`].
    pub error: Option<Arc<DownloadError>>,
}

enum Command {
    Add(Arc<dyn DownloadProcessor>),
    Download(Vec<DownloadItem>),
    Cancel(Vec<String>),
    CancelAll,
    CancelCurrent,
    Pause,
    Resume,
    EnqueuePending(oneshot::Sender<()>),
    HasItem(String, oneshot::Sender<bool>),
    Item(String, oneshot::Sender<Option<DownloadItem>>),
    IsDownloading(String, oneshot::Sender<bool>),
    Downloads(oneshot::Sender<Vec<DownloadItem>>),
    CurrentDownloads(oneshot::Sender<Vec<DownloadItem>>),
    QueuedDownloads(oneshot::Sender<Vec<DownloadItem>>),
    CurrentMaxPriority(oneshot::Sender<i64>),
    Metrics(oneshot::Sender<QueueMetrics>),
    IsActive(oneshot::Sender<bool>),
}

/// Handle to a scheduler actor; clones address the same scheduler.
#[derive(Clone)]
pub struct DownloadQueue {
    commands: mpsc::UnboundedSender<Command>,
    notifications: broadcast::Sender<DownloadNotification>,
    events: Arc<Mutex<Option<mpsc::UnboundedReceiver<SchedulerEvent>>>>,
}

impl std::fmt::Debug for DownloadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadQueue").finish_non_exhaustive()
    }
}

impl DownloadQueue {
    /// Creates a scheduler and spawns its actor task.
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn new(options: QueueOptions) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notifications_tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (transfer_sink, transfers_rx) = TransferEventSink::channel();

        let scheduler = Scheduler {
            heap: PriorityQueue::new(),
            queued: HashMap::new(),
            in_flight: HashMap::new(),
            processors: Vec::new(),
            simultaneous: options.simultaneous_downloads,
            is_active: true,
            metrics: QueueMetrics::default(),
            events: events_tx,
            notifications: notifications_tx.clone(),
            transfer_sink,
        };
        tokio::spawn(scheduler.run(commands_rx, transfers_rx));

        Self {
            commands: commands_tx,
            notifications: notifications_tx,
            events: Arc::new(Mutex::new(Some(events_rx))),
        }
    }

    /// Takes the scheduler's outcome stream; only the first call succeeds.
    #[must_use]
    pub fn take_event_stream(&self) -> Option<mpsc::UnboundedReceiver<SchedulerEvent>> {
        match self.events.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Subscribes to observer notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadNotification> {
        self.notifications.subscribe()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("scheduler command dropped: actor stopped");
        }
    }

    async fn query<T>(&self, command: Command, reply: oneshot::Receiver<T>, default: T) -> T {
        self.send(command);
        reply.await.unwrap_or(default)
    }

    /// Registers a processor; earlier registrations take precedence when
    /// several accept the same item.
    pub fn add(&self, processor: Arc<dyn DownloadProcessor>) {
        self.send(Command::Add(processor));
    }

    /// Submits a work item; see the module docs for upgrade semantics.
    pub fn download(&self, item: DownloadItem) {
        self.send(Command::Download(vec![item]));
    }

    /// Submits a batch of work items in order.
    pub fn download_many(&self, items: Vec<DownloadItem>) {
        self.send(Command::Download(items));
    }

    /// Cancels a queued or in-flight item by id (best-effort).
    pub fn cancel(&self, id: impl Into<String>) {
        self.send(Command::Cancel(vec![id.into()]));
    }

    /// Cancels a batch of items by id.
    pub fn cancel_many(&self, ids: Vec<String>) {
        self.send(Command::Cancel(ids));
    }

    /// Cancels everything queued and in flight.
    pub fn cancel_all(&self) {
        self.send(Command::CancelAll);
    }

    /// Cancels in-flight transfers only.
    pub fn cancel_current(&self) {
        self.send(Command::CancelCurrent);
    }

    /// Stops dispatching and pauses all processors.
    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    /// Resumes dispatching and all processors.
    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    /// Asks every processor to reattach out-of-band transfers; returns
    /// once all processors reported reconciliation done.
    pub async fn enqueue_pending(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(Command::EnqueuePending(tx));
        let _ = rx.await;
    }

    /// True when the id is queued or in flight.
    pub async fn has_item(&self, id: impl Into<String>) -> bool {
        let (tx, rx) = oneshot::channel();
        self.query(Command::HasItem(id.into(), tx), rx, false).await
    }

    /// Snapshot of the item with this id, queued or in flight.
    pub async fn item(&self, id: impl Into<String>) -> Option<DownloadItem> {
        let (tx, rx) = oneshot::channel();
        self.query(Command::Item(id.into(), tx), rx, None).await
    }

    /// True when the id is currently in flight.
    pub async fn is_downloading(&self, id: impl Into<String>) -> bool {
        let (tx, rx) = oneshot::channel();
        self.query(Command::IsDownloading(id.into(), tx), rx, false)
            .await
    }

    /// Snapshot of all queued and in-flight items.
    pub async fn downloads(&self) -> Vec<DownloadItem> {
        let (tx, rx) = oneshot::channel();
        self.query(Command::Downloads(tx), rx, Vec::new()).await
    }

    /// Snapshot of in-flight items.
    pub async fn current_downloads(&self) -> Vec<DownloadItem> {
        let (tx, rx) = oneshot::channel();
        self.query(Command::CurrentDownloads(tx), rx, Vec::new())
            .await
    }

    /// Snapshot of queued (not yet dispatched) items.
    pub async fn queued_downloads(&self) -> Vec<DownloadItem> {
        let (tx, rx) = oneshot::channel();
        self.query(Command::QueuedDownloads(tx), rx, Vec::new())
            .await
    }

    /// Priority of the top queued item, 0 when the queue is empty.
    pub async fn current_max_priority(&self) -> i64 {
        let (tx, rx) = oneshot::channel();
        self.query(Command::CurrentMaxPriority(tx), rx, 0).await
    }

    /// Snapshot of the scheduler counters.
    pub async fn metrics(&self) -> QueueMetrics {
        let (tx, rx) = oneshot::channel();
        self.query(Command::Metrics(tx), rx, QueueMetrics::default())
            .await
    }

    /// True while the scheduler dispatches new work.
    pub async fn is_active(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        self.query(Command::IsActive(tx), rx, false).await
    }
}

/// Actor owning all scheduler state.
struct Scheduler {
    heap: PriorityQueue<DownloadItem>,
    queued: HashMap<String, DownloadItem>,
    in_flight: HashMap<String, DownloadItem>,
    processors: Vec<Arc<dyn DownloadProcessor>>,
    simultaneous: usize,
    is_active: bool,
    metrics: QueueMetrics,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    notifications: broadcast::Sender<DownloadNotification>,
    transfer_sink: TransferEventSink,
}

impl Scheduler {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transfers: mpsc::UnboundedReceiver<TransferEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    // All handles dropped; stop scheduling.
                    None => break,
                },
                Some(event) = transfers.recv() => self.handle_transfer_event(event).await,
            }
        }
        debug!("scheduler actor stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Add(processor) => {
                self.processors.push(processor);
                self.dispatch().await;
            }
            Command::Download(items) => {
                for item in items {
                    self.admit(item);
                }
                self.dispatch().await;
            }
            Command::Cancel(ids) => self.handle_cancel(ids),
            Command::CancelAll => {
                let ids: Vec<String> = self
                    .queued
                    .keys()
                    .chain(self.in_flight.keys())
                    .cloned()
                    .collect();
                self.handle_cancel(ids);
            }
            Command::CancelCurrent => {
                for item in self.in_flight.values() {
                    item.cancel();
                }
            }
            Command::Pause => {
                self.is_active = false;
                for processor in &self.processors {
                    processor.pause();
                }
            }
            Command::Resume => {
                self.is_active = true;
                for processor in &self.processors {
                    processor.resume();
                }
                self.dispatch().await;
            }
            Command::EnqueuePending(done) => {
                for processor in &self.processors {
                    processor.enqueue_pending(self.transfer_sink.clone()).await;
                }
                let _ = done.send(());
            }
            Command::HasItem(id, reply) => {
                let _ =
                    reply.send(self.queued.contains_key(&id) || self.in_flight.contains_key(&id));
            }
            Command::Item(id, reply) => {
                let item = self
                    .in_flight
                    .get(&id)
                    .or_else(|| self.queued.get(&id))
                    .cloned();
                let _ = reply.send(item);
            }
            Command::IsDownloading(id, reply) => {
                let _ = reply.send(self.in_flight.contains_key(&id));
            }
            Command::Downloads(reply) => {
                let snapshot = self
                    .in_flight
                    .values()
                    .chain(self.queued.values())
                    .cloned()
                    .collect();
                let _ = reply.send(snapshot);
            }
            Command::CurrentDownloads(reply) => {
                let _ = reply.send(self.in_flight.values().cloned().collect());
            }
            Command::QueuedDownloads(reply) => {
                let _ = reply.send(self.queued.values().cloned().collect());
            }
            Command::CurrentMaxPriority(reply) => {
                let top = self.heap.peek().map_or(0, DownloadItem::item_priority);
                let _ = reply.send(top);
            }
            Command::Metrics(reply) => {
                let _ = reply.send(self.metrics);
            }
            Command::IsActive(reply) => {
                let _ = reply.send(self.is_active);
            }
        }
    }

    /// Inserts a submitted item, honoring the priority-upgrade rule.
    fn admit(&mut self, item: DownloadItem) {
        let id = item.id().to_string();
        if self.in_flight.contains_key(&id) {
            debug!(item_id = %id, "already in flight; ignoring submission");
            return;
        }
        if let Some(existing) = self.queued.get(&id) {
            if existing.item_priority() >= item.item_priority() {
                debug!(item_id = %id, "queued at equal or higher priority; ignoring");
                return;
            }
            self.heap.remove_where(|queued| queued.id() == id);
            debug!(
                item_id = %id,
                old = existing.item_priority(),
                new = item.item_priority(),
                "priority upgrade"
            );
        }
        self.queued.insert(id, item.clone());
        self.heap.enqueue(item);
    }

    /// Dispatches queued items while capacity and acceptance allow.
    async fn dispatch(&mut self) {
        while self.is_active && self.in_flight.len() < self.simultaneous {
            let Some(item) = self.heap.dequeue() else {
                break;
            };
            let id = item.id().to_string();
            // Stale heap entries (upgraded or cancelled ids) are skipped.
            if self.queued.remove(&id).is_none() {
                continue;
            }

            let Some(processor) = self
                .processors
                .iter()
                .find(|p| p.can_process(&item))
                .map(Arc::clone)
            else {
                warn!(item_id = %id, scheme = item.scheme(), "no processor accepts item");
                self.metrics.failed += 1;
                let error = Arc::new(DownloadError::no_processor(&id));
                self.notify(NotificationKind::Errored, &item, Some(Arc::clone(&error)));
                let _ = self.events.send(SchedulerEvent::Failed { item, error });
                continue;
            };

            self.in_flight.insert(id.clone(), item.clone());
            self.metrics.processed += 1;
            processor
                .process(item.clone(), self.transfer_sink.clone())
                .await;
            debug!(item_id = %id, priority = item.item_priority(), "dispatched");
            self.notify(NotificationKind::Started, &item, None);
            let _ = self.events.send(SchedulerEvent::Started { item });
        }
    }

    fn handle_cancel(&mut self, ids: Vec<String>) {
        for id in ids {
            if let Some(item) = self.queued.remove(&id) {
                self.heap.remove_where(|queued| queued.id() == id);
                debug!(item_id = %id, "cancelled while queued");
                self.metrics.failed += 1;
                let error = Arc::new(DownloadError::cancelled(&id));
                self.notify(NotificationKind::Errored, &item, Some(Arc::clone(&error)));
                let _ = self.events.send(SchedulerEvent::Failed { item, error });
            } else if let Some(item) = self.in_flight.get(&id) {
                // The transport observes the token and reports the
                // cancellation through the normal error path.
                item.cancel();
            }
        }
    }

    async fn handle_transfer_event(&mut self, event: TransferEvent) {
        match event {
            TransferEvent::Began { item } => {
                let id = item.id().to_string();
                if self.in_flight.contains_key(&id) {
                    return;
                }
                if self.queued.remove(&id).is_some() {
                    self.heap.remove_where(|queued| queued.id() == id);
                    debug!(item_id = %id, "transport began a queued item; migrating");
                } else {
                    // Ghost admission: a transport-initiated resume
                    // (rehydrated session) we have no record of.
                    debug!(item_id = %id, "admitting transport-initiated item");
                }
                self.in_flight.insert(id, item);
            }
            TransferEvent::TransferStarted { item } => {
                self.notify(NotificationKind::TransferStarted, &item, None);
                let _ = self.events.send(SchedulerEvent::TransferStarted { item });
            }
            TransferEvent::DataTransferred { .. } => {
                // Byte counts live on the item's shared progress record.
            }
            TransferEvent::TransferFinished {
                item,
                temp_path,
                ack,
            } => {
                // Forward first so the consumer can move the file while the
                // transport waits on the ack.
                let _ = self.events.send(SchedulerEvent::Finished {
                    item: item.clone(),
                    temp_path,
                    ack,
                });
                self.metrics.completed += 1;
                self.in_flight.remove(item.id());
                self.notify(NotificationKind::Finished, &item, None);
                self.dispatch().await;
            }
            TransferEvent::Errored { item, error } => {
                self.metrics.failed += 1;
                self.in_flight.remove(item.id());
                if self.queued.remove(item.id()).is_some() {
                    let id = item.id().to_string();
                    self.heap.remove_where(|queued| queued.id() == id);
                }
                let error = Arc::new(error);
                self.notify(NotificationKind::Errored, &item, Some(Arc::clone(&error)));
                let _ = self.events.send(SchedulerEvent::Failed { item, error });
                self.dispatch().await;
            }
            TransferEvent::Finished { .. } => {
                // Post-consume signal; nothing left to reconcile.
            }
        }
    }

    fn notify(
        &self,
        kind: NotificationKind,
        item: &DownloadItem,
        error: Option<Arc<DownloadError>>,
    ) {
        let _ = self.notifications.send(DownloadNotification {
            kind,
            item: item.clone(),
            error,
        });
    }
}
