//! Top-level orchestrator for resource acquisition.
//!
//! [`ResourceManager`] accepts resource requests, consults the cache to
//! skip already-resident files, submits work items to its schedulers,
//! demultiplexes scheduler outcomes into per-resource completion
//! callbacks, and keeps the progress tracker current. Failures are routed
//! back through the cache's mirror policy; a retry submission is invisible
//! to callers beyond the progress tracker swapping items.
//!
//! `urgent` requests route to a dedicated priority scheduler when one is
//! configured, so urgent work is never capacity-coupled to normal work.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};

use crate::cache::{DownloadRequest, LocalCache};
use crate::error::DownloadError;
use crate::item::DownloadItem;
use crate::options::{DownloadPriority, RequestOptions};
use crate::progress::{ProgressNode, ProgressTracker};
use crate::queue::{DownloadQueue, SchedulerEvent};
use crate::resource::Resource;

/// One-shot per-resource completion callback: `(success, resource_id)`.
pub type CompletionCallback = Box<dyn FnOnce(bool, &str) + Send>;

/// Orchestrates cache, schedulers, mirror policy, and progress.
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager").finish_non_exhaustive()
    }
}

struct ManagerInner {
    cache: Arc<LocalCache>,
    main_queue: DownloadQueue,
    priority_queue: Option<DownloadQueue>,
    progress: Arc<ProgressTracker>,
    callbacks: Mutex<HashMap<String, Vec<CompletionCallback>>>,
}

impl ResourceManager {
    /// Creates a manager over a cache and scheduler(s), consuming each
    /// scheduler's outcome stream on a spawned task.
    ///
    /// The priority scheduler, when given, serves `urgent` requests.
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn new(
        cache: Arc<LocalCache>,
        main_queue: DownloadQueue,
        priority_queue: Option<DownloadQueue>,
    ) -> Self {
        let main_events = main_queue.take_event_stream();
        let priority_events = priority_queue.as_ref().and_then(DownloadQueue::take_event_stream);

        let inner = Arc::new(ManagerInner {
            cache,
            main_queue,
            priority_queue,
            progress: Arc::new(ProgressTracker::new()),
            callbacks: Mutex::new(HashMap::new()),
        });

        if let Some(events) = main_events {
            tokio::spawn(consume_events(Arc::clone(&inner), events));
        } else {
            warn!("main scheduler event stream already taken; outcomes will not resolve");
        }
        if let Some(events) = priority_events {
            tokio::spawn(consume_events(Arc::clone(&inner), events));
        }

        Self { inner }
    }

    /// Requests resources, returning one download request per resource
    /// that actually needs network work.
    ///
    /// Already-cached resources are filtered out (no scheduler enqueue, no
    /// processor invocation). Returned items are registered with the
    /// progress tracker and submitted to the scheduler matching
    /// `options.download_priority`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Index`] if the cache's metadata index
    /// fails.
    #[instrument(skip(self, resources), fields(count = resources.len()))]
    pub async fn request(
        &self,
        resources: Vec<Resource>,
        options: RequestOptions,
    ) -> Result<Vec<DownloadRequest>, DownloadError> {
        let requests = self.inner.cache.request_downloads(resources, options).await?;

        let items: Vec<DownloadItem> = requests.iter().map(|r| r.item.clone()).collect();
        self.inner.progress.add(&items);

        for request in &requests {
            self.inner
                .queue_for(request.options.download_priority)
                .download(request.item.clone());
        }
        Ok(requests)
    }

    /// Registers a one-shot callback fired when the resource terminates.
    ///
    /// Multiple callbacks per resource run in registration order, each
    /// exactly once. A resource that is already cache-resident with no
    /// transfer in progress resolves immediately with `success = true`.
    pub async fn add_resource_completion(
        &self,
        resource_id: &str,
        callback: impl FnOnce(bool, &str) + Send + 'static,
    ) {
        self.inner
            .lock_callbacks()
            .entry(resource_id.to_string())
            .or_default()
            .push(Box::new(callback));

        if self.inner.cache.active_item_id(resource_id).is_none() {
            let cached = matches!(self.inner.cache.cached_path(resource_id).await, Ok(Some(_)));
            if cached {
                self.inner.resolve(resource_id, true);
            }
        }
    }

    /// Cancels the resource's current work item, wherever it lives.
    pub fn cancel(&self, resource_id: &str) {
        if let Some(item_id) = self.inner.cache.active_item_id(resource_id) {
            self.inner.main_queue.cancel(item_id.clone());
            if let Some(priority_queue) = &self.inner.priority_queue {
                priority_queue.cancel(item_id);
            }
        }
    }

    /// Pauses both schedulers.
    pub fn pause(&self) {
        self.inner.main_queue.pause();
        if let Some(priority_queue) = &self.inner.priority_queue {
            priority_queue.pause();
        }
    }

    /// Resumes both schedulers and reattaches any transfers the transports
    /// rehydrated on their own.
    pub async fn resume(&self) {
        self.inner.main_queue.resume();
        if let Some(priority_queue) = &self.inner.priority_queue {
            priority_queue.resume();
        }
        self.inner.main_queue.enqueue_pending().await;
        if let Some(priority_queue) = &self.inner.priority_queue {
            priority_queue.enqueue_pending().await;
        }
    }

    /// The cache this manager gates through.
    #[must_use]
    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.inner.cache
    }

    /// The shared progress tracker.
    #[must_use]
    pub fn progress(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.inner.progress)
    }

    /// Aggregate progress node over a batch of download requests.
    #[must_use]
    pub fn progress_node(&self, request_id: &str, requests: &[DownloadRequest]) -> ProgressNode {
        let ids: Vec<String> = requests.iter().map(|r| r.item.id().to_string()).collect();
        self.inner.progress.node(request_id, &ids)
    }
}

impl ManagerInner {
    fn lock_callbacks(&self) -> MutexGuard<'_, HashMap<String, Vec<CompletionCallback>>> {
        match self.callbacks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn queue_for(&self, priority: DownloadPriority) -> &DownloadQueue {
        match (&self.priority_queue, priority) {
            (Some(priority_queue), DownloadPriority::Urgent) => priority_queue,
            _ => &self.main_queue,
        }
    }

    /// Fires (and consumes) all callbacks registered for a resource.
    fn resolve(&self, resource_id: &str, success: bool) {
        let callbacks = self.lock_callbacks().remove(resource_id);
        if let Some(callbacks) = callbacks {
            debug!(resource_id, success, count = callbacks.len(), "resolving callbacks");
            for callback in callbacks {
                callback(success, resource_id);
            }
        }
    }

    async fn handle_finished(
        &self,
        item: DownloadItem,
        temp_path: PathBuf,
        ack: oneshot::Sender<()>,
    ) {
        // Peek the association first: a promotion failure must still be
        // able to resolve the resource's callbacks.
        let pending = self.cache.download_request(item.id());
        let result = self.cache.finish(&item, &temp_path).await;
        let _ = ack.send(());

        match result {
            Ok(Some(request)) => {
                self.resolve(request.resource.id(), true);
                self.progress.complete(item.id(), None);
            }
            Ok(None) => {
                debug!(item_id = %item.id(), "finished item had no cache association");
            }
            Err(error) => {
                warn!(item_id = %item.id(), error = %error, "promotion failed");
                let error = Arc::new(error);
                if let Some(request) = pending {
                    self.resolve(request.resource.id(), false);
                }
                self.progress.complete(item.id(), Some(error));
            }
        }
    }

    async fn handle_failed(&self, item: DownloadItem, error: Arc<DownloadError>) {
        let pending = self.cache.download_request(item.id());

        if let Some(retry) = self.cache.fail(&item, &error) {
            debug!(
                item_id = %item.id(),
                retry_item = %retry.item.id(),
                "resubmitting after failure"
            );
            self.progress.replace(item.id(), &retry.item);
            self.queue_for(retry.options.download_priority)
                .download(retry.item.clone());
            return;
        }

        let resource_id = pending
            .map(|request| request.resource.id().to_string())
            .unwrap_or_else(|| resource_id_from_item_id(item.id()));
        self.resolve(&resource_id, false);
        self.progress.complete(item.id(), Some(error));
    }
}

/// Drains one scheduler's outcome stream into manager handling.
async fn consume_events(
    inner: Arc<ManagerInner>,
    mut events: mpsc::UnboundedReceiver<SchedulerEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SchedulerEvent::Started { item } => {
                debug!(item_id = %item.id(), "download started");
            }
            SchedulerEvent::TransferStarted { item } => {
                debug!(item_id = %item.id(), "transfer started");
            }
            SchedulerEvent::Finished {
                item,
                temp_path,
                ack,
            } => inner.handle_finished(item, temp_path, ack).await,
            SchedulerEvent::Failed { item, error } => inner.handle_failed(item, error).await,
        }
    }
    debug!("scheduler event stream closed");
}

/// Recovers the resource id from a `<resource_id>/<mirror_id>` item id.
fn resource_id_from_item_id(item_id: &str) -> String {
    item_id
        .rfind('/')
        .map_or(item_id, |index| &item_id[..index])
        .to_string()
}
