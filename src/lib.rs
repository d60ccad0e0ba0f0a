//! Fetchkit Core Library
//!
//! A concurrent file-acquisition engine: priority-ordered scheduling over
//! pluggable transports, mirror failover with bounded retries, an on-disk
//! cache that gates enqueue decisions and owns file placement, and
//! aggregated progress reporting.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`pqueue`] - Priority heap ordering work items for dispatch
//! - [`processor`] - Transport processors (HTTP, object store)
//! - [`queue`] - Bounded-concurrency scheduler
//! - [`policy`] - Mirror selection and retry policy
//! - [`cache`] - Local file cache with a persistent metadata index
//! - [`manager`] - Top-level orchestrator
//! - [`progress`] - Aggregated progress tracking
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fetchkit_core::{
//!     CacheIndex, DownloadQueue, HttpProcessor, LocalCache, Mirror, QueueOptions,
//!     RequestOptions, Resource, ResourceManager, WeightedMirrorPolicy,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let index = CacheIndex::new(std::path::Path::new("cache/.index.db")).await?;
//! let policy = Arc::new(WeightedMirrorPolicy::default());
//! let cache = Arc::new(LocalCache::new("cache", index, policy).await?);
//!
//! let queue = DownloadQueue::new(QueueOptions::default());
//! queue.add(Arc::new(HttpProcessor::new("cache/.partial")));
//!
//! let manager = ResourceManager::new(cache, queue, None);
//! let resource = Resource::new("report", Mirror::new("main", "https://example.com/report.pdf"));
//! let requests = manager.request(vec![resource], RequestOptions::default()).await?;
//! println!("enqueued {} downloads", requests.len());
//! # Ok(())
//! # }
//! ```

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod error;
mod fsname;
pub mod item;
pub mod manager;
pub mod options;
pub mod policy;
pub mod pqueue;
pub mod processor;
pub mod progress;
pub mod queue;
pub mod resource;

// Re-export commonly used types
pub use cache::{CacheEntry, CacheIndex, DownloadRequest, LocalCache};
pub use error::{DownloadError, FailureKind, classify_error};
pub use item::{DownloadItem, TransferProgress};
pub use manager::{CompletionCallback, ResourceManager};
pub use options::{DownloadPriority, RequestOptions, StoragePriority};
pub use policy::{
    DEFAULT_MAX_RETRIES, MirrorPolicy, MirrorSelection, PolicyDecision, WeightedMirrorPolicy,
    WeightedPolicyOptions,
};
pub use pqueue::{Prioritized, PriorityQueue};
pub use processor::{
    DownloadProcessor, HttpProcessor, ObjectStore, ObjectStoreProcessor, TransferEvent,
    TransferEventSink,
};
pub use progress::{ProgressNode, ProgressTracker};
pub use queue::{
    DEFAULT_SIMULTANEOUS_DOWNLOADS, DownloadNotification, DownloadQueue, NotificationKind,
    QueueMetrics, QueueOptions, SchedulerEvent,
};
pub use resource::{Mirror, Resource};
