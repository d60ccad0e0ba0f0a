//! Local file cache gating enqueue decisions and owning file placement.
//!
//! [`LocalCache`] maps resource ids to files under its base directory,
//! decides which requested resources actually need network work, promotes
//! completed transfers into the cache with atomic renames, consults the
//! mirror policy on failures, and cleans up evictable files. A sidecar
//! [`CacheIndex`] persists the id-to-path mapping.
//!
//! Completed files are named `<resource_id>.<ext>`; a collision with a
//! different resource's file is resolved with `copy-1.<name>` through
//! `copy-3.<name>`, after which the promotion fails.

mod index;

pub use index::{CacheEntry, CacheIndex};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, instrument, warn};

use crate::error::{DownloadError, FailureKind, classify_error};
use crate::fsname::{cache_file_name, collision_file_name};
use crate::item::DownloadItem;
use crate::options::RequestOptions;
use crate::policy::{MirrorPolicy, MirrorSelection, PolicyDecision};
use crate::resource::Resource;

/// Collision-resolution attempts before a promotion fails.
const MAX_COLLISION_ATTEMPTS: u32 = 3;

/// Caller-visible record of an enqueue that actually occurred.
///
/// Not produced for resources that are already cache-resident.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// The requested resource.
    pub resource: Resource,
    /// The current work item carrying the transfer.
    pub item: DownloadItem,
    /// The options the request was made with.
    pub options: RequestOptions,
}

/// Association between an in-progress work item and its request.
#[derive(Debug, Clone)]
struct ActiveRequest {
    request: DownloadRequest,
    selection: MirrorSelection,
}

#[derive(Debug, Default)]
struct ActiveState {
    by_item: HashMap<String, ActiveRequest>,
    by_resource: HashMap<String, String>,
}

/// On-disk cache with a persistent metadata index.
pub struct LocalCache {
    root: PathBuf,
    index: CacheIndex,
    policy: Arc<dyn MirrorPolicy>,
    active: Mutex<ActiveState>,
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl LocalCache {
    /// Creates a cache over `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Filesystem`] if the directory cannot be
    /// created.
    pub async fn new(
        root: impl Into<PathBuf>,
        index: CacheIndex,
        policy: Arc<dyn MirrorPolicy>,
    ) -> Result<Self, DownloadError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| DownloadError::filesystem(&root, e))?;
        Ok(Self {
            root,
            index,
            policy,
            active: Mutex::new(ActiveState::default()),
        })
    }

    /// The cache's base directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_active(&self) -> MutexGuard<'_, ActiveState> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Filters resources down to those needing a download and produces a
    /// request per uncached resource.
    ///
    /// Cache-resident, fresh resources yield nothing. A resource that
    /// already has an in-progress request yields a request referring to
    /// the same work item id, so overlapping callers converge on one
    /// transfer.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Index`] if the metadata index fails.
    #[instrument(skip(self, resources), fields(count = resources.len()))]
    pub async fn request_downloads(
        &self,
        resources: Vec<Resource>,
        options: RequestOptions,
    ) -> Result<Vec<DownloadRequest>, DownloadError> {
        let mut requests = Vec::new();
        for resource in resources {
            if let Some(request) = self.active_request_for_resource(resource.id()) {
                debug!(resource_id = %resource.id(), "request already in progress");
                requests.push(request);
                continue;
            }
            if self.lookup_fresh(&resource).await?.is_some() {
                debug!(resource_id = %resource.id(), "cache hit; no download needed");
                continue;
            }
            if let Some(request) = self.admit(&resource, options) {
                requests.push(request);
            }
        }
        Ok(requests)
    }

    /// Registers the initial mirror selection for an uncached resource.
    fn admit(&self, resource: &Resource, options: RequestOptions) -> Option<DownloadRequest> {
        let mut active = self.lock_active();
        // A concurrent caller may have admitted the resource between our
        // freshness check and this lock; reuse its request.
        if let Some(item_id) = active.by_resource.get(resource.id()) {
            return active.by_item.get(item_id).map(|a| a.request.clone());
        }

        match self.policy.selection(resource) {
            PolicyDecision::Select(selection) => {
                Some(Self::track(&mut active, resource, selection, options))
            }
            PolicyDecision::CannotGenerate { mirror_id } => {
                warn!(resource_id = %resource.id(), %mirror_id, "failed to generate a work item");
                None
            }
            PolicyDecision::Cancelled | PolicyDecision::Exhausted => None,
        }
    }

    /// Records an association and builds the caller-visible request.
    fn track(
        active: &mut ActiveState,
        resource: &Resource,
        selection: MirrorSelection,
        options: RequestOptions,
    ) -> DownloadRequest {
        let item = selection
            .item
            .clone()
            .with_priority(options.download_priority.queue_priority());
        let request = DownloadRequest {
            resource: resource.clone(),
            item,
            options,
        };
        active
            .by_resource
            .insert(resource.id().to_string(), request.item.id().to_string());
        active.by_item.insert(
            request.item.id().to_string(),
            ActiveRequest {
                request: request.clone(),
                selection,
            },
        );
        request
    }

    /// Reverse lookup from a work item to its in-progress request.
    #[must_use]
    pub fn download_request(&self, item_id: &str) -> Option<DownloadRequest> {
        self.lock_active()
            .by_item
            .get(item_id)
            .map(|active| active.request.clone())
    }

    /// The in-progress work item id for a resource, if any.
    #[must_use]
    pub fn active_item_id(&self, resource_id: &str) -> Option<String> {
        self.lock_active().by_resource.get(resource_id).cloned()
    }

    /// The in-progress request for a resource, if any.
    #[must_use]
    pub fn active_request_for_resource(&self, resource_id: &str) -> Option<DownloadRequest> {
        let active = self.lock_active();
        let item_id = active.by_resource.get(resource_id)?;
        active.by_item.get(item_id).map(|a| a.request.clone())
    }

    /// The cached file path for a resource, when present and fresh on disk.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Index`] if the metadata index fails.
    pub async fn cached_path(&self, resource_id: &str) -> Result<Option<PathBuf>, DownloadError> {
        let Some(entry) = self.index.entry(resource_id).await? else {
            return Ok(None);
        };
        let path = entry.path();
        if file_exists(&path).await {
            Ok(Some(path))
        } else {
            Ok(None)
        }
    }

    /// Looks up the index entry and verifies the file exists and is fresh
    /// with respect to the resource's modification timestamp.
    async fn lookup_fresh(&self, resource: &Resource) -> Result<Option<CacheEntry>, DownloadError> {
        let Some(entry) = self.index.entry(resource.id()).await? else {
            return Ok(None);
        };
        if !file_exists(&entry.path()).await {
            debug!(resource_id = %resource.id(), "index entry without file; dropping");
            self.index.remove(resource.id()).await?;
            return Ok(None);
        }
        if let Some(modified) = resource.modified_at() {
            if index::unix_seconds(modified) > entry.modified_at {
                debug!(resource_id = %resource.id(), "cached file is stale");
                return Ok(None);
            }
        }
        Ok(Some(entry))
    }

    /// Promotes a finished transfer into the cache.
    ///
    /// Moves the temp file to its final name (resolving collisions),
    /// records the index entry, clears the mirror policy's retry counters
    /// for the resource, and returns the request so callbacks can resolve.
    /// Returns `Ok(None)` for items the cache has no association for.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Filesystem`] when the temp file vanished
    /// or the rename fails, [`DownloadError::Collision`] when the
    /// collision bound is exceeded, and [`DownloadError::Index`] on index
    /// failures. Promotion failures are terminal; they are not fed back
    /// into the mirror policy.
    #[instrument(skip(self, item, temp_path), fields(item_id = %item.id(), temp = %temp_path.display()))]
    pub async fn finish(
        &self,
        item: &DownloadItem,
        temp_path: &Path,
    ) -> Result<Option<DownloadRequest>, DownloadError> {
        let Some(active) = self.untrack(item.id()) else {
            debug!(item_id = %item.id(), "finish for unknown item");
            return Ok(None);
        };
        let resource_id = active.request.resource.id().to_string();

        if !file_exists(temp_path).await {
            return Err(DownloadError::filesystem(
                temp_path,
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "temporary file vanished before promotion",
                ),
            ));
        }

        let dest = self.resolve_destination(&resource_id, &active.selection).await?;
        tokio::fs::rename(temp_path, &dest)
            .await
            .map_err(|e| DownloadError::filesystem(&dest, e))?;

        let entry = CacheEntry::new(
            &resource_id,
            &dest,
            active.request.options.storage_priority,
            active.selection.mirror.id(),
        );
        self.index.upsert(&entry).await?;
        self.policy.downloads_succeeded(&resource_id);
        info!(resource_id = %resource_id, path = %dest.display(), "promoted into cache");

        let mut request = active.request;
        request.resource.set_file_path(dest);
        Ok(Some(request))
    }

    /// Picks the final path, applying the `copy-N.` rule on collision with
    /// a different resource's file.
    async fn resolve_destination(
        &self,
        resource_id: &str,
        selection: &MirrorSelection,
    ) -> Result<PathBuf, DownloadError> {
        let name = cache_file_name(resource_id, selection.mirror.location());
        let dest = self.root.join(&name);
        if !file_exists(&dest).await {
            return Ok(dest);
        }

        // Re-promoting over this resource's own file is an atomic replace.
        let own_file = self
            .index
            .entry(resource_id)
            .await?
            .is_some_and(|entry| entry.path() == dest);
        if own_file {
            return Ok(dest);
        }

        for attempt in 1..=MAX_COLLISION_ATTEMPTS {
            let candidate = self.root.join(collision_file_name(&name, attempt));
            if !file_exists(&candidate).await {
                return Ok(candidate);
            }
        }
        Err(DownloadError::collision(dest))
    }

    /// Consults the mirror policy after a failed work item.
    ///
    /// Returns a retry request wrapping the next work item (and the
    /// original request options) when the policy yields one; `None`
    /// signals terminal failure. Cancelled errors never retry.
    #[instrument(skip(self, item, error), fields(item_id = %item.id()))]
    pub fn fail(&self, item: &DownloadItem, error: &DownloadError) -> Option<DownloadRequest> {
        let mut active = self.lock_active();
        let current = active.by_item.remove(item.id())?;
        let resource_id = current.request.resource.id().to_string();
        active.by_resource.remove(&resource_id);

        // Cancellation never reaches the policy, and a missing processor
        // is terminal at the scheduler level.
        if classify_error(error) == FailureKind::Cancelled {
            debug!(resource_id = %resource_id, "cancelled; not retrying");
            return None;
        }
        if matches!(error, DownloadError::NoProcessor { .. }) {
            warn!(resource_id = %resource_id, "no processor accepts the item; not retrying");
            return None;
        }

        match self
            .policy
            .next(&current.request.resource, &current.selection, error)
        {
            PolicyDecision::Select(selection) => {
                debug!(
                    resource_id = %resource_id,
                    mirror_id = %selection.mirror.id(),
                    "retrying with next mirror"
                );
                Some(Self::track(
                    &mut active,
                    &current.request.resource,
                    selection,
                    current.request.options,
                ))
            }
            PolicyDecision::Cancelled => {
                debug!(resource_id = %resource_id, "cancelled; not retrying");
                None
            }
            PolicyDecision::Exhausted => {
                warn!(resource_id = %resource_id, "exhausted all mirrors");
                None
            }
            PolicyDecision::CannotGenerate { mirror_id } => {
                warn!(resource_id = %resource_id, %mirror_id, "failed to generate a work item");
                None
            }
        }
    }

    fn untrack(&self, item_id: &str) -> Option<ActiveRequest> {
        let mut active = self.lock_active();
        let current = active.by_item.remove(item_id)?;
        active
            .by_resource
            .remove(current.request.resource.id());
        Some(current)
    }

    /// Deletes files under the cache root that are neither referenced by a
    /// permanent entry nor listed in `exclude`, dropping their index
    /// entries. Returns the number of files removed.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Filesystem`] if the directory cannot be
    /// read, or [`DownloadError::Index`] on index failures.
    #[instrument(skip(self, exclude))]
    pub async fn cleanup(&self, exclude: &HashSet<PathBuf>) -> Result<u64, DownloadError> {
        let entries = self.index.entries().await?;
        let permanent: HashSet<PathBuf> = entries
            .iter()
            .filter(|entry| entry.storage_priority() == crate::options::StoragePriority::Permanent)
            .map(CacheEntry::path)
            .collect();

        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| DownloadError::filesystem(&self.root, e))?;
        let mut removed = 0u64;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| DownloadError::filesystem(&self.root, e))?
        {
            let path = entry.path();
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            // Directories (e.g. the partial-transfer area) and dotfiles
            // (the sidecar index) are never eviction candidates.
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
            if !is_file || hidden || exclude.contains(&path) || permanent.contains(&path) {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    self.index.remove_by_path(&path).await?;
                    removed += 1;
                    debug!(path = %path.display(), "evicted");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to evict"),
            }
        }
        info!(removed, "cache cleanup complete");
        Ok(removed)
    }
}

/// Existence probe that treats IO errors as absent.
async fn file_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
