//! Aggregated progress tracking across concurrent transfers.
//!
//! The tracker maps work-item ids to their shared byte-progress records and
//! groups them into progress nodes: per-request aggregates exposing unit
//! counts in the style of a progress tree. Each item contributes
//! `total + 1` units so a node only reports fully complete after an
//! explicit [`ProgressTracker::complete`] call, never by byte parity alone.
//!
//! All state transitions are serialized behind a mutex that is never held
//! across an await; callers receive immutable snapshots.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::error::DownloadError;
use crate::item::{DownloadItem, TransferProgress};

/// Immutable aggregate snapshot over a set of work items.
#[derive(Debug, Clone)]
pub struct ProgressNode {
    /// The request id this node aggregates for.
    pub id: String,
    /// Total units across live and terminated items.
    pub total_unit_count: u64,
    /// Completed units across live and terminated items.
    pub completed_unit_count: u64,
    /// True when every tracked item has terminated.
    pub is_completed: bool,
    /// The first error observed among the node's items, if any.
    pub first_error: Option<Arc<DownloadError>>,
}

impl ProgressNode {
    /// Fraction completed in `0.0..=1.0`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction_completed(&self) -> f64 {
        if self.total_unit_count == 0 {
            return 0.0;
        }
        (self.completed_unit_count as f64 / self.total_unit_count as f64).min(1.0)
    }
}

#[derive(Debug, Default)]
struct NodeState {
    items: HashSet<String>,
    retired_total: u64,
    retired_completed: u64,
    first_error: Option<Arc<DownloadError>>,
}

#[derive(Debug, Default)]
struct TrackerState {
    progresses: HashMap<String, Arc<TransferProgress>>,
    nodes: HashMap<String, NodeState>,
    completed_count: u64,
    failed_count: u64,
}

impl TrackerState {
    fn node_snapshot(&self, node_id: &str) -> Option<ProgressNode> {
        let node = self.nodes.get(node_id)?;
        let mut total = node.retired_total;
        let mut completed = node.retired_completed;
        for item_id in &node.items {
            if let Some(progress) = self.progresses.get(item_id) {
                total += progress.total_bytes() + 1;
                completed += progress.completed_bytes().min(progress.total_bytes());
            }
        }
        Some(ProgressNode {
            id: node_id.to_string(),
            total_unit_count: total,
            completed_unit_count: completed,
            is_completed: node.items.is_empty(),
            first_error: node.first_error.clone(),
        })
    }
}

/// Serialized aggregator of per-transfer byte counts into progress nodes.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    state: Mutex<TrackerState>,
}

impl ProgressTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers work items for tracking; already-known ids are untouched.
    pub fn add(&self, items: &[DownloadItem]) {
        let mut state = self.lock();
        for item in items {
            state
                .progresses
                .entry(item.id().to_string())
                .or_insert_with(|| Arc::clone(item.progress()));
        }
    }

    /// Swaps a tracked item for its retry replacement.
    ///
    /// The replacement's fresh progress record takes over, and any node
    /// containing the old id is rewritten to the new one. Retired unit
    /// contributions are untouched.
    pub fn replace(&self, old_id: &str, item: &DownloadItem) {
        let mut state = self.lock();
        if state.progresses.remove(old_id).is_none() && old_id != item.id() {
            debug!(old_id, new_id = item.id(), "replace of untracked item");
        }
        state
            .progresses
            .insert(item.id().to_string(), Arc::clone(item.progress()));
        for node in state.nodes.values_mut() {
            if node.items.remove(old_id) {
                node.items.insert(item.id().to_string());
            }
        }
    }

    /// Marks an item terminal, retiring its contribution in every
    /// containing node and bumping the success or failure counter.
    ///
    /// Nodes whose last item terminates are dropped; subsequent
    /// [`ProgressTracker::node_snapshot`] calls return `None` for them.
    pub fn complete(&self, id: &str, error: Option<Arc<DownloadError>>) {
        let mut state = self.lock();
        let Some(progress) = state.progresses.remove(id) else {
            return;
        };

        let total_units = progress.total_bytes() + 1;
        let completed_units = if error.is_none() {
            total_units
        } else {
            progress.completed_bytes().min(progress.total_bytes())
        };

        let mut emptied = Vec::new();
        for (node_id, node) in &mut state.nodes {
            if node.items.remove(id) {
                node.retired_total += total_units;
                node.retired_completed += completed_units;
                if node.first_error.is_none() {
                    node.first_error = error.clone();
                }
                if node.items.is_empty() {
                    emptied.push(node_id.clone());
                }
            }
        }
        for node_id in emptied {
            state.nodes.remove(&node_id);
        }

        if error.is_none() {
            state.completed_count += 1;
        } else {
            state.failed_count += 1;
        }
    }

    /// Returns the aggregate node for a request, creating it on demand.
    ///
    /// An existing node with the same item set is returned as-is;
    /// otherwise the given ids are merged into it. Only currently tracked
    /// item ids join the node.
    pub fn node(&self, request_id: &str, item_ids: &[String]) -> ProgressNode {
        let mut state = self.lock();
        let tracked: HashSet<String> = item_ids
            .iter()
            .filter(|id| state.progresses.contains_key(*id))
            .cloned()
            .collect();

        let node = state.nodes.entry(request_id.to_string()).or_default();
        node.items.extend(tracked);

        state
            .node_snapshot(request_id)
            .unwrap_or_else(|| ProgressNode {
                id: request_id.to_string(),
                total_unit_count: 0,
                completed_unit_count: 0,
                is_completed: true,
                first_error: None,
            })
    }

    /// Snapshot of an existing node, `None` once it completed and dropped.
    #[must_use]
    pub fn node_snapshot(&self, request_id: &str) -> Option<ProgressNode> {
        self.lock().node_snapshot(request_id)
    }

    /// True while the item is tracked (not yet terminal).
    #[must_use]
    pub fn is_tracking(&self, id: &str) -> bool {
        self.lock().progresses.contains_key(id)
    }

    /// Number of transfers that completed successfully.
    #[must_use]
    pub fn completed_download_count(&self) -> u64 {
        self.lock().completed_count
    }

    /// Number of transfers that terminated in failure.
    #[must_use]
    pub fn failed_download_count(&self) -> u64 {
        self.lock().failed_count
    }
}
