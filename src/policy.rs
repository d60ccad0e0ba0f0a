//! Mirror selection and retry policy.
//!
//! On failure the policy chooses the next source location for a resource,
//! bounded by a per-mirror retry budget. The reference implementation is
//! the weighted policy: alternatives sorted by their integer `weight`
//! metadata descending, with the main mirror pinned last as the final
//! fallback regardless of its own weight.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, instrument, warn};

use crate::error::{DownloadError, FailureKind, classify_error};
use crate::item::DownloadItem;
use crate::resource::{Mirror, Resource};

/// Default retry budget for the final-fallback mirror.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// One mirror chosen for one attempt, with the work item to run it.
#[derive(Debug, Clone)]
pub struct MirrorSelection {
    /// The resource this selection serves.
    pub resource_id: String,
    /// The chosen mirror.
    pub mirror: Mirror,
    /// Fresh work item for the attempt (new cancel token and progress).
    pub item: DownloadItem,
    /// Position of the mirror in the policy's ordered list.
    pub index: usize,
}

/// Outcome of asking the policy for a (next) mirror.
#[derive(Debug)]
pub enum PolicyDecision {
    /// Use this mirror next.
    Select(MirrorSelection),
    /// The failure was a cancellation; do not retry.
    Cancelled,
    /// Every mirror and its retry budget is consumed.
    Exhausted,
    /// The chosen mirror cannot produce a work item (bad location).
    CannotGenerate {
        /// The mirror that failed to generate.
        mirror_id: String,
    },
}

impl PolicyDecision {
    /// Unwraps the selection, if any.
    #[must_use]
    pub fn into_selection(self) -> Option<MirrorSelection> {
        match self {
            Self::Select(selection) => Some(selection),
            _ => None,
        }
    }
}

/// Chooses mirrors for resources and bounds retries.
///
/// Implementations must be safe to call from multiple tasks; internal
/// counter mutation is serialized. Given an identical sequence of
/// failures, selection is deterministic.
pub trait MirrorPolicy: Send + Sync {
    /// Picks the initial mirror for a resource.
    fn selection(&self, resource: &Resource) -> PolicyDecision;

    /// Picks the next mirror after `failed` errored with `error`.
    fn next(
        &self,
        resource: &Resource,
        failed: &MirrorSelection,
        error: &DownloadError,
    ) -> PolicyDecision;

    /// Clears all retry state for a successfully completed resource.
    fn downloads_succeeded(&self, resource_id: &str);

    /// Current retry count for a `(resource, mirror)` pair.
    fn retry_count(&self, resource_id: &str, mirror_id: &str) -> u32;
}

/// Configuration for [`WeightedMirrorPolicy`].
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct WeightedPolicyOptions {
    /// Maximum retries of the final-fallback mirror after its first failure.
    pub max_retries: u32,
}

impl Default for WeightedPolicyOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Weight-ordered mirror policy with a bounded final-fallback retry loop.
#[derive(Debug, Default)]
pub struct WeightedMirrorPolicy {
    options: WeightedPolicyOptions,
    /// Retry counters keyed by `(resource_id, mirror_id)`.
    retries: Mutex<HashMap<(String, String), u32>>,
}

impl WeightedMirrorPolicy {
    /// Creates a policy with the given options.
    #[must_use]
    pub fn new(options: WeightedPolicyOptions) -> Self {
        Self {
            options,
            retries: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a policy with a custom retry budget and default options.
    #[must_use]
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self::new(WeightedPolicyOptions { max_retries })
    }

    /// The ordered candidate list: alternatives by weight descending
    /// (stable within equal weights), then the main mirror pinned last.
    fn ordered_mirrors(resource: &Resource) -> Vec<&Mirror> {
        let mut mirrors: Vec<&Mirror> = resource.alternatives().iter().collect();
        mirrors.sort_by_key(|m| std::cmp::Reverse(m.weight()));
        mirrors.push(resource.main_mirror());
        mirrors
    }

    /// Builds a selection for the mirror at `index`, if it can generate.
    fn select_at(resource: &Resource, mirrors: &[&Mirror], index: usize) -> Option<MirrorSelection> {
        let mirror = mirrors.get(index)?;
        let item = mirror.download_item(resource.id())?;
        Some(MirrorSelection {
            resource_id: resource.id().to_string(),
            mirror: (*mirror).clone(),
            item,
            index,
        })
    }

    fn lock_retries(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), u32>> {
        match self.retries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl MirrorPolicy for WeightedMirrorPolicy {
    #[instrument(skip(self, resource), fields(resource_id = %resource.id()))]
    fn selection(&self, resource: &Resource) -> PolicyDecision {
        let mirrors = Self::ordered_mirrors(resource);
        for index in 0..mirrors.len() {
            if let Some(selection) = Self::select_at(resource, &mirrors, index) {
                debug!(mirror_id = %selection.mirror.id(), index, "selected initial mirror");
                return PolicyDecision::Select(selection);
            }
        }
        let mirror_id = resource.main_mirror().id().to_string();
        warn!(%mirror_id, "no mirror can generate a work item");
        PolicyDecision::CannotGenerate { mirror_id }
    }

    #[instrument(skip(self, resource, failed, error), fields(resource_id = %resource.id(), failed_mirror = %failed.mirror.id()))]
    fn next(
        &self,
        resource: &Resource,
        failed: &MirrorSelection,
        error: &DownloadError,
    ) -> PolicyDecision {
        if classify_error(error) == FailureKind::Cancelled {
            debug!("cancelled; no further mirror");
            return PolicyDecision::Cancelled;
        }

        let mirrors = Self::ordered_mirrors(resource);

        // Scan forward from the failed selection for a usable later mirror.
        for index in (failed.index + 1)..mirrors.len() {
            if let Some(selection) = Self::select_at(resource, &mirrors, index) {
                debug!(mirror_id = %selection.mirror.id(), index, "advancing to next mirror");
                return PolicyDecision::Select(selection);
            }
        }

        // No later mirror: clamp to the last one and spend its retry
        // budget. Permanent failures never retry the same mirror.
        if classify_error(error) == FailureKind::Permanent {
            warn!("permanent failure on final mirror; exhausted");
            return PolicyDecision::Exhausted;
        }
        let last_index = mirrors.len() - 1;
        let last = mirrors[last_index];
        let key = (resource.id().to_string(), last.id().to_string());

        let mut retries = self.lock_retries();
        let count = retries.get(&key).copied().unwrap_or(0);
        if count >= self.options.max_retries {
            warn!(mirror_id = %last.id(), retries = count, "mirrors exhausted");
            return PolicyDecision::Exhausted;
        }

        let Some(selection) = Self::select_at(resource, &mirrors, last_index) else {
            warn!(mirror_id = %last.id(), "final mirror cannot generate a work item");
            return PolicyDecision::CannotGenerate {
                mirror_id: last.id().to_string(),
            };
        };

        retries.insert(key, count + 1);
        debug!(mirror_id = %last.id(), retry = count + 1, max = self.options.max_retries, "retrying final mirror");
        PolicyDecision::Select(selection)
    }

    fn downloads_succeeded(&self, resource_id: &str) {
        self.lock_retries()
            .retain(|(rid, _), _| rid != resource_id);
    }

    fn retry_count(&self, resource_id: &str, mirror_id: &str) -> u32 {
        self.lock_retries()
            .get(&(resource_id.to_string(), mirror_id.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn transient() -> DownloadError {
        DownloadError::timeout("https://example.com/a.bin")
    }

    fn resource_with_mirrors() -> Resource {
        Resource::new(
            "res-1",
            Mirror::new("m0", "https://main.example.com/a.bin").with_weight(0),
        )
        .with_alternative(Mirror::new("m1", "https://fast.example.com/a.bin").with_weight(10))
        .with_alternative(Mirror::new("m2", "https://slow.example.com/a.bin").with_weight(1))
    }

    fn select(decision: PolicyDecision) -> MirrorSelection {
        match decision {
            PolicyDecision::Select(selection) => selection,
            other => panic!("expected selection, got {other:?}"),
        }
    }

    // ==================== Ordering Tests ====================

    #[test]
    fn test_initial_selection_is_highest_weight() {
        let policy = WeightedMirrorPolicy::default();
        let resource = resource_with_mirrors();
        let selection = select(policy.selection(&resource));
        assert_eq!(selection.mirror.id(), "m1");
        assert_eq!(selection.index, 0);
        assert_eq!(selection.item.id(), "res-1/m1");
    }

    #[test]
    fn test_main_mirror_pinned_last_despite_weight() {
        let policy = WeightedMirrorPolicy::default();
        let resource = Resource::new(
            "res-1",
            Mirror::new("m0", "https://main.example.com/a.bin").with_weight(1_000),
        )
        .with_alternative(Mirror::new("m1", "https://alt.example.com/a.bin").with_weight(1));

        let selection = select(policy.selection(&resource));
        assert_eq!(selection.mirror.id(), "m1");
    }

    #[test]
    fn test_equal_weights_keep_caller_order() {
        let policy = WeightedMirrorPolicy::default();
        let resource = Resource::new("res-1", Mirror::new("m0", "https://main.example.com/a"))
            .with_alternative(Mirror::new("a", "https://a.example.com/f").with_weight(5))
            .with_alternative(Mirror::new("b", "https://b.example.com/f").with_weight(5));

        let first = select(policy.selection(&resource));
        assert_eq!(first.mirror.id(), "a");
        let second = select(policy.next(&resource, &first, &transient()));
        assert_eq!(second.mirror.id(), "b");
    }

    // ==================== Failover Tests ====================

    #[test]
    fn test_failover_sequence_then_exhaustion() {
        // m1(10), m2(1), main m0; max_retries = 2.
        let policy = WeightedMirrorPolicy::with_max_retries(2);
        let resource = resource_with_mirrors();

        let s1 = select(policy.selection(&resource));
        assert_eq!(s1.mirror.id(), "m1");

        let s2 = select(policy.next(&resource, &s1, &transient()));
        assert_eq!(s2.mirror.id(), "m2");

        let s3 = select(policy.next(&resource, &s2, &transient()));
        assert_eq!(s3.mirror.id(), "m0");
        assert_eq!(policy.retry_count("res-1", "m0"), 0);

        let s4 = select(policy.next(&resource, &s3, &transient()));
        assert_eq!(s4.mirror.id(), "m0");
        assert_eq!(policy.retry_count("res-1", "m0"), 1);

        let s5 = select(policy.next(&resource, &s4, &transient()));
        assert_eq!(s5.mirror.id(), "m0");
        assert_eq!(policy.retry_count("res-1", "m0"), 2);

        assert!(matches!(
            policy.next(&resource, &s5, &transient()),
            PolicyDecision::Exhausted
        ));
        // Budget never overruns.
        assert_eq!(policy.retry_count("res-1", "m0"), 2);
    }

    #[test]
    fn test_single_main_mirror_retries_exactly_max_retries() {
        let policy = WeightedMirrorPolicy::with_max_retries(3);
        let resource = Resource::new("res-1", Mirror::new("m0", "https://main.example.com/a"));

        let mut selection = select(policy.selection(&resource));
        assert_eq!(selection.mirror.id(), "m0");

        for retry in 1..=3 {
            selection = select(policy.next(&resource, &selection, &transient()));
            assert_eq!(selection.mirror.id(), "m0");
            assert_eq!(policy.retry_count("res-1", "m0"), retry);
        }

        assert!(matches!(
            policy.next(&resource, &selection, &transient()),
            PolicyDecision::Exhausted
        ));
    }

    #[test]
    fn test_permanent_error_advances_but_never_reretries_final_mirror() {
        let policy = WeightedMirrorPolicy::with_max_retries(5);
        let resource = resource_with_mirrors();
        let permanent = DownloadError::http_status("https://example.com/a.bin", 404);

        // Remaining mirrors are still tried after a permanent failure.
        let s1 = select(policy.selection(&resource));
        let s2 = select(policy.next(&resource, &s1, &permanent));
        assert_eq!(s2.mirror.id(), "m2");
        let s3 = select(policy.next(&resource, &s2, &permanent));
        assert_eq!(s3.mirror.id(), "m0");

        // The final mirror is not re-retried on a permanent failure.
        assert!(matches!(
            policy.next(&resource, &s3, &permanent),
            PolicyDecision::Exhausted
        ));
        assert_eq!(policy.retry_count("res-1", "m0"), 0);
    }

    #[test]
    fn test_cancelled_error_short_circuits() {
        let policy = WeightedMirrorPolicy::default();
        let resource = resource_with_mirrors();
        let selection = select(policy.selection(&resource));

        let decision = policy.next(
            &resource,
            &selection,
            &DownloadError::cancelled("res-1/m1"),
        );
        assert!(matches!(decision, PolicyDecision::Cancelled));
        assert_eq!(policy.retry_count("res-1", "m0"), 0);
    }

    #[test]
    fn test_unusable_mirror_is_skipped_in_scan() {
        let policy = WeightedMirrorPolicy::default();
        let resource = Resource::new("res-1", Mirror::new("m0", "https://main.example.com/a"))
            .with_alternative(Mirror::new("good", "https://a.example.com/f").with_weight(10))
            .with_alternative(Mirror::new("bad", "not a url").with_weight(5));

        let first = select(policy.selection(&resource));
        assert_eq!(first.mirror.id(), "good");

        // "bad" cannot generate; the scan lands on the main mirror.
        let second = select(policy.next(&resource, &first, &transient()));
        assert_eq!(second.mirror.id(), "m0");
    }

    #[test]
    fn test_cannot_generate_when_nothing_parses() {
        let policy = WeightedMirrorPolicy::default();
        let resource = Resource::new("res-1", Mirror::new("m0", "not a url"));
        assert!(matches!(
            policy.selection(&resource),
            PolicyDecision::CannotGenerate { mirror_id } if mirror_id == "m0"
        ));
    }

    // ==================== Counter Lifecycle Tests ====================

    #[test]
    fn test_success_clears_counters_for_resource_only() {
        let policy = WeightedMirrorPolicy::with_max_retries(5);
        let res_a = Resource::new("res-a", Mirror::new("m0", "https://main.example.com/a"));
        let res_b = Resource::new("res-b", Mirror::new("m0", "https://main.example.com/b"));

        let sel_a = select(policy.selection(&res_a));
        select(policy.next(&res_a, &sel_a, &transient()));
        let sel_b = select(policy.selection(&res_b));
        select(policy.next(&res_b, &sel_b, &transient()));

        assert_eq!(policy.retry_count("res-a", "m0"), 1);
        assert_eq!(policy.retry_count("res-b", "m0"), 1);

        policy.downloads_succeeded("res-a");
        assert_eq!(policy.retry_count("res-a", "m0"), 0);
        assert_eq!(policy.retry_count("res-b", "m0"), 1);
    }

    #[test]
    fn test_deterministic_for_identical_failure_sequences() {
        let run = || {
            let policy = WeightedMirrorPolicy::with_max_retries(2);
            let resource = resource_with_mirrors();
            let mut ids = Vec::new();
            let mut selection = select(policy.selection(&resource));
            ids.push(selection.mirror.id().to_string());
            loop {
                match policy.next(&resource, &selection, &transient()) {
                    PolicyDecision::Select(next) => {
                        ids.push(next.mirror.id().to_string());
                        selection = next;
                    }
                    _ => break,
                }
            }
            ids
        };

        assert_eq!(run(), run());
    }
}
