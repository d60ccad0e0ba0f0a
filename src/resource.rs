//! Resource and mirror data model.
//!
//! A [`Resource`] is the logical item a caller wants: one primary source
//! (the "main mirror") plus zero or more alternative sources. A [`Mirror`]
//! is a single concrete source location; its metadata (notably the integer
//! `weight`) feeds the mirror policy's ordering.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::item::DownloadItem;

/// Metadata key carrying the mirror's policy weight.
pub const WEIGHT_KEY: &str = "weight";

/// A single source location for a resource.
///
/// Immutable once created. The location's scheme selects the processor
/// that will carry the transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mirror {
    /// Identifier, unique within its resource.
    id: String,
    /// URI-like source location.
    location: String,
    /// Free-form policy metadata (string -> JSON value).
    #[serde(default)]
    metadata: HashMap<String, Value>,
}

impl Mirror {
    /// Creates a mirror for a source location.
    #[must_use]
    pub fn new(id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            location: location.into(),
            metadata: HashMap::new(),
        }
    }

    /// Sets the policy weight metadata.
    #[must_use]
    pub fn with_weight(mut self, weight: i64) -> Self {
        self.metadata.insert(WEIGHT_KEY.to_string(), weight.into());
        self
    }

    /// Adds an arbitrary metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Identifier, unique within the owning resource.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The raw source location string.
    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    /// The metadata mapping used as policy input.
    #[must_use]
    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    /// The integer `weight` metadata, 0 when absent or non-integer.
    #[must_use]
    pub fn weight(&self) -> i64 {
        self.metadata
            .get(WEIGHT_KEY)
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    /// Produces a work item for this mirror, or None when the location
    /// does not parse as a URL (the policy reports `failed_to_generate`).
    ///
    /// The item id is `<resource_id>/<mirror_id>`, stable across retries
    /// of the same mirror.
    #[must_use]
    pub fn download_item(&self, resource_id: &str) -> Option<DownloadItem> {
        let location = Url::parse(&self.location).ok()?;
        Some(DownloadItem::new(
            format!("{resource_id}/{}", self.id),
            location,
        ))
    }
}

/// A logical file the caller requests.
///
/// Immutable once submitted. `file_path` is populated from the cache index
/// when the resource is already cache-resident or once it completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    /// Stable identifier.
    id: String,
    /// Primary source; the policy's final fallback regardless of weight.
    main: Mirror,
    /// Alternative sources, ordered by the policy at selection time.
    #[serde(default)]
    alternatives: Vec<Mirror>,
    /// Local file location once cached.
    #[serde(default)]
    file_path: Option<PathBuf>,
    /// Remote modification timestamp, when the caller knows one.
    #[serde(default)]
    modified_at: Option<SystemTime>,
}

impl Resource {
    /// Creates a resource with a main mirror and no alternatives.
    #[must_use]
    pub fn new(id: impl Into<String>, main: Mirror) -> Self {
        Self {
            id: id.into(),
            main,
            alternatives: Vec::new(),
            file_path: None,
            modified_at: None,
        }
    }

    /// Adds an alternative mirror.
    #[must_use]
    pub fn with_alternative(mut self, mirror: Mirror) -> Self {
        self.alternatives.push(mirror);
        self
    }

    /// Sets the remote modification timestamp used for freshness checks.
    #[must_use]
    pub fn with_modified_at(mut self, modified_at: SystemTime) -> Self {
        self.modified_at = Some(modified_at);
        self
    }

    /// Stable identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The primary source.
    #[must_use]
    pub fn main_mirror(&self) -> &Mirror {
        &self.main
    }

    /// The alternative sources as provided by the caller.
    #[must_use]
    pub fn alternatives(&self) -> &[Mirror] {
        &self.alternatives
    }

    /// Local file location once cached.
    #[must_use]
    pub fn file_path(&self) -> Option<&PathBuf> {
        self.file_path.as_ref()
    }

    /// Remote modification timestamp, when known.
    #[must_use]
    pub fn modified_at(&self) -> Option<SystemTime> {
        self.modified_at
    }

    /// Finds a mirror by id, checking alternatives then the main mirror.
    #[must_use]
    pub fn mirror(&self, mirror_id: &str) -> Option<&Mirror> {
        self.alternatives
            .iter()
            .find(|m| m.id() == mirror_id)
            .or_else(|| (self.main.id() == mirror_id).then_some(&self.main))
    }

    pub(crate) fn set_file_path(&mut self, path: PathBuf) {
        self.file_path = Some(path);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== Mirror Tests ====================

    #[test]
    fn test_mirror_weight_defaults_to_zero() {
        let mirror = Mirror::new("m1", "https://example.com/a.bin");
        assert_eq!(mirror.weight(), 0);
    }

    #[test]
    fn test_mirror_with_weight() {
        let mirror = Mirror::new("m1", "https://example.com/a.bin").with_weight(10);
        assert_eq!(mirror.weight(), 10);
    }

    #[test]
    fn test_mirror_non_integer_weight_is_zero() {
        let mirror = Mirror::new("m1", "https://example.com/a.bin")
            .with_metadata(WEIGHT_KEY, Value::String("heavy".to_string()));
        assert_eq!(mirror.weight(), 0);
    }

    #[test]
    fn test_download_item_id_is_stable() {
        let mirror = Mirror::new("m1", "https://example.com/a.bin");
        let first = mirror.download_item("res-1").unwrap();
        let second = mirror.download_item("res-1").unwrap();
        assert_eq!(first.id(), "res-1/m1");
        assert_eq!(first.id(), second.id());
    }

    #[test]
    fn test_download_item_invalid_location_is_none() {
        let mirror = Mirror::new("m1", "not a url");
        assert!(mirror.download_item("res-1").is_none());
    }

    // ==================== Resource Tests ====================

    #[test]
    fn test_resource_accessors() {
        let resource = Resource::new("res-1", Mirror::new("m0", "https://main.example.com/a"))
            .with_alternative(Mirror::new("m1", "https://alt.example.com/a").with_weight(5));

        assert_eq!(resource.id(), "res-1");
        assert_eq!(resource.main_mirror().id(), "m0");
        assert_eq!(resource.alternatives().len(), 1);
        assert!(resource.file_path().is_none());
    }

    #[test]
    fn test_mirror_lookup_prefers_alternatives() {
        let resource = Resource::new("res-1", Mirror::new("m0", "https://main.example.com/a"))
            .with_alternative(Mirror::new("m1", "https://alt.example.com/a"));

        assert_eq!(resource.mirror("m1").unwrap().id(), "m1");
        assert_eq!(resource.mirror("m0").unwrap().id(), "m0");
        assert!(resource.mirror("missing").is_none());
    }

    #[test]
    fn test_resource_serde_roundtrip() {
        let resource = Resource::new("res-1", Mirror::new("m0", "https://main.example.com/a"))
            .with_alternative(Mirror::new("m1", "https://alt.example.com/a").with_weight(3));

        let json = serde_json::to_string(&resource).unwrap();
        let parsed: Resource = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id(), "res-1");
        assert_eq!(parsed.alternatives()[0].weight(), 3);
    }
}
