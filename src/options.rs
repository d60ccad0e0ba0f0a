//! Request configuration: dispatch priority and storage priority.

use serde::{Deserialize, Serialize};

/// Queue priority assigned to `high` requests.
const HIGH_PRIORITY: i64 = 100;

/// Queue priority assigned to `urgent` requests when no dedicated priority
/// scheduler is available.
const URGENT_FALLBACK_PRIORITY: i64 = 1_000;

/// Per-request dispatch hint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadPriority {
    /// Dispatched in arrival order behind high and urgent work.
    #[default]
    Normal,
    /// Dispatched ahead of normal work on the same scheduler.
    High,
    /// Routed to the dedicated priority scheduler when one exists.
    Urgent,
}

impl DownloadPriority {
    /// The integer queue priority this bucket maps to.
    ///
    /// `Urgent` work is normally routed to a dedicated scheduler; the value
    /// returned here is the fallback used when none is configured.
    #[must_use]
    pub fn queue_priority(self) -> i64 {
        match self {
            Self::Normal => 0,
            Self::High => HIGH_PRIORITY,
            Self::Urgent => URGENT_FALLBACK_PRIORITY,
        }
    }
}

/// Per-resource storage hint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoragePriority {
    /// Evictable by cache cleanup.
    #[default]
    Cached,
    /// Retained across cleanup.
    Permanent,
}

impl StoragePriority {
    /// Returns the index string representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::Permanent => "permanent",
        }
    }
}

impl std::str::FromStr for StoragePriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cached" => Ok(Self::Cached),
            "permanent" => Ok(Self::Permanent),
            _ => Err(format!("invalid storage priority: {s}")),
        }
    }
}

/// Configuration attached to a batch of resource requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Dispatch priority for the produced work items.
    #[serde(default)]
    pub download_priority: DownloadPriority,
    /// Eviction class for the cached files.
    #[serde(default)]
    pub storage_priority: StoragePriority,
}

impl RequestOptions {
    /// Options with a specific download priority and default storage.
    #[must_use]
    pub fn with_download_priority(download_priority: DownloadPriority) -> Self {
        Self {
            download_priority,
            ..Self::default()
        }
    }

    /// Options marking the resources as permanent.
    #[must_use]
    pub fn permanent() -> Self {
        Self {
            storage_priority: StoragePriority::Permanent,
            ..Self::default()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_mapping() {
        assert_eq!(DownloadPriority::Normal.queue_priority(), 0);
        assert_eq!(DownloadPriority::High.queue_priority(), 100);
        assert_eq!(DownloadPriority::Urgent.queue_priority(), 1_000);
    }

    #[test]
    fn test_defaults() {
        let options = RequestOptions::default();
        assert_eq!(options.download_priority, DownloadPriority::Normal);
        assert_eq!(options.storage_priority, StoragePriority::Cached);
    }

    #[test]
    fn test_storage_priority_str_roundtrip() {
        for priority in [StoragePriority::Cached, StoragePriority::Permanent] {
            let parsed: StoragePriority = priority.as_str().parse().unwrap();
            assert_eq!(parsed, priority);
        }
        assert!("evictable".parse::<StoragePriority>().is_err());
    }

    #[test]
    fn test_options_serde_snake_case() {
        let options = RequestOptions {
            download_priority: DownloadPriority::Urgent,
            storage_priority: StoragePriority::Permanent,
        };
        let json = serde_json::to_string(&options).unwrap();
        assert!(json.contains("\"urgent\""));
        assert!(json.contains("\"permanent\""));
        let parsed: RequestOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, options);
    }
}
