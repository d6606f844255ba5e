use serde::{Deserialize, Serialize};

/// A predicate selecting snapshots to keep.
///
/// Multiple policies combine by union of their kept sets: a snapshot
/// survives pruning if any policy keeps it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetentionPolicy {
    /// Keep the N most recently created snapshots.
    KeepLast { n: u64 },
    /// Keep snapshots younger than the given age in seconds.
    OlderThan { max_age: i64 },
}

impl RetentionPolicy {
    pub fn keep_last(n: u64) -> Self {
        RetentionPolicy::KeepLast { n }
    }

    pub fn older_than_seconds(max_age: i64) -> Self {
        RetentionPolicy::OlderThan { max_age }
    }

    pub fn older_than_days(days: i64) -> Self {
        RetentionPolicy::OlderThan {
            max_age: days * 24 * 3600,
        }
    }
}
