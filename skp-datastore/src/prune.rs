//! Retention selection: which snapshots survive a prune.

use std::collections::HashSet;

use skp_api_types::RetentionPolicy;

use crate::snapshot::Snapshot;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PruneMark {
    Keep,
    Remove,
}

impl PruneMark {
    pub fn keep(self) -> bool {
        self != PruneMark::Remove
    }
}

impl std::fmt::Display for PruneMark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PruneMark::Keep => "keep",
            PruneMark::Remove => "remove",
        })
    }
}

fn mark_keep_last(kept: &mut HashSet<String>, list: &[Snapshot], keep: usize) {
    for snapshot in list.iter().take(keep) {
        kept.insert(snapshot.snapshot_id.clone());
    }
}

fn mark_younger_than(kept: &mut HashSet<String>, list: &[Snapshot], max_age: i64, now: i64) {
    for snapshot in list {
        if now - snapshot.created_at < max_age {
            kept.insert(snapshot.snapshot_id.clone());
        }
    }
}

/// Mark every snapshot as kept or removable.
///
/// Policies combine by union: one policy keeping a snapshot is enough.
/// Without any policy nothing is marked for removal. The result is
/// ordered newest first, which is also the safe deletion order
/// (children precede their parents in creation order).
pub fn compute_prune_info(
    mut list: Vec<Snapshot>,
    policies: &[RetentionPolicy],
    now: i64,
) -> Vec<(Snapshot, PruneMark)> {
    Snapshot::sort_list(&mut list, false);

    let mut kept = HashSet::new();

    if policies.is_empty() {
        for snapshot in &list {
            kept.insert(snapshot.snapshot_id.clone());
        }
    }

    for policy in policies {
        match *policy {
            RetentionPolicy::KeepLast { n } => mark_keep_last(&mut kept, &list, n as usize),
            RetentionPolicy::OlderThan { max_age } => {
                mark_younger_than(&mut kept, &list, max_age, now)
            }
        }
    }

    list.into_iter()
        .map(|snapshot| {
            let mark = if kept.contains(&snapshot.snapshot_id) {
                PruneMark::Keep
            } else {
                PruneMark::Remove
            };
            (snapshot, mark)
        })
        .collect()
}
