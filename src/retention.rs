//! Retention-driven pruning.

use proxmox_human_byte::HumanByte;

use skp_api_types::{RetentionPolicy, SweepStats};
use skp_datastore::{prune, Error, Snapshot};

use crate::engine::Engine;
use crate::task::CancelToken;

impl Engine {
    /// Delete every snapshot no retention policy keeps, then sweep.
    ///
    /// Policies combine by union of their kept sets. Deletion runs
    /// newest-first with surviving descendants reattached to their
    /// grandparent, so kept chains stay valid. A dry run only reports
    /// the selection.
    pub fn prune(
        &self,
        policies: &[RetentionPolicy],
        dry_run: bool,
        cancel: &CancelToken,
    ) -> Result<(Vec<Snapshot>, SweepStats), Error> {
        if policies.is_empty() {
            return Err(Error::InvalidArgument(
                "refusing to prune without retention policies".into(),
            ));
        }

        let list = self.catalog().list_snapshots()?;
        let now = proxmox_time::epoch_i64();
        let prune_info = prune::compute_prune_info(list, policies, now);

        let mut to_delete = Vec::new();
        for (snapshot, mark) in prune_info {
            log::info!(
                "{mark} snapshot '{}' ({})",
                snapshot.snapshot_id,
                snapshot
                    .created_rfc3339()
                    .unwrap_or_else(|_| snapshot.created_at.to_string()),
            );
            if !mark.keep() {
                to_delete.push(snapshot);
            }
        }

        if dry_run {
            return Ok((to_delete, SweepStats::default()));
        }

        {
            let _op = self.shared_op()?;
            for snapshot in &to_delete {
                cancel.check()?;
                self.catalog()
                    .delete_snapshot_reparent(self.chunk_store(), &snapshot.snapshot_id)?;
            }
        }

        let sweep_stats = self.sweep()?;
        log::info!(
            "prune removed {} snapshots, swept {} chunks ({})",
            to_delete.len(),
            sweep_stats.removed_chunks,
            HumanByte::from(sweep_stats.removed_bytes),
        );

        Ok((to_delete, sweep_stats))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::RepoConfig;
    use crate::progress::DiscardProgress;
    use skp_api_types::{BackupOptions, CHUNK_SIZE_MIN};
    use std::path::Path;

    fn snapshot_of(engine: &Engine, source: &Path, unique: &str) -> String {
        std::fs::write(source.join("common.txt"), b"shared between snapshots").unwrap();
        std::fs::write(source.join("unique.txt"), unique.as_bytes()).unwrap();
        let options = BackupOptions {
            chunk_size: CHUNK_SIZE_MIN,
            ..Default::default()
        };
        engine
            .backup(source, &options, &DiscardProgress, &CancelToken::new())
            .unwrap()
            .snapshot_id
    }

    #[test]
    fn keep_last_two_prunes_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::create(dir.path().join("repo"), RepoConfig::default()).unwrap();
        let source = dir.path().join("source");
        std::fs::create_dir(&source).unwrap();

        let s1 = snapshot_of(&engine, &source, "one");
        let s2 = snapshot_of(&engine, &source, "two");
        let s3 = snapshot_of(&engine, &source, "three");
        let s4 = snapshot_of(&engine, &source, "four");

        // dry run selects without deleting
        let (selected, _) = engine
            .prune(&[RetentionPolicy::keep_last(2)], true, &CancelToken::new())
            .unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(engine.catalog().list_snapshots().unwrap().len(), 4);

        let (deleted, sweep_stats) = engine
            .prune(&[RetentionPolicy::keep_last(2)], false, &CancelToken::new())
            .unwrap();
        let deleted_ids: Vec<_> = deleted
            .iter()
            .map(|snapshot| snapshot.snapshot_id.clone())
            .collect();
        assert_eq!(deleted_ids, vec![s2.clone(), s1.clone()]);

        let remaining: Vec<_> = engine
            .catalog()
            .list_snapshots()
            .unwrap()
            .into_iter()
            .map(|snapshot| snapshot.snapshot_id)
            .collect();
        assert_eq!(remaining, vec![s4.clone(), s3.clone()]);

        // chunks only referenced by s1/s2 are gone, shared ones stay
        assert!(sweep_stats.removed_chunks >= 2);
        assert!(
            engine
                .verify(
                    &s4,
                    skp_api_types::VerifyLevel::Chain,
                    &DiscardProgress,
                    &CancelToken::new()
                )
                .unwrap()
                .ok()
        );
    }

    #[test]
    fn prune_without_policies_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::create(dir.path().join("repo"), RepoConfig::default()).unwrap();
        assert!(matches!(
            engine.prune(&[], false, &CancelToken::new()),
            Err(Error::InvalidArgument(_))
        ));
    }
}
