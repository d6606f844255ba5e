//! Snapshot restore and destructive rollback.

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;

use nix::sys::stat::{utimensat, UtimensatFlags};
use nix::sys::time::TimeSpec;
use pathpatterns::{MatchEntry, MatchList, MatchType, PatternFlag};

use skp_api_types::{FileError, RestoreOptions, RestoreStats};
use skp_datastore::{chunker, merkle, Error, FileEntry, Snapshot};

use crate::engine::Engine;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::task::CancelToken;

/// Include/exclude globs over snapshot paths.
///
/// Patterns are relative globs in the usual backup-tool syntax: a
/// pattern with a slash matches the whole path, one without matches
/// the file name. Include is applied first, then exclude.
struct RestoreFilter {
    include: Vec<MatchEntry>,
    exclude: Vec<MatchEntry>,
}

impl RestoreFilter {
    fn new(options: &RestoreOptions) -> Result<Self, Error> {
        let parse = |pattern: &str, kind| {
            MatchEntry::parse_pattern(pattern, PatternFlag::PATH_NAME, kind).map_err(|err| {
                Error::InvalidArgument(format!("bad pattern '{pattern}' - {err}"))
            })
        };

        let mut include = Vec::new();
        if let Some(pattern) = &options.include_pattern {
            include.push(parse(pattern, MatchType::Include)?);
        }
        let mut exclude = Vec::new();
        if let Some(pattern) = &options.exclude_pattern {
            exclude.push(parse(pattern, MatchType::Exclude)?);
        }

        Ok(Self { include, exclude })
    }

    fn selects(&self, path: &str) -> bool {
        if !self.include.is_empty()
            && self.include.matches(path.as_bytes(), 0u32).unwrap_or(None)
                != Some(MatchType::Include)
        {
            return false;
        }
        self.exclude.matches(path.as_bytes(), 0u32).unwrap_or(None)
            != Some(MatchType::Exclude)
    }
}

fn restore_mtime(path: &Path, modified_time: i64) {
    let seconds = modified_time.max(0) as u64;
    let timespec = TimeSpec::from(std::time::Duration::from_secs(seconds));
    if let Err(err) = utimensat(
        None,
        path,
        &timespec,
        &timespec,
        UtimensatFlags::NoFollowSymlink,
    ) {
        log::warn!("unable to restore mtime on {path:?} - {err}");
    }
}

impl Engine {
    /// Reconstruct a snapshot's files below `target_dir`.
    ///
    /// Collision handling follows the options; when both overwrite and
    /// skip are requested, skip wins. An existing file with neither
    /// set counts as an error and the restore continues.
    pub fn restore(
        &self,
        snapshot_id: &str,
        target_dir: &Path,
        options: &RestoreOptions,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<RestoreStats, Error> {
        let _op = self.shared_op()?;

        let snapshot = self
            .catalog()
            .get_snapshot(snapshot_id)?
            .ok_or_else(|| Error::SnapshotNotFound(snapshot_id.to_string()))?;
        let files = self.catalog().files_of(snapshot_id)?;
        let filter = RestoreFilter::new(options)?;

        let mut stats = RestoreStats {
            integrity_verified: options.verify_integrity,
            ..Default::default()
        };

        if !options.dry_run {
            std::fs::create_dir_all(target_dir).map_err(|err| {
                Error::io_path(format!("unable to create target {target_dir:?}"), err)
            })?;
        }

        for entry in &files {
            cancel.check()?;

            if !filter.selects(entry.path.as_str()) {
                continue;
            }

            let target_path = entry.path.to_fs_path(target_dir);
            let exists = match std::fs::symlink_metadata(&target_path) {
                Ok(_) => true,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
                Err(err) => {
                    self.report_file_error(&mut stats, progress, entry, &err.to_string());
                    continue;
                }
            };

            if exists {
                if options.skip_existing {
                    stats.files_skipped += 1;
                    progress.report(ProgressEvent::FileSkipped {
                        path: entry.path.as_str().to_string(),
                    });
                    continue;
                } else if options.backup_existing {
                    if !options.dry_run {
                        let backup_name = format!(
                            "{}.bak-{}",
                            entry.path.file_name(),
                            proxmox_time::epoch_i64()
                        );
                        let backup_path = target_path.with_file_name(backup_name);
                        if let Err(err) = std::fs::rename(&target_path, &backup_path) {
                            self.report_file_error(
                                &mut stats,
                                progress,
                                entry,
                                &format!("unable to move aside existing file - {err}"),
                            );
                            continue;
                        }
                    }
                } else if !options.overwrite_existing {
                    self.report_file_error(&mut stats, progress, entry, "target file exists");
                    continue;
                }
            }

            if options.dry_run {
                stats.files_restored += 1;
                stats.bytes_restored += entry.size;
                continue;
            }

            match self.restore_one_file(&snapshot, entry, &target_path, options, cancel) {
                Ok(written) => {
                    stats.files_restored += 1;
                    stats.bytes_restored += written;
                    progress.report(ProgressEvent::FileDone {
                        path: entry.path.as_str().to_string(),
                        bytes: written,
                    });
                }
                Err(err)
                    if err.is_per_file() || matches!(err, Error::ChunkNotFound(_)) =>
                {
                    self.report_file_error(&mut stats, progress, entry, &err.to_string());
                }
                Err(err) => return Err(err),
            }
        }

        Ok(stats)
    }

    /// Restore a snapshot and delete everything else below the target.
    ///
    /// Extraneous files and emptied directories are removed; in a dry
    /// run nothing is touched and the planned deletions are reported.
    pub fn rollback(
        &self,
        snapshot_id: &str,
        target_dir: &Path,
        options: &RestoreOptions,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<RestoreStats, Error> {
        let mut forced = options.clone();
        forced.overwrite_existing = true;
        forced.skip_existing = false;
        forced.backup_existing = false;

        let mut stats = self.restore(snapshot_id, target_dir, &forced, progress, cancel)?;

        // the full snapshot file set survives, filters only limit what
        // was freshly written
        let keep: HashSet<std::path::PathBuf> = self
            .catalog()
            .files_of(snapshot_id)?
            .iter()
            .map(|entry| entry.path.to_fs_path(target_dir))
            .collect();

        let mut deleted = Vec::new();

        if target_dir.exists() {
            for entry in walkdir::WalkDir::new(target_dir)
                .contents_first(true)
                .min_depth(1)
            {
                cancel.check()?;
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        progress.report(ProgressEvent::ScanError {
                            path: err.path().map(Path::to_path_buf).unwrap_or_default(),
                            message: err.to_string(),
                        });
                        continue;
                    }
                };
                let path = entry.path();

                if entry.file_type().is_dir() {
                    if !options.dry_run {
                        // only empties go away, ENOTEMPTY is expected
                        let _ = std::fs::remove_dir(path);
                    }
                    continue;
                }

                if keep.contains(path) {
                    continue;
                }

                let display = path
                    .strip_prefix(target_dir)
                    .unwrap_or(path)
                    .to_string_lossy()
                    .into_owned();

                if options.dry_run {
                    deleted.push(display);
                } else {
                    match std::fs::remove_file(path) {
                        Ok(()) => deleted.push(display),
                        Err(err) => {
                            stats.files_with_errors += 1;
                            stats.errors.push(FileError {
                                path: display,
                                message: format!("unable to delete - {err}"),
                            });
                        }
                    }
                }
            }
        }

        deleted.sort();
        stats.deleted_extraneous = deleted;
        Ok(stats)
    }

    fn report_file_error(
        &self,
        stats: &mut RestoreStats,
        progress: &dyn ProgressSink,
        entry: &FileEntry,
        message: &str,
    ) {
        stats.files_with_errors += 1;
        stats.errors.push(FileError {
            path: entry.path.as_str().to_string(),
            message: message.to_string(),
        });
        progress.report(ProgressEvent::FileError {
            path: entry.path.as_str().to_string(),
            message: message.to_string(),
        });
    }

    fn restore_one_file(
        &self,
        snapshot: &Snapshot,
        entry: &FileEntry,
        target_path: &Path,
        options: &RestoreOptions,
        cancel: &CancelToken,
    ) -> Result<u64, Error> {
        let parent = target_path
            .parent()
            .ok_or_else(|| Error::Invariant(format!("no parent for {target_path:?}")))?;
        std::fs::create_dir_all(parent)
            .map_err(|err| Error::io_path(format!("unable to create {parent:?}"), err))?;

        let mut staged = tempfile::Builder::new()
            .prefix(".snapkeep-tmp.")
            .tempfile_in(parent)
            .map_err(|err| Error::io_path(format!("unable to stage in {parent:?}"), err))?;

        let mut written = 0u64;
        for digest in &entry.chunk_digests {
            cancel.check()?;
            let data = self.chunk_store().get(digest)?;
            staged
                .write_all(&data)
                .map_err(|err| Error::io_path(format!("write to {target_path:?} failed"), err))?;
            written += data.len() as u64;
        }

        staged.persist(target_path).map_err(|err| {
            Error::io_path(format!("unable to persist {target_path:?}"), err.error)
        })?;

        if options.preserve_attributes {
            restore_mtime(target_path, entry.modified_time);
        }

        if options.verify_integrity {
            self.verify_restored(snapshot, entry, target_path)?;
        }

        Ok(written)
    }

    // Re-hash a freshly written file and compare against the recorded
    // file digest.
    fn verify_restored(
        &self,
        snapshot: &Snapshot,
        entry: &FileEntry,
        target_path: &Path,
    ) -> Result<(), Error> {
        let file = std::fs::File::open(target_path)
            .map_err(|err| Error::io_path(format!("unable to re-read {target_path:?}"), err))?;

        let mut digests = Vec::new();
        for chunk in chunker::chunks(file, snapshot.chunk_size as usize)? {
            digests.push(skp_datastore::hasher::hash(&chunk?));
        }

        let recomputed = merkle::file_digest(&digests);
        if recomputed != entry.file_digest {
            return Err(Error::Integrity(format!(
                "restored file '{}' hashes to {recomputed}, expected {}",
                entry.path, entry.file_digest
            )));
        }
        Ok(())
    }
}
