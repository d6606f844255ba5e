//! Snapshot creation: scanner -> chunker -> chunk store -> catalog.

use std::path::Path;

use proxmox_human_byte::HumanByte;

use skp_api_types::{BackupOptions, BackupStats, Digest, FileError, FileKind, VerifyLevel};
use skp_datastore::{chunker, merkle, Error, FileEntry, NewSnapshot, RelativePath};

use crate::engine::Engine;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::scan::{FileCandidate, Scanner};
use crate::task::CancelToken;

struct FileOutcome {
    entry: FileEntry,
    chunks_created: u64,
    chunks_reused: u64,
}

impl Engine {
    /// Capture `source_root` into a new snapshot.
    ///
    /// The snapshot chains to the most recent finished snapshot of the
    /// same source root. Unreadable files are reported and dropped from
    /// the snapshot; integrity and invariant violations roll the whole
    /// snapshot back.
    pub fn backup(
        &self,
        source_root: &Path,
        options: &BackupOptions,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<BackupStats, Error> {
        let _op = self.shared_op()?;
        chunker::verify_chunk_size(options.chunk_size)?;

        let source_root = source_root.canonicalize().map_err(|err| {
            Error::io_path(format!("unable to resolve source root {source_root:?}"), err)
        })?;
        let source_root_str = source_root
            .to_str()
            .ok_or_else(|| {
                Error::InvalidArgument(format!("source root {source_root:?} is not valid unicode"))
            })?
            .to_string();

        let scanner = Scanner::new(&source_root, options.scan)?;

        let parent_id = self
            .catalog()
            .latest_snapshot_for_root(&source_root_str)?
            .map(|snapshot| snapshot.snapshot_id);

        let snapshot = self.catalog().create_snapshot(NewSnapshot {
            name: options.name.clone(),
            description: options.description.clone(),
            source_root: source_root_str,
            parent_id,
            chunk_size: options.chunk_size as u64,
        })?;
        let snapshot_id = snapshot.snapshot_id;

        match self.backup_inner(&scanner, &snapshot_id, options, progress, cancel) {
            Ok(stats) => Ok(stats),
            Err(err) => {
                // drop the partial snapshot together with its references
                if let Err(cleanup_err) =
                    self.catalog()
                        .delete_snapshot(self.chunk_store(), &snapshot_id, false)
                {
                    log::error!(
                        "cleanup of aborted snapshot '{snapshot_id}' failed - {cleanup_err}"
                    );
                }
                Err(err)
            }
        }
    }

    fn backup_inner(
        &self,
        scanner: &Scanner,
        snapshot_id: &str,
        options: &BackupOptions,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<BackupStats, Error> {
        let mut stats = BackupStats {
            snapshot_id: snapshot_id.to_string(),
            ..Default::default()
        };
        let mut recorded: Vec<(String, Digest)> = Vec::new();

        for candidate in scanner.walk(progress) {
            cancel.check()?;

            if candidate.kind != FileKind::Regular {
                stats.files_skipped += 1;
                progress.report(ProgressEvent::FileSkipped {
                    path: candidate.absolute_path.to_string_lossy().into_owned(),
                });
                continue;
            }

            let path = match candidate
                .absolute_path
                .strip_prefix(scanner.root())
                .map_err(|_| {
                    Error::Invariant(format!(
                        "scanned path {:?} outside of {:?}",
                        candidate.absolute_path,
                        scanner.root()
                    ))
                })
                .and_then(RelativePath::from_fs_path)
            {
                Ok(path) => path,
                Err(err) => {
                    stats.files_with_errors += 1;
                    stats.errors.push(FileError {
                        path: candidate.absolute_path.to_string_lossy().into_owned(),
                        message: err.to_string(),
                    });
                    progress.report(ProgressEvent::FileError {
                        path: candidate.absolute_path.to_string_lossy().into_owned(),
                        message: err.to_string(),
                    });
                    continue;
                }
            };

            progress.report(ProgressEvent::FileStarted {
                path: path.as_str().to_string(),
            });

            match self.backup_one_file(&candidate, &path, snapshot_id, options.chunk_size, cancel)
            {
                Ok(outcome) => {
                    self.catalog()
                        .record_file(self.chunk_store(), &outcome.entry)?;
                    recorded.push((
                        outcome.entry.path.as_str().to_string(),
                        outcome.entry.file_digest,
                    ));
                    stats.files_processed += 1;
                    stats.bytes_processed += outcome.entry.size;
                    stats.chunks_created += outcome.chunks_created;
                    stats.chunks_reused += outcome.chunks_reused;
                    progress.report(ProgressEvent::FileDone {
                        path: path.as_str().to_string(),
                        bytes: outcome.entry.size,
                    });
                }
                Err(err) if err.is_per_file() => {
                    stats.files_with_errors += 1;
                    stats.errors.push(FileError {
                        path: path.as_str().to_string(),
                        message: err.to_string(),
                    });
                    progress.report(ProgressEvent::FileError {
                        path: path.as_str().to_string(),
                        message: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }

        let snapshot_root =
            merkle::snapshot_root(recorded.iter().map(|(path, digest)| (path.as_str(), digest)));

        if options.verify_integrity {
            let verify = self.verify(snapshot_id, VerifyLevel::FileHashes, progress, cancel)?;
            if !verify.ok() {
                return Err(Error::Integrity(format!(
                    "post-backup verification of '{snapshot_id}' failed with {} errors",
                    verify.errors.len()
                )));
            }
            stats.integrity_verified = true;
        }

        self.catalog().finalize_snapshot(
            snapshot_id,
            &snapshot_root,
            stats.files_processed,
            stats.bytes_processed,
        )?;

        log::info!(
            "snapshot '{snapshot_id}': {} files, {} ({} new chunks, {} reused, {} errors)",
            stats.files_processed,
            HumanByte::from(stats.bytes_processed),
            stats.chunks_created,
            stats.chunks_reused,
            stats.files_with_errors,
        );

        Ok(stats)
    }

    fn backup_one_file(
        &self,
        candidate: &FileCandidate,
        path: &RelativePath,
        snapshot_id: &str,
        chunk_size: usize,
        cancel: &CancelToken,
    ) -> Result<FileOutcome, Error> {
        let file = std::fs::File::open(&candidate.absolute_path).map_err(|err| {
            Error::io_path(
                format!("unable to open {:?}", candidate.absolute_path),
                err,
            )
        })?;

        let mut chunk_digests = Vec::new();
        let mut chunks_created = 0;
        let mut chunks_reused = 0;
        let mut size = 0u64;

        for chunk in chunker::chunks(file, chunk_size)? {
            cancel.check()?;
            let chunk = chunk?;
            size += chunk.len() as u64;

            let (digest, known, _) = self.chunk_store().insert_chunk(&chunk)?;
            if known {
                chunks_reused += 1;
            } else {
                chunks_created += 1;
            }
            chunk_digests.push(digest);
        }

        let file_digest = merkle::file_digest(&chunk_digests);

        Ok(FileOutcome {
            entry: FileEntry {
                file_id: 0,
                snapshot_id: snapshot_id.to_string(),
                path: path.clone(),
                size,
                modified_time: candidate.modified_time,
                file_digest,
                chunk_digests,
            },
            chunks_created,
            chunks_reused,
        })
    }
}
