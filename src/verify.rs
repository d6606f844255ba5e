//! End-to-end snapshot verification.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use skp_api_types::{Digest, VerifyError, VerifyLevel, VerifyStats};
use skp_datastore::{merkle, Error};

use crate::engine::Engine;
use crate::progress::{OpProgress, ProgressSink};
use crate::task::CancelToken;

const VERIFY_WORKERS: usize = 4;

impl Engine {
    /// Verify a snapshot at the requested depth.
    ///
    /// Every level reads and digest-checks all referenced chunks;
    /// `FileHashes` additionally recomputes each file digest from its
    /// chunk list, `Chain` additionally validates the parent chain.
    /// Failures are collected per chunk and per file, not aborted on.
    pub fn verify(
        &self,
        snapshot_id: &str,
        level: VerifyLevel,
        _progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<VerifyStats, Error> {
        let _op = self.shared_op()?;

        if self.catalog().get_snapshot(snapshot_id)?.is_none() {
            return Err(Error::SnapshotNotFound(snapshot_id.to_string()));
        }
        let files = self.catalog().files_of(snapshot_id)?;

        let mut stats = VerifyStats {
            snapshot_id: snapshot_id.to_string(),
            ..Default::default()
        };

        let unique: BTreeSet<Digest> = files
            .iter()
            .flat_map(|entry| entry.chunk_digests.iter().copied())
            .collect();

        let errors: Mutex<Vec<VerifyError>> = Mutex::new(Vec::new());
        let verified = AtomicU64::new(0);
        let store = self.chunk_store();

        let (sender, receiver) = crossbeam_channel::bounded::<Digest>(VERIFY_WORKERS);

        std::thread::scope(|scope| -> Result<(), Error> {
            for _ in 0..VERIFY_WORKERS {
                let receiver = receiver.clone();
                let errors = &errors;
                let verified = &verified;
                scope.spawn(move || {
                    while let Ok(digest) = receiver.recv() {
                        match store.get(&digest) {
                            Ok(_) => {
                                verified.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(err) => {
                                errors.lock().unwrap().push(VerifyError {
                                    path: None,
                                    digest: Some(digest),
                                    message: err.to_string(),
                                });
                            }
                        }
                    }
                });
            }

            for digest in &unique {
                cancel.check()?;
                if sender.send(*digest).is_err() {
                    break;
                }
            }
            drop(sender);
            Ok(())
        })?;

        stats.chunks_verified = verified.load(Ordering::Relaxed);
        stats.errors = errors.into_inner().unwrap();

        if level >= VerifyLevel::FileHashes {
            let mut progress = OpProgress::new(files.len() as u64);
            for entry in &files {
                cancel.check()?;
                let recomputed = merkle::file_digest(&entry.chunk_digests);
                if recomputed != entry.file_digest {
                    stats.errors.push(VerifyError {
                        path: Some(entry.path.as_str().to_string()),
                        digest: None,
                        message: format!(
                            "file digest mismatch (stored {}, recomputed {recomputed})",
                            entry.file_digest
                        ),
                    });
                }
                stats.files_verified += 1;
                progress.done += 1;
            }
            log::debug!("verified file digests: {progress}");
        }

        if level >= VerifyLevel::Chain && !self.catalog().validate_chain(snapshot_id)? {
            stats.errors.push(VerifyError {
                path: None,
                digest: None,
                message: format!("snapshot chain of '{snapshot_id}' is broken"),
            });
        }

        if stats.ok() {
            log::info!(
                "verify '{snapshot_id}' ok ({} chunks, {} files)",
                stats.chunks_verified,
                stats.files_verified,
            );
        } else {
            log::warn!(
                "verify '{snapshot_id}' failed with {} errors",
                stats.errors.len(),
            );
        }

        Ok(stats)
    }
}
