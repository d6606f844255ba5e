//! Deterministic directory scanning.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use walkdir::{DirEntry, WalkDir};

use skp_api_types::{FileKind, ScanOptions, SymlinkStrategy};
use skp_datastore::Error;

use crate::progress::{ProgressEvent, ProgressSink};

/// One scanned directory entry.
///
/// Directories are traversed but never emitted as candidates.
#[derive(Clone, Debug)]
pub struct FileCandidate {
    pub absolute_path: PathBuf,
    pub size: u64,
    pub modified_time: i64,
    pub kind: FileKind,
}

/// Walks a directory tree in lexicographic byte order.
///
/// Per-entry I/O errors go to the progress sink and the entry is
/// skipped; scanning always continues.
pub struct Scanner {
    root: PathBuf,
    options: ScanOptions,
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

fn modified_epoch(metadata: &std::fs::Metadata) -> i64 {
    match metadata.modified() {
        Ok(modified) => match modified.duration_since(UNIX_EPOCH) {
            Ok(elapsed) => elapsed.as_secs() as i64,
            Err(before_epoch) => -(before_epoch.duration().as_secs() as i64),
        },
        Err(_) => 0,
    }
}

impl Scanner {
    pub fn new(root: impl Into<PathBuf>, options: ScanOptions) -> Result<Self, Error> {
        let root: PathBuf = root.into();
        let metadata = std::fs::metadata(&root)
            .map_err(|err| Error::io_path(format!("unable to scan {root:?}"), err))?;
        if !metadata.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "scan root {root:?} is not a directory"
            )));
        }
        Ok(Self { root, options })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lazy candidate sequence; children of every directory are sorted
    /// lexicographically by byte order.
    pub fn walk<'a>(&'a self, progress: &'a dyn ProgressSink) -> ScanIter<'a> {
        let follow = self.options.symlink_strategy == SymlinkStrategy::Follow;
        let include_hidden = self.options.include_hidden;

        let walker = WalkDir::new(&self.root)
            .follow_links(follow)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(Box::new(move |entry: &DirEntry| {
                entry.depth() == 0 || include_hidden || !is_hidden(entry)
            }) as Box<dyn FnMut(&DirEntry) -> bool>);

        ScanIter {
            inner: walker,
            options: self.options,
            progress,
        }
    }
}

pub struct ScanIter<'a> {
    inner: walkdir::FilterEntry<walkdir::IntoIter, Box<dyn FnMut(&DirEntry) -> bool>>,
    options: ScanOptions,
    progress: &'a dyn ProgressSink,
}

impl ScanIter<'_> {
    fn candidate(&self, entry: &DirEntry) -> Result<Option<FileCandidate>, Error> {
        let file_type = entry.file_type();

        if file_type.is_dir() {
            return Ok(None);
        }

        if file_type.is_symlink() {
            // only reachable without follow_links
            match self.options.symlink_strategy {
                SymlinkStrategy::Skip => return Ok(None),
                SymlinkStrategy::Preserve => {
                    let metadata = entry.metadata().map_err(|err| {
                        Error::io_path(format!("unable to stat symlink {:?}", entry.path()), err.into())
                    })?;
                    return Ok(Some(FileCandidate {
                        absolute_path: entry.path().to_path_buf(),
                        size: 0,
                        modified_time: modified_epoch(&metadata),
                        kind: FileKind::Symlink,
                    }));
                }
                SymlinkStrategy::Follow => return Ok(None),
            }
        }

        if !file_type.is_file() {
            // sockets, fifos and friends are not backed up
            return Ok(None);
        }

        let metadata = entry
            .metadata()
            .map_err(|err| Error::io_path(format!("unable to stat {:?}", entry.path()), err.into()))?;

        Ok(Some(FileCandidate {
            absolute_path: entry.path().to_path_buf(),
            size: metadata.len(),
            modified_time: modified_epoch(&metadata),
            kind: FileKind::Regular,
        }))
    }
}

impl Iterator for ScanIter<'_> {
    type Item = FileCandidate;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().map(Path::to_path_buf).unwrap_or_default();
                    self.progress.report(ProgressEvent::ScanError {
                        path,
                        message: err.to_string(),
                    });
                    continue;
                }
            };

            match self.candidate(&entry) {
                Ok(Some(candidate)) => return Some(candidate),
                Ok(None) => continue,
                Err(err) => {
                    self.progress.report(ProgressEvent::ScanError {
                        path: entry.path().to_path_buf(),
                        message: err.to_string(),
                    });
                    continue;
                }
            }
        }
    }
}
