//! Merkle digests over chunk lists and file sets, and the structural
//! snapshot diff derived from them.
//!
//! The rules are fixed: a file digest commits to the ordered list of
//! chunk addresses, a snapshot root commits to the set of
//! `(path, file digest)` pairs ordered by path bytes. Chunk content is
//! covered separately by per-chunk digest verification on read.

use std::collections::BTreeMap;

use skp_api_types::{Digest, DiffEntry, DiffKind};

use crate::hasher::IncrementalHasher;
use crate::snapshot::FileEntry;

/// Digest of a file: BLAKE3 over the concatenated chunk digests.
///
/// An empty chunk list (empty file) hashes the empty string.
pub fn file_digest(chunk_digests: &[Digest]) -> Digest {
    let mut hasher = IncrementalHasher::new();
    for digest in chunk_digests {
        hasher.update(digest.bytes());
    }
    hasher.finalize()
}

/// Root of a snapshot: BLAKE3 over `(path_bytes || 0x00 ||
/// file_digest_bytes)` for every entry, ordered by path ascending
/// byte-wise.
pub fn snapshot_root<'a, I, P>(entries: I) -> Digest
where
    I: IntoIterator<Item = (P, &'a Digest)>,
    P: AsRef<str>,
{
    let mut sorted: Vec<(P, &Digest)> = entries.into_iter().collect();
    sorted.sort_by(|a, b| a.0.as_ref().as_bytes().cmp(b.0.as_ref().as_bytes()));

    let mut hasher = IncrementalHasher::new();
    for (path, digest) in sorted {
        hasher.update(path.as_ref().as_bytes());
        hasher.update(&[0u8]);
        hasher.update(digest.bytes());
    }
    hasher.finalize()
}

/// Convenience wrapper computing the root from file entries.
pub fn snapshot_root_of(entries: &[FileEntry]) -> Digest {
    snapshot_root(
        entries
            .iter()
            .map(|entry| (entry.path.as_str(), &entry.file_digest)),
    )
}

/// Structural diff of two file sets, joined on path.
///
/// Paths only in `b` are Added, only in `a` are Deleted, present in
/// both with differing file digests are Modified. Unchanged paths are
/// omitted. The result is ordered by path.
pub fn diff(a: &[FileEntry], b: &[FileEntry]) -> Vec<DiffEntry> {
    let map_a: BTreeMap<&str, &Digest> = a
        .iter()
        .map(|entry| (entry.path.as_str(), &entry.file_digest))
        .collect();
    let map_b: BTreeMap<&str, &Digest> = b
        .iter()
        .map(|entry| (entry.path.as_str(), &entry.file_digest))
        .collect();

    let mut result = Vec::new();

    for (path, digest_a) in &map_a {
        match map_b.get(path) {
            None => result.push(DiffEntry {
                path: path.to_string(),
                kind: DiffKind::Deleted,
            }),
            Some(digest_b) if digest_a != digest_b => result.push(DiffEntry {
                path: path.to_string(),
                kind: DiffKind::Modified,
            }),
            Some(_) => (),
        }
    }

    for path in map_b.keys() {
        if !map_a.contains_key(path) {
            result.push(DiffEntry {
                path: path.to_string(),
                kind: DiffKind::Added,
            });
        }
    }

    result.sort_by(|a, b| a.path.cmp(&b.path));
    result
}
