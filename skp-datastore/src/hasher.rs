//! BLAKE3 digests over buffers, readers and files.

use std::io::Read;
use std::path::Path;

use skp_api_types::Digest;

use crate::Error;

/// Read window used when streaming files.
const HASH_WINDOW_SIZE: usize = 64 * 1024;

/// One-shot digest over a buffer.
pub fn hash(data: &[u8]) -> Digest {
    Digest::new(*blake3::hash(data).as_bytes())
}

/// Digest of a file, streamed in fixed windows.
pub fn hash_file(path: &Path) -> Result<Digest, Error> {
    let file = std::fs::File::open(path)
        .map_err(|err| Error::io_path(format!("unable to open {path:?}"), err))?;
    hash_reader(file)
}

/// Digest of everything a reader yields.
pub fn hash_reader<R: Read>(mut reader: R) -> Result<Digest, Error> {
    let mut hasher = IncrementalHasher::new();
    let mut buffer = vec![0u8; HASH_WINDOW_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(count) => hasher.update(&buffer[..count]),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(hasher.finalize())
}

/// Accumulator producing the same digest as [`hash`] over any
/// partition of the input.
pub struct IncrementalHasher {
    hasher: blake3::Hasher,
    bytes: u64,
}

impl IncrementalHasher {
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
            bytes: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn byte_count(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> Digest {
        Digest::new(*self.hasher.finalize().as_bytes())
    }
}

impl Default for IncrementalHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader wrapper which updates a digest with all data read.
pub struct ChecksumReader<R> {
    reader: R,
    hasher: IncrementalHasher,
}

impl<R: Read> ChecksumReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            hasher: IncrementalHasher::new(),
        }
    }

    /// Stop hashing, return the inner reader, the digest and the byte count.
    pub fn finish(self) -> (R, Digest, u64) {
        let bytes = self.hasher.byte_count();
        (self.reader, self.hasher.finalize(), bytes)
    }
}

impl<R: Read> Read for ChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        let count = self.reader.read(buf)?;
        if count > 0 {
            self.hasher.update(&buf[..count]);
        }
        Ok(count)
    }
}
