//! Low level snapkeep data storage: content-addressed chunk repository,
//! snapshot catalog, Merkle rules and retention selection.

mod error;
pub use error::Error;

pub mod hasher;
pub use hasher::{ChecksumReader, IncrementalHasher};

pub mod chunker;
pub use chunker::{chunks, verify_chunk_size, FixedChunker};

pub mod file_formats;

mod data_blob;
pub use data_blob::DataBlob;

mod chunk_store;
pub use chunk_store::{ChunkStore, SharedConnection};

pub mod snapshot;
pub use snapshot::{FileEntry, RelativePath, Snapshot};

pub mod merkle;

mod catalog;
pub use catalog::{Catalog, NewSnapshot};

pub mod prune;

mod schema;
