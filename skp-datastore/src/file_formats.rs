// WARNING: PLEASE DO NOT MODIFY THOSE MAGIC VALUES

// sha256(b"snapkeep uncompressed blob v1.0")[0..8]
pub const UNCOMPRESSED_BLOB_MAGIC_1_0: [u8; 8] = [103, 206, 119, 119, 172, 83, 73, 122];

// sha256(b"snapkeep zstd compressed blob v1.0")[0..8]
pub const COMPRESSED_BLOB_MAGIC_1_0: [u8; 8] = [140, 20, 193, 191, 63, 205, 11, 194];

/// Data blob binary storage format
///
/// The format starts with a 8 byte magic number to identify the type,
/// followed by a 4 byte CRC32 (little endian) over everything after
/// the header. The CRC detects blob file corruption without having to
/// decompress and re-hash the payload.
///
/// (MAGIC || CRC32 || Data)
///
/// This format is used for every chunk payload in the chunk store.
pub const BLOB_MAGIC_LEN: usize = 8;
pub const BLOB_CRC_LEN: usize = 4;
pub const BLOB_HEADER_LEN: usize = BLOB_MAGIC_LEN + BLOB_CRC_LEN;

/// Byte offset of the CRC field inside the header.
pub const BLOB_CRC_OFFSET: usize = BLOB_MAGIC_LEN;
