use skp_api_types::Digest;

use crate::file_formats::*;
use crate::{hasher, Error};

/// Largest payload accepted by [`DataBlob::encode`]; chunks are capped
/// at 16 MiB so this leaves generous headroom.
const MAX_BLOB_SIZE: usize = 32 * 1024 * 1024;

/// Data blob binary storage format
///
/// Data blobs hold chunk payloads on disk, optionally zstd compressed.
/// A simple tagged binary format (see [`crate::file_formats`]) is used
/// to store them and to transfer them over the network.
pub struct DataBlob {
    raw_data: Vec<u8>, // tagged, possibly compressed data
}

impl DataBlob {
    /// accessor to raw_data field
    pub fn raw_data(&self) -> &[u8] {
        &self.raw_data
    }

    /// Returns raw_data size
    pub fn raw_size(&self) -> u64 {
        self.raw_data.len() as u64
    }

    /// Consume self and returns raw_data
    pub fn into_inner(self) -> Vec<u8> {
        self.raw_data
    }

    /// accessor to blob type (magic number)
    pub fn magic(&self) -> &[u8; 8] {
        self.raw_data[0..BLOB_MAGIC_LEN].try_into().unwrap()
    }

    /// accessor to crc32 checksum
    pub fn crc(&self) -> u32 {
        let crc_o = BLOB_CRC_OFFSET;
        u32::from_le_bytes(self.raw_data[crc_o..crc_o + BLOB_CRC_LEN].try_into().unwrap())
    }

    // set the CRC checksum field
    fn set_crc(&mut self, crc: u32) {
        let crc_o = BLOB_CRC_OFFSET;
        self.raw_data[crc_o..crc_o + BLOB_CRC_LEN].copy_from_slice(&crc.to_le_bytes());
    }

    /// compute the CRC32 checksum
    pub fn compute_crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.raw_data[BLOB_HEADER_LEN..]);
        hasher.finalize()
    }

    // verify the CRC32 checksum
    pub fn verify_crc(&self) -> Result<(), Error> {
        let expected_crc = self.compute_crc();
        if expected_crc != self.crc() {
            return Err(Error::Integrity("blob has wrong CRC checksum".into()));
        }
        Ok(())
    }

    /// Create a DataBlob, optionally compressed.
    ///
    /// Compression is only kept when the result is actually shorter
    /// than the plain payload.
    pub fn encode(data: &[u8], compress: bool) -> Result<Self, Error> {
        if data.len() > MAX_BLOB_SIZE {
            return Err(Error::InvalidArgument(format!(
                "data blob too large ({} bytes)",
                data.len()
            )));
        }

        let max_data_len = data.len() + BLOB_HEADER_LEN;
        if compress {
            let mut comp_data = Vec::with_capacity(max_data_len);
            comp_data.extend_from_slice(&COMPRESSED_BLOB_MAGIC_1_0);
            comp_data.extend_from_slice(&[0u8; BLOB_CRC_LEN]);

            zstd::stream::copy_encode(data, &mut comp_data, 1)
                .map_err(|err| Error::io_path("zstd compression failed".to_string(), err))?;

            if comp_data.len() < max_data_len {
                let mut blob = DataBlob {
                    raw_data: comp_data,
                };
                let crc = blob.compute_crc();
                blob.set_crc(crc);
                return Ok(blob);
            }
        }

        let mut raw_data = Vec::with_capacity(max_data_len);
        raw_data.extend_from_slice(&UNCOMPRESSED_BLOB_MAGIC_1_0);
        raw_data.extend_from_slice(&[0u8; BLOB_CRC_LEN]);
        raw_data.extend_from_slice(data);

        let mut blob = DataBlob { raw_data };
        let crc = blob.compute_crc();
        blob.set_crc(crc);

        Ok(blob)
    }

    /// Decode blob data, optionally verifying the content digest.
    pub fn decode(&self, digest: Option<&Digest>) -> Result<Vec<u8>, Error> {
        let magic = self.magic();

        let data = if magic == &UNCOMPRESSED_BLOB_MAGIC_1_0 {
            self.raw_data[BLOB_HEADER_LEN..].to_vec()
        } else if magic == &COMPRESSED_BLOB_MAGIC_1_0 {
            let mut reader = &self.raw_data[BLOB_HEADER_LEN..];
            zstd::stream::decode_all(&mut reader)
                .map_err(|err| Error::Integrity(format!("zstd decompression failed - {err}")))?
        } else {
            return Err(Error::Integrity("invalid blob magic number".into()));
        };

        if let Some(digest) = digest {
            Self::verify_digest(&data, digest)?;
        }

        Ok(data)
    }

    /// Load blob from ``reader``, verify CRC
    pub fn load_from_reader(reader: &mut dyn std::io::Read) -> Result<Self, Error> {
        let mut data = Vec::with_capacity(1024 * 1024);
        reader.read_to_end(&mut data)?;

        let blob = Self::from_raw(data)?;

        blob.verify_crc()?;

        Ok(blob)
    }

    /// Create blob from raw data. Validates magic number and length.
    pub fn from_raw(data: Vec<u8>) -> Result<Self, Error> {
        if data.len() < BLOB_HEADER_LEN {
            return Err(Error::Integrity(format!(
                "blob too small ({} bytes)",
                data.len()
            )));
        }

        let magic: &[u8; 8] = data[0..BLOB_MAGIC_LEN].try_into().unwrap();
        if magic != &UNCOMPRESSED_BLOB_MAGIC_1_0 && magic != &COMPRESSED_BLOB_MAGIC_1_0 {
            return Err(Error::Integrity("unable to parse raw blob - wrong magic".into()));
        }

        Ok(Self { raw_data: data })
    }

    fn verify_digest(data: &[u8], expected: &Digest) -> Result<(), Error> {
        let computed = hasher::hash(data);
        if &computed != expected {
            return Err(Error::Integrity(format!(
                "blob digest mismatch (expected {expected}, got {computed})"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_decode_uncompressed() {
        // high-entropy data stays uncompressed
        let data: Vec<u8> = (0..4096u32)
            .flat_map(|i| i.wrapping_mul(2654435761).to_le_bytes())
            .collect();
        let blob = DataBlob::encode(&data, true).unwrap();
        assert_eq!(blob.magic(), &UNCOMPRESSED_BLOB_MAGIC_1_0);
        blob.verify_crc().unwrap();
        assert_eq!(blob.decode(None).unwrap(), data);
    }

    #[test]
    fn encode_compresses_redundant_data() {
        let data = vec![0u8; 64 * 1024];
        let blob = DataBlob::encode(&data, true).unwrap();
        assert_eq!(blob.magic(), &COMPRESSED_BLOB_MAGIC_1_0);
        assert!(blob.raw_size() < data.len() as u64);
        assert_eq!(blob.decode(None).unwrap(), data);
    }

    #[test]
    fn decode_verifies_digest() {
        let data = b"payload".to_vec();
        let blob = DataBlob::encode(&data, false).unwrap();
        let good = crate::hasher::hash(&data);
        assert_eq!(blob.decode(Some(&good)).unwrap(), data);

        let bad = crate::hasher::hash(b"other");
        assert!(matches!(blob.decode(Some(&bad)), Err(Error::Integrity(_))));
    }

    #[test]
    fn corrupted_blob_fails_crc() {
        let blob = DataBlob::encode(b"some chunk bytes", false).unwrap();
        let mut raw = blob.into_inner();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let blob = DataBlob::from_raw(raw).unwrap();
        assert!(matches!(blob.verify_crc(), Err(Error::Integrity(_))));
    }

    #[test]
    fn load_rejects_wrong_magic() {
        let data = vec![0u8; 32];
        assert!(matches!(
            DataBlob::from_raw(data),
            Err(Error::Integrity(_))
        ));
    }
}
