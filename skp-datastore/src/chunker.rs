//! Fixed-size chunking of byte streams.

use std::io::Read;

use skp_api_types::{CHUNK_SIZE_DEFAULT, CHUNK_SIZE_MAX, CHUNK_SIZE_MIN};

use crate::Error;

/// Check a chunk size against the accepted range.
pub fn verify_chunk_size(size: usize) -> Result<(), Error> {
    if !(CHUNK_SIZE_MIN..=CHUNK_SIZE_MAX).contains(&size) {
        return Err(Error::InvalidArgument(format!(
            "chunk size {size} out of range [{CHUNK_SIZE_MIN}, {CHUNK_SIZE_MAX}]"
        )));
    }
    Ok(())
}

/// Split a reader into fixed sized chunks.
///
/// Every produced chunk has exactly `chunk_size` bytes except the last
/// one, which may be shorter. An empty input yields no chunks at all.
/// The sequence is single-pass; restart by re-opening the reader.
pub fn chunks<R: Read>(reader: R, chunk_size: usize) -> Result<FixedChunker<R>, Error> {
    verify_chunk_size(chunk_size)?;
    Ok(FixedChunker {
        reader,
        chunk_size,
        done: false,
    })
}

/// Iterator produced by [`chunks`]; the sync counterpart of a fixed
/// chunk stream.
pub struct FixedChunker<R> {
    reader: R,
    chunk_size: usize,
    done: bool,
}

impl<R: Read> FixedChunker<R> {
    fn fill_chunk(&mut self) -> Result<Vec<u8>, Error> {
        let mut buffer = vec![0u8; self.chunk_size];
        let mut filled = 0;

        while filled < self.chunk_size {
            match self.reader.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(count) => filled += count,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }

        buffer.truncate(filled);
        Ok(buffer)
    }
}

impl<R: Read> Iterator for FixedChunker<R> {
    type Item = Result<Vec<u8>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.fill_chunk() {
            Ok(chunk) => {
                if chunk.len() < self.chunk_size {
                    self.done = true;
                }
                if chunk.is_empty() {
                    None
                } else {
                    Some(Ok(chunk))
                }
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Number of chunks a file of `size` bytes splits into.
pub fn chunk_count(size: u64, chunk_size: usize) -> u64 {
    size.div_ceil(chunk_size as u64)
}

#[cfg(test)]
mod test {
    use super::*;

    fn collect(data: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
        chunks(data, chunk_size)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn rejects_out_of_range_sizes() {
        assert!(verify_chunk_size(CHUNK_SIZE_MIN).is_ok());
        assert!(verify_chunk_size(CHUNK_SIZE_MAX).is_ok());
        assert!(verify_chunk_size(CHUNK_SIZE_DEFAULT).is_ok());
        assert!(matches!(
            verify_chunk_size(1024),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            verify_chunk_size(CHUNK_SIZE_MAX + 1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            chunks(&b""[..], 1024),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(collect(b"", CHUNK_SIZE_MIN).is_empty());
    }

    #[test]
    fn partial_final_chunk() {
        let data = vec![1u8; CHUNK_SIZE_MIN + 100];
        let list = collect(&data, CHUNK_SIZE_MIN);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].len(), CHUNK_SIZE_MIN);
        assert_eq!(list[1].len(), 100);
    }

    #[test]
    fn exact_multiple_has_no_partial_chunk() {
        let data = vec![2u8; 3 * CHUNK_SIZE_MIN];
        let list = collect(&data, CHUNK_SIZE_MIN);
        assert_eq!(list.len(), 3);
        assert!(list.iter().all(|chunk| chunk.len() == CHUNK_SIZE_MIN));
    }

    #[test]
    fn concatenation_restores_input() {
        let data: Vec<u8> = (0..CHUNK_SIZE_MIN * 2 + 7).map(|i| i as u8).collect();
        let joined: Vec<u8> = collect(&data, CHUNK_SIZE_MIN).concat();
        assert_eq!(joined, data);
    }

    #[test]
    fn chunk_count_math() {
        assert_eq!(chunk_count(0, 4096), 0);
        assert_eq!(chunk_count(4096, 4096), 1);
        assert_eq!(chunk_count(4097, 4096), 2);
    }
}
