use crate::StorageError;
use flate2::{read::ZlibDecoder, Compress, Compression, FlushCompress, Status};
use std::io::Read;

/// Worst-case zlib output size for `len` input bytes.
pub fn compress_bound(len: usize) -> usize {
    len + (len >> 12) + (len >> 14) + (len >> 25) + 13
}

/// Zlib compressor reusing one scratch buffer across blocks.
pub struct BlockCompressor {
    compress: Compress,
    scratch: Vec<u8>,
}

impl BlockCompressor {
    pub fn new(level: u32) -> Self {
        Self {
            compress: Compress::new(Compression::new(level.min(9)), true),
            scratch: Vec::new(),
        }
    }

    /// Compress one block. The returned slice is valid until the next call.
    pub fn compress(&mut self, data: &[u8]) -> Result<&[u8], StorageError> {
        let bound = compress_bound(data.len());
        self.scratch.clear();
        if self.scratch.capacity() < bound {
            self.scratch.reserve(bound);
        }
        self.compress.reset();
        loop {
            let consumed = self.compress.total_in() as usize;
            let status = self
                .compress
                .compress_vec(&data[consumed..], &mut self.scratch, FlushCompress::Finish)
                .map_err(|e| StorageError::Compression(e.to_string()))?;
            if status == Status::StreamEnd {
                return Ok(&self.scratch);
            }
            let grow = self.scratch.capacity().max(64);
            self.scratch.reserve(grow);
        }
    }
}

/// Inflate one block, checking the result against `expected` bytes when known.
pub fn decompress(data: &[u8], expected: Option<usize>) -> Result<Vec<u8>, StorageError> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::with_capacity(expected.unwrap_or(data.len() * 4));
    decoder
        .read_to_end(&mut out)
        .map_err(|e| StorageError::Decompression(e.to_string()))?;
    if let Some(expected) = expected {
        if out.len() != expected {
            return Err(StorageError::Corrupted(format!(
                "block inflated to {} bytes, header says {}",
                out.len(),
                expected
            )));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_blocks_inflate_back() {
        let mut compressor = BlockCompressor::new(6);
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 7) as u8).collect();
        let packed = compressor.compress(&data).unwrap().to_vec();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed, Some(data.len())).unwrap(), data);

        // incompressible and empty input still fit the bound
        let noise: Vec<u8> = (0..1000u32).map(|i| (i.wrapping_mul(2654435761) >> 24) as u8).collect();
        let packed = compressor.compress(&noise).unwrap().to_vec();
        assert!(packed.len() <= compress_bound(noise.len()));
        assert_eq!(decompress(&packed, None).unwrap(), noise);
        let packed = compressor.compress(&[]).unwrap().to_vec();
        assert!(decompress(&packed, Some(0)).unwrap().is_empty());
    }

    #[test]
    fn size_mismatch_and_garbage_are_errors() {
        let mut compressor = BlockCompressor::new(1);
        let packed = compressor.compress(b"abcdef").unwrap().to_vec();
        assert!(matches!(
            decompress(&packed, Some(5)),
            Err(StorageError::Corrupted(_))
        ));
        assert!(matches!(
            decompress(b"not zlib at all", None),
            Err(StorageError::Decompression(_))
        ));
    }
}
