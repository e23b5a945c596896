//! Bounded reader over one chunk-sized region of a file.
//!
//! Opened by the catalogue for a single upload and dropped when that
//! upload ends. Construction streams the region once to precompute its
//! SHA-1 and byte count, then leaves the cursor at the region start so
//! the sender can read it again for transmission. One owner at a time;
//! positional reads keep the underlying file handle seek-free.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use sha1::{Digest, Sha1};

use crate::hash::Sha1Hash;

#[derive(Debug)]
pub struct ChunkReader {
    file: File,
    base: u64,
    size: u32,
    pos: u32,
    hash: Sha1Hash,
}

impl ChunkReader {
    /// Wrap the region `[offset, offset + len)` of `file`. Reads the
    /// region once to compute its hash; a region truncated by EOF hashes
    /// (and reports) only the bytes that exist.
    pub fn new(file: File, offset: u64, len: u64) -> Result<Self, ChunkReaderError> {
        if len > u64::from(u32::MAX) {
            return Err(ChunkReaderError::ChunkTooLarge(len));
        }

        let mut hasher = Sha1::new();
        let mut buf = [0u8; 64 * 1024];
        let mut hashed: u64 = 0;
        while hashed < len {
            let want = buf.len().min((len - hashed) as usize);
            let n = file.read_at(&mut buf[..want], offset + hashed)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            hashed += n as u64;
        }

        Ok(ChunkReader {
            file,
            base: offset,
            size: hashed as u32,
            pos: 0,
            hash: Sha1Hash::new(hasher.finalize().into()),
        })
    }

    /// SHA-1 of the region's bytes, computed at construction.
    pub fn hash(&self) -> Sha1Hash {
        self.hash
    }

    /// Region length in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Cursor position within the region.
    pub fn offset(&self) -> u32 {
        self.pos
    }

    /// Read the next bytes of the region into `buf`, returning the count
    /// read and the cursor position before the read. A zero count means
    /// the region is exhausted.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<(usize, u32)> {
        let offset = self.pos;
        let remaining = (self.size - self.pos) as usize;
        if remaining == 0 {
            return Ok((0, offset));
        }
        let want = buf.len().min(remaining);
        let n = self
            .file
            .read_at(&mut buf[..want], self.base + u64::from(self.pos))?;
        self.pos += n as u32;
        Ok((n, offset))
    }

    /// Move the cursor back to the region start.
    pub fn reset(&mut self) {
        self.pos = 0;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkReaderError {
    #[error("chunk of {0} bytes exceeds the 32-bit region limit")]
    ChunkTooLarge(u64),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    // Deterministic [a-z] cycle so fixture contents are reproducible.
    fn write_fixture(len: usize) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "gust-chunk-reader-{}-{}.bin",
            len,
            std::process::id()
        ));
        let data: Vec<u8> = (0..len).map(|i| b'a' + (i % 26) as u8).collect();
        let mut f = File::create(&path).unwrap();
        f.write_all(&data).unwrap();
        path
    }

    #[test]
    fn region_hash_matches_file_hash() {
        for len in [0usize, 3, 1600] {
            let path = write_fixture(len);
            let expected = Sha1Hash::of_reader(File::open(&path).unwrap()).unwrap();

            let reader = ChunkReader::new(File::open(&path).unwrap(), 0, 1 << 22).unwrap();
            assert_eq!(reader.hash(), expected, "len {len}");
            assert_eq!(reader.size(), len as u32);

            let _ = std::fs::remove_file(&path);
        }
    }

    #[test]
    fn offset_region_hashes_only_its_bytes() {
        let path = write_fixture(100);
        let reader = ChunkReader::new(File::open(&path).unwrap(), 60, 40).unwrap();
        assert_eq!(reader.size(), 40);

        let data: Vec<u8> = (60..100).map(|i| b'a' + (i % 26) as u8).collect();
        assert_eq!(reader.hash(), Sha1Hash::of_bytes(&data));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn read_reports_offset_before_read() {
        let path = write_fixture(10);
        let mut reader = ChunkReader::new(File::open(&path).unwrap(), 0, 10).unwrap();

        let mut buf = [0u8; 4];
        let (n, off) = reader.read(&mut buf).unwrap();
        assert_eq!((n, off), (4, 0));
        assert_eq!(&buf[..n], b"abcd");

        let (n, off) = reader.read(&mut buf).unwrap();
        assert_eq!((n, off), (4, 4));
        let (n, off) = reader.read(&mut buf).unwrap();
        assert_eq!((n, off), (2, 8));

        // exhausted
        let (n, off) = reader.read(&mut buf).unwrap();
        assert_eq!((n, off), (0, 10));

        reader.reset();
        let (n, off) = reader.read(&mut buf).unwrap();
        assert_eq!((n, off), (4, 0));
        assert_eq!(&buf[..n], b"abcd");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn one_byte_tail_chunk() {
        let path = write_fixture(5);
        let mut reader = ChunkReader::new(File::open(&path).unwrap(), 4, 1).unwrap();
        assert_eq!(reader.size(), 1);

        let mut buf = [0u8; 8];
        let (n, off) = reader.read(&mut buf).unwrap();
        assert_eq!((n, off), (1, 0));
        assert_eq!(buf[0], b'e');
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn oversized_region_is_rejected() {
        let path = write_fixture(1);
        let err = ChunkReader::new(File::open(&path).unwrap(), 0, u64::from(u32::MAX) + 1)
            .err()
            .unwrap();
        assert!(matches!(err, ChunkReaderError::ChunkTooLarge(_)));
        let _ = std::fs::remove_file(&path);
    }
}
