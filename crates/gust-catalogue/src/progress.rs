//! Per-file chunk progress, persisted as a bitmap sidecar file.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use gust_core::{Bitmap, ChunkRange};

/// A chunk bitmap bound to its on-disk sidecar. One bit per chunk, set
/// iff that chunk is locally present and verified. An internal mutex
/// serializes every operation, so `&self` methods are safe to call from
/// any task. Saves are atomic: the bitmap is written to a temp file and
/// renamed over the old one.
pub struct ProgressFile {
    path: PathBuf,
    bits: Mutex<Bitmap>,
}

impl ProgressFile {
    /// A progress file that does not exist on disk yet.
    pub fn new(path: PathBuf, bits: Bitmap) -> Self {
        ProgressFile {
            path,
            bits: Mutex::new(bits),
        }
    }

    /// Load a previously saved progress file.
    pub fn load(path: PathBuf) -> io::Result<Self> {
        let data = fs::read(&path)?;
        let bits = Bitmap::deserialize(&data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(ProgressFile {
            path,
            bits: Mutex::new(bits),
        })
    }

    pub fn set(&self, chunk: u64) {
        self.bits.lock().unwrap().set(chunk);
    }

    pub fn get(&self, chunk: u64) -> bool {
        self.bits.lock().unwrap().get(chunk)
    }

    pub fn full(&self) -> bool {
        self.bits.lock().unwrap().full()
    }

    pub fn size(&self) -> u64 {
        self.bits.lock().unwrap().size()
    }

    pub fn count(&self) -> u64 {
        self.bits.lock().unwrap().count()
    }

    pub fn overlap(&self, ranges: &[ChunkRange]) -> Vec<ChunkRange> {
        self.bits.lock().unwrap().overlap(ranges)
    }

    pub fn ranges(&self) -> Vec<ChunkRange> {
        self.bits.lock().unwrap().ranges()
    }

    pub fn unfilled_ranges(&self) -> Vec<ChunkRange> {
        self.bits.lock().unwrap().unfilled_ranges()
    }

    pub fn unfilled_items(&self, count: usize) -> Vec<u16> {
        self.bits.lock().unwrap().unfilled_items(count)
    }

    /// Snapshot copy of the bitmap.
    pub fn export(&self) -> Bitmap {
        self.bits.lock().unwrap().clone()
    }

    /// Write the bitmap to its sidecar path atomically. The internal
    /// mutex stays held for the whole write, so a save never interleaves
    /// with a concurrent `set`.
    pub fn save(&self) -> io::Result<()> {
        let bits = self.bits.lock().unwrap();
        let data = bits.serialize();
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, &self.path)
    }

    /// Remove the sidecar from disk.
    pub fn delete(&self) -> io::Result<()> {
        fs::remove_file(&self.path)
    }
}
