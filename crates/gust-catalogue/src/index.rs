//! The on-disk index: `index.json` in the catalogue directory.
//!
//! Maps content hash → file record, stamped with the owning process id
//! and a freshness timestamp. A process owns the index if the stored pid
//! is its own OR the stamp is more than 30 seconds stale; the owner is
//! expected to refresh the stamp on a much shorter cadence. This is an
//! advisory lock only — there is no flock underneath.
//!
//! All methods assume the caller holds the catalogue mutex.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use gust_core::Sha1Hash;

use crate::catalogue::CatalogueError;

const INDEX_FILE_NAME: &str = "index.json";

/// Seconds of staleness after which a foreign index can be claimed.
pub const TAKEOVER_SECS: i64 = 30;

/// One catalogued file. Existence of a record does not mean the bytes
/// exist locally — consult the progress sidecar for that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    /// Absolute path of the backing data file.
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub hash: Sha1Hash,
    pub chunk_size: u32,
}

impl IndexRecord {
    /// Number of chunks the file divides into (the tail may be short).
    pub fn chunk_count(&self) -> u64 {
        self.size_bytes.div_ceil(u64::from(self.chunk_size))
    }
}

#[derive(Debug)]
pub struct IndexFile {
    pid: u32,
    last_touched: i64,
    data_dir: PathBuf,
    index: HashMap<Sha1Hash, IndexRecord>,
}

impl IndexFile {
    /// Open or create `dir/index.json` and claim ownership of it.
    ///
    /// Fails with `IndexLocked` if another process's stamp is fresh.
    pub fn init(dir: &Path) -> Result<Self, CatalogueError> {
        fs::create_dir_all(dir)?;
        if !fs::metadata(dir)?.is_dir() {
            return Err(CatalogueError::Io(std::io::Error::other(format!(
                "catalogue dir '{}' is not a directory",
                dir.display()
            ))));
        }

        let path = dir.join(INDEX_FILE_NAME);
        if !path.exists() {
            let fresh = IndexFile {
                pid: std::process::id(),
                last_touched: epoch_secs(),
                data_dir: dir.to_path_buf(),
                index: HashMap::new(),
            };
            fresh.save()?;
            return Ok(fresh);
        }

        let data = fs::read(&path)?;
        let mut loaded = Self::from_json(&data)?;

        let own_pid = std::process::id();
        let age = epoch_secs() - loaded.last_touched;
        if loaded.pid != own_pid && age < TAKEOVER_SECS {
            return Err(CatalogueError::IndexLocked { pid: loaded.pid });
        }

        loaded.pid = own_pid;
        loaded.last_touched = epoch_secs();
        loaded.data_dir = dir.to_path_buf();
        loaded.save()?;
        Ok(loaded)
    }

    /// Refresh the ownership stamp. Called on a cadence well under the
    /// takeover window.
    pub fn touch(&mut self) -> Result<(), CatalogueError> {
        self.last_touched = epoch_secs();
        self.save()
    }

    /// Serialize the whole index to `index.json`.
    pub fn save(&self) -> Result<(), CatalogueError> {
        let data = serde_json::to_vec(&self.to_json())?;
        fs::write(self.data_dir.join(INDEX_FILE_NAME), data)?;
        Ok(())
    }

    /// Insert a record and persist. Refuses a hash that is already
    /// indexed, reporting the extant file's path.
    pub fn add(&mut self, record: IndexRecord) -> Result<(), CatalogueError> {
        if let Some(extant) = self.index.get(&record.hash) {
            return Err(CatalogueError::DuplicateHash {
                extant_path: extant.file_path.clone(),
            });
        }
        self.index.insert(record.hash, record);
        self.save()
    }

    /// Remove a record and persist.
    pub fn remove(&mut self, hash: &Sha1Hash) -> Result<Option<IndexRecord>, CatalogueError> {
        let removed = self.index.remove(hash);
        if removed.is_some() {
            self.save()?;
        }
        Ok(removed)
    }

    pub fn get(&self, hash: &Sha1Hash) -> Option<&IndexRecord> {
        self.index.get(hash)
    }

    pub fn records(&self) -> impl Iterator<Item = &IndexRecord> {
        self.index.values()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Path of the progress sidecar for a hash: the hex of the hash,
    /// alongside index.json.
    pub fn progress_path(&self, hash: &Sha1Hash) -> PathBuf {
        self.data_dir.join(hash.to_hex())
    }

    // JSON goes through an intermediary so hashes land as hex strings.
    fn to_json(&self) -> IndexFileJson {
        IndexFileJson {
            pid: self.pid,
            last_touched: self.last_touched,
            data_dir: self.data_dir.clone(),
            index: self
                .index
                .values()
                .map(|r| {
                    (
                        r.hash.to_hex(),
                        IndexRecordJson {
                            file_path: r.file_path.clone(),
                            size_bytes: r.size_bytes,
                            hash: r.hash.to_hex(),
                            chunk_size: r.chunk_size,
                        },
                    )
                })
                .collect(),
        }
    }

    fn from_json(data: &[u8]) -> Result<Self, CatalogueError> {
        let parsed: IndexFileJson = serde_json::from_slice(data)?;
        let mut index = HashMap::with_capacity(parsed.index.len());
        for record in parsed.index.into_values() {
            let hash = Sha1Hash::from_hex(&record.hash)
                .map_err(|e| CatalogueError::CorruptIndex(e.to_string()))?;
            index.insert(
                hash,
                IndexRecord {
                    file_path: record.file_path,
                    size_bytes: record.size_bytes,
                    hash,
                    chunk_size: record.chunk_size,
                },
            );
        }
        Ok(IndexFile {
            pid: parsed.pid,
            last_touched: parsed.last_touched,
            data_dir: parsed.data_dir,
            index,
        })
    }
}

fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before 1970")
        .as_secs() as i64
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexFileJson {
    pid: u32,
    last_touched: i64,
    data_dir: PathBuf,
    index: HashMap<String, IndexRecordJson>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexRecordJson {
    file_path: PathBuf,
    size_bytes: u64,
    hash: String,
    chunk_size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use gust_core::wire::CHUNK_SIZE;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "gust-index-test-{}-{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn record(tag: &[u8], path: &str, size: u64) -> IndexRecord {
        IndexRecord {
            file_path: PathBuf::from(path),
            size_bytes: size,
            hash: Sha1Hash::of_bytes(tag),
            chunk_size: CHUNK_SIZE,
        }
    }

    #[test]
    fn json_round_trip() {
        let dir = scratch_dir("marshal");
        let mut subject = IndexFile {
            pid: 10293,
            last_touched: 1630892423,
            data_dir: dir.clone(),
            index: HashMap::new(),
        };
        for r in [
            record(b"cat", "/path/to/file1.dat", 123_456),
            record(b"bat", "/path/to/file2.mkv", 13_243_546),
        ] {
            subject.index.insert(r.hash, r);
        }

        let data = serde_json::to_vec(&subject.to_json()).unwrap();
        let result = IndexFile::from_json(&data).unwrap();

        assert_eq!(result.pid, subject.pid);
        assert_eq!(result.last_touched, subject.last_touched);
        assert_eq!(result.data_dir, subject.data_dir);
        assert_eq!(result.index, subject.index);
    }

    #[test]
    fn init_creates_fresh_index() {
        let dir = scratch_dir("fresh");
        let index = IndexFile::init(&dir).unwrap();

        assert_eq!(index.pid, std::process::id());
        assert!(index.is_empty());
        assert!(epoch_secs() - index.last_touched < 5);
        assert!(dir.join(INDEX_FILE_NAME).exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn init_rejects_live_foreign_owner() {
        let dir = scratch_dir("locked");
        let mut index = IndexFile::init(&dir).unwrap();
        // forge another process's fresh claim
        index.pid = std::process::id() + 1;
        index.last_touched = epoch_secs();
        index.save().unwrap();

        match IndexFile::init(&dir) {
            Err(CatalogueError::IndexLocked { pid }) => {
                assert_eq!(pid, std::process::id() + 1)
            }
            other => panic!("expected IndexLocked, got {other:?}"),
        }
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn init_takes_over_stale_index() {
        let dir = scratch_dir("stale");
        let mut index = IndexFile::init(&dir).unwrap();
        index.pid = std::process::id() + 1;
        index.last_touched = epoch_secs() - TAKEOVER_SECS - 1;
        index.save().unwrap();

        let claimed = IndexFile::init(&dir).unwrap();
        assert_eq!(claimed.pid, std::process::id());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn add_rejects_duplicate_hash() {
        let dir = scratch_dir("dupe");
        let mut index = IndexFile::init(&dir).unwrap();

        index.add(record(b"same", "/first/location.bin", 10)).unwrap();
        let err = index
            .add(record(b"same", "/second/location.bin", 10))
            .unwrap_err();
        match err {
            CatalogueError::DuplicateHash { extant_path } => {
                assert_eq!(extant_path, PathBuf::from("/first/location.bin"));
            }
            other => panic!("expected DuplicateHash, got {other:?}"),
        }
        assert_eq!(index.len(), 1);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn add_and_remove_persist() {
        let dir = scratch_dir("persist");
        let mut index = IndexFile::init(&dir).unwrap();
        let rec = record(b"keeper", "/data/keeper.bin", 42);
        let hash = rec.hash;
        index.add(rec).unwrap();

        let reloaded =
            IndexFile::from_json(&fs::read(dir.join(INDEX_FILE_NAME)).unwrap()).unwrap();
        assert!(reloaded.get(&hash).is_some());

        index.remove(&hash).unwrap();
        let reloaded =
            IndexFile::from_json(&fs::read(dir.join(INDEX_FILE_NAME)).unwrap()).unwrap();
        assert!(reloaded.get(&hash).is_none());
        let _ = fs::remove_dir_all(&dir);
    }
}
