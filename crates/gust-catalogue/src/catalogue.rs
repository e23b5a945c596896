//! The catalogue — a single mutex-guarded façade over the index file and
//! the per-file progress bitmaps.
//!
//! There is exactly one catalogue per daemon. Every public operation
//! acquires the mutex for its entire duration, which is what makes
//! `save_chunk` atomic with respect to `get_chunk_reader`: a reader
//! opened after a chunk save always sees the written bytes, and never a
//! torn intermediate state. Progress bitmaps hydrate lazily from their
//! sidecar files on first touch.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use gust_core::chunk_reader::ChunkReaderError;
use gust_core::{Bitmap, ChunkRange, ChunkReader, Sha1Hash};

use crate::index::{IndexFile, IndexRecord};
use crate::progress::ProgressFile;

/// A copy of one record plus a snapshot of its progress bitmap, safe to
/// hand outside the catalogue mutex.
#[derive(Debug, Clone)]
pub struct RecordSnapshot {
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub hash: Sha1Hash,
    pub chunk_size: u32,
    pub progress: Bitmap,
}

impl RecordSnapshot {
    pub fn chunk_count(&self) -> u64 {
        self.size_bytes.div_ceil(u64::from(self.chunk_size))
    }

    pub fn chunks_downloaded(&self) -> u64 {
        self.progress.count()
    }

    /// Final path component, for wire listings.
    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

pub struct Catalogue {
    inner: Mutex<Inner>,
    downloads_dir: PathBuf,
}

struct Inner {
    index: IndexFile,
    progress: HashMap<Sha1Hash, ProgressFile>,
}

impl Catalogue {
    /// Open or create the catalogue directory and claim the index.
    /// Fatal at daemon startup if another live process owns it.
    pub fn init(catalogue_dir: &Path, downloads_dir: PathBuf) -> Result<Self, CatalogueError> {
        let index = IndexFile::init(catalogue_dir)?;
        Ok(Catalogue {
            inner: Mutex::new(Inner {
                index,
                progress: HashMap::new(),
            }),
            downloads_dir,
        })
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    /// Refresh the index ownership stamp.
    pub async fn touch(&self) -> Result<(), CatalogueError> {
        self.inner.lock().await.index.touch()
    }

    /// Index a complete local file. The progress bitmap starts filled:
    /// sharing asserts the file is already whole and will never change.
    pub async fn share_file(&self, path: &Path) -> Result<RecordSnapshot, CatalogueError> {
        let mut inner = self.inner.lock().await;

        let file_path = path.canonicalize().map_err(not_found_or_io)?;
        let file = File::open(&file_path).map_err(not_found_or_io)?;
        let size_bytes = file.metadata()?.len();
        let hash = Sha1Hash::of_reader(&file)?;

        if let Some(extant) = inner.index.get(&hash) {
            return Err(CatalogueError::DuplicateHash {
                extant_path: extant.file_path.clone(),
            });
        }

        let record = IndexRecord {
            file_path,
            size_bytes,
            hash,
            chunk_size: gust_core::wire::CHUNK_SIZE,
        };
        let mut bits = Bitmap::new(record.chunk_count());
        bits.fill();
        let progress = ProgressFile::new(inner.index.progress_path(&hash), bits);
        progress.save()?;

        inner.index.add(record.clone())?;
        inner.progress.insert(hash, progress);

        tracing::info!(
            hash = %hash,
            path = %record.file_path.display(),
            size_bytes,
            chunks = record.chunk_count(),
            "file shared"
        );
        inner.snapshot(&hash)
    }

    /// Remove a file from the catalogue: progress sidecar first, then
    /// the index entry. The backing data file is left alone.
    pub async fn unshare_file(&self, hash: &Sha1Hash) -> Result<(), CatalogueError> {
        let mut inner = self.inner.lock().await;
        if inner.index.get(hash).is_none() {
            return Err(CatalogueError::NotFound(*hash));
        }

        let sidecar = inner.index.progress_path(hash);
        match std::fs::remove_file(&sidecar) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(CatalogueError::Io(e)),
        }
        inner.progress.remove(hash);
        inner.index.remove(hash)?;

        tracing::info!(hash = %hash, "file unshared");
        Ok(())
    }

    /// Record an in-progress download discovered from a peer's listing.
    /// The target file is created empty under the downloads directory and
    /// the progress bitmap starts with no bits set.
    pub async fn register_download(
        &self,
        size_bytes: u64,
        chunk_count: u32,
        chunk_size: u32,
        hash: Sha1Hash,
        file_name: &str,
    ) -> Result<RecordSnapshot, CatalogueError> {
        let mut inner = self.inner.lock().await;

        if let Some(extant) = inner.index.get(&hash) {
            return Err(CatalogueError::DuplicateHash {
                extant_path: extant.file_path.clone(),
            });
        }

        std::fs::create_dir_all(&self.downloads_dir)?;
        let file_path = self.downloads_dir.join(file_name);
        File::create(&file_path)?;

        let record = IndexRecord {
            file_path,
            size_bytes,
            hash,
            chunk_size,
        };
        let progress = ProgressFile::new(
            inner.index.progress_path(&hash),
            Bitmap::new(u64::from(chunk_count)),
        );
        progress.save()?;

        inner.index.add(record.clone())?;
        inner.progress.insert(hash, progress);

        tracing::info!(
            hash = %hash,
            path = %record.file_path.display(),
            size_bytes,
            chunk_count,
            "download registered"
        );
        inner.snapshot(&hash)
    }

    /// Snapshots of every record, progress included.
    pub async fn list_files(&self) -> Result<Vec<RecordSnapshot>, CatalogueError> {
        let mut inner = self.inner.lock().await;
        let hashes: Vec<Sha1Hash> = inner.index.records().map(|r| r.hash).collect();
        let mut out = Vec::with_capacity(hashes.len());
        for hash in hashes {
            out.push(inner.snapshot(&hash)?);
        }
        Ok(out)
    }

    /// Re-read the backing file from disk and return its current SHA-1,
    /// which may no longer match the indexed hash.
    pub async fn rehash(&self, hash: &Sha1Hash) -> Result<Sha1Hash, CatalogueError> {
        let inner = self.inner.lock().await;
        let record = inner
            .index
            .get(hash)
            .ok_or(CatalogueError::NotFound(*hash))?;
        let file = File::open(&record.file_path).map_err(not_found_or_io)?;
        Ok(Sha1Hash::of_reader(file)?)
    }

    /// Snapshot of one record.
    pub async fn contains(&self, hash: &Sha1Hash) -> Result<RecordSnapshot, CatalogueError> {
        let mut inner = self.inner.lock().await;
        inner.snapshot(hash)
    }

    /// True iff every chunk of the file is present and verified.
    pub async fn file_complete(&self, hash: &Sha1Hash) -> Result<bool, CatalogueError> {
        let mut inner = self.inner.lock().await;
        if inner.index.get(hash).is_none() {
            return Err(CatalogueError::NotFound(*hash));
        }
        Ok(inner.progress(hash)?.full())
    }

    /// Up to `max_count` ranges of chunks not yet downloaded.
    pub async fn missing_chunks(
        &self,
        hash: &Sha1Hash,
        max_count: usize,
    ) -> Result<Vec<ChunkRange>, CatalogueError> {
        let mut inner = self.inner.lock().await;
        if inner.index.get(hash).is_none() {
            return Err(CatalogueError::NotFound(*hash));
        }
        let mut ranges = inner.progress(hash)?.unfilled_ranges();
        ranges.truncate(max_count);
        Ok(ranges)
    }

    /// Persist one verified chunk: write its bytes at the chunk's offset
    /// in the backing file, set the progress bit, save the sidecar.
    ///
    /// The file is created on demand and never pre-allocated, so chunks
    /// written out of order leave holes behind them.
    pub async fn save_chunk(
        &self,
        hash: &Sha1Hash,
        chunk: u16,
        data: &[u8],
    ) -> Result<(), CatalogueError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .index
            .get(hash)
            .ok_or(CatalogueError::NotFound(*hash))?;

        let chunk_count = record.chunk_count();
        if u64::from(chunk) >= chunk_count {
            return Err(CatalogueError::NotFound(*hash));
        }

        let offset = u64::from(chunk) * u64::from(record.chunk_size);
        let expected = (record.size_bytes - offset).min(u64::from(record.chunk_size)) as usize;
        if data.len() != expected {
            return Err(CatalogueError::ShortWrite {
                expected,
                got: data.len(),
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&record.file_path)?;
        file.write_all_at(data, offset)?;

        let progress = inner.progress(hash)?;
        progress.set(u64::from(chunk));
        progress.save()?;

        tracing::debug!(hash = %hash, chunk, bytes = data.len(), "chunk saved");
        Ok(())
    }

    /// Open a read-only reader over one locally-present chunk. Refuses
    /// chunks whose progress bit is unset.
    pub async fn get_chunk_reader(
        &self,
        hash: &Sha1Hash,
        chunk: u16,
    ) -> Result<ChunkReader, CatalogueError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .index
            .get(hash)
            .ok_or(CatalogueError::NotFound(*hash))?
            .clone();

        if !inner.progress(hash)?.get(u64::from(chunk)) {
            return Err(CatalogueError::MissingChunk {
                hash: *hash,
                chunk,
            });
        }

        let offset = u64::from(chunk) * u64::from(record.chunk_size);
        let len = (record.size_bytes - offset).min(u64::from(record.chunk_size));
        let file = File::open(&record.file_path).map_err(not_found_or_io)?;
        Ok(ChunkReader::new(file, offset, len)?)
    }
}

impl Inner {
    // Lazily hydrate the progress bitmap for a record from its sidecar.
    fn progress(&mut self, hash: &Sha1Hash) -> Result<&ProgressFile, CatalogueError> {
        if !self.progress.contains_key(hash) {
            let path = self.index.progress_path(hash);
            let loaded = ProgressFile::load(path).map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    CatalogueError::ProgressMissing(*hash)
                } else {
                    CatalogueError::Io(e)
                }
            })?;
            self.progress.insert(*hash, loaded);
        }
        Ok(&self.progress[hash])
    }

    fn snapshot(&mut self, hash: &Sha1Hash) -> Result<RecordSnapshot, CatalogueError> {
        let record = self
            .index
            .get(hash)
            .ok_or(CatalogueError::NotFound(*hash))?
            .clone();
        let progress = self.progress(hash)?.export();
        Ok(RecordSnapshot {
            file_path: record.file_path,
            size_bytes: record.size_bytes,
            hash: record.hash,
            chunk_size: record.chunk_size,
            progress,
        })
    }
}

fn not_found_or_io(e: io::Error) -> CatalogueError {
    if e.kind() == io::ErrorKind::NotFound {
        CatalogueError::FileMissing
    } else {
        CatalogueError::Io(e)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CatalogueError {
    #[error("no catalogue record for {0}")]
    NotFound(Sha1Hash),
    #[error("backing file does not exist")]
    FileMissing,
    #[error("identical file already shared: {}", extant_path.display())]
    DuplicateHash { extant_path: PathBuf },
    #[error("index owned by live process {pid}")]
    IndexLocked { pid: u32 },
    #[error("progress sidecar missing for {0}")]
    ProgressMissing(Sha1Hash),
    #[error("chunk {chunk} of {hash} is not available locally")]
    MissingChunk { hash: Sha1Hash, chunk: u16 },
    #[error("chunk write expected {expected} bytes, got {got}")]
    ShortWrite { expected: usize, got: usize },
    #[error("corrupt index: {0}")]
    CorruptIndex(String),
    #[error(transparent)]
    ChunkReader(#[from] ChunkReaderError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct Fixture {
        root: PathBuf,
        catalogue: Catalogue,
    }

    impl Fixture {
        fn new(name: &str) -> Self {
            let root = std::env::temp_dir().join(format!(
                "gust-catalogue-test-{}-{}",
                name,
                std::process::id()
            ));
            let _ = std::fs::remove_dir_all(&root);
            let catalogue =
                Catalogue::init(&root.join("catalogue"), root.join("downloads")).unwrap();
            Fixture { root, catalogue }
        }

        fn write_file(&self, name: &str, data: &[u8]) -> PathBuf {
            std::fs::create_dir_all(&self.root).unwrap();
            let path = self.root.join(name);
            let mut f = File::create(&path).unwrap();
            f.write_all(data).unwrap();
            path
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    #[tokio::test]
    async fn share_file_is_immediately_complete() {
        let fx = Fixture::new("share");
        let data = vec![0x5Au8; 10_000];
        let path = fx.write_file("a.bin", &data);

        let snapshot = fx.catalogue.share_file(&path).await.unwrap();
        assert_eq!(snapshot.size_bytes, 10_000);
        assert_eq!(snapshot.chunk_count(), 1);
        assert!(snapshot.progress.full());
        assert_eq!(snapshot.hash, Sha1Hash::of_bytes(&data));

        assert!(fx.catalogue.file_complete(&snapshot.hash).await.unwrap());
        assert_eq!(
            fx.catalogue.rehash(&snapshot.hash).await.unwrap(),
            snapshot.hash
        );
        assert_eq!(fx.catalogue.list_files().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn share_ten_mib_file_yields_three_chunks() {
        let fx = Fixture::new("tenmib");
        let data = vec![0xC3u8; 10 * 1024 * 1024];
        let path = fx.write_file("big.bin", &data);

        let snapshot = fx.catalogue.share_file(&path).await.unwrap();
        assert_eq!(snapshot.size_bytes, 10_485_760);
        // two full 4 MiB chunks and one 2 MiB tail
        assert_eq!(snapshot.chunk_count(), 3);
        assert!(snapshot.progress.full());

        let tail = fx
            .catalogue
            .get_chunk_reader(&snapshot.hash, 2)
            .await
            .unwrap();
        assert_eq!(tail.size(), 2 * 1024 * 1024);
    }

    #[tokio::test]
    async fn duplicate_share_reports_extant_path() {
        let fx = Fixture::new("dupe");
        let path = fx.write_file("original.bin", b"identical bytes");
        let copy = fx.write_file("copy.bin", b"identical bytes");

        let first = fx.catalogue.share_file(&path).await.unwrap();
        let err = fx.catalogue.share_file(&copy).await.unwrap_err();
        match err {
            CatalogueError::DuplicateHash { extant_path } => {
                assert_eq!(extant_path, first.file_path)
            }
            other => panic!("expected DuplicateHash, got {other:?}"),
        }
        // first record untouched
        assert!(fx.catalogue.file_complete(&first.hash).await.unwrap());
    }

    #[tokio::test]
    async fn share_missing_file_fails() {
        let fx = Fixture::new("missing");
        let err = fx
            .catalogue
            .share_file(Path::new("/definitely/not/here.bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogueError::FileMissing));
    }

    #[tokio::test]
    async fn register_download_starts_empty() {
        let fx = Fixture::new("register");
        let hash = Sha1Hash::of_bytes(b"remote file");

        let snapshot = fx
            .catalogue
            .register_download(100, 4, 25, hash, "incoming.bin")
            .await
            .unwrap();
        assert_eq!(snapshot.progress.size(), 4);
        assert_eq!(snapshot.progress.count(), 0);
        assert!(snapshot.file_path.ends_with("downloads/incoming.bin"));
        assert!(snapshot.file_path.exists());

        assert!(!fx.catalogue.file_complete(&hash).await.unwrap());
        assert_eq!(
            fx.catalogue.missing_chunks(&hash, 8).await.unwrap(),
            vec![ChunkRange::new(0, 3)]
        );
    }

    #[tokio::test]
    async fn save_chunk_then_read_it_back() {
        let fx = Fixture::new("savechunk");
        let content: Vec<u8> = (0..100u8).collect();
        let hash = Sha1Hash::of_bytes(&content);
        fx.catalogue
            .register_download(100, 4, 25, hash, "chunks.bin")
            .await
            .unwrap();

        // write chunk 2 first: earlier chunks stay holes
        fx.catalogue
            .save_chunk(&hash, 2, &content[50..75])
            .await
            .unwrap();
        let missing = fx.catalogue.missing_chunks(&hash, 8).await.unwrap();
        assert_eq!(
            missing,
            vec![ChunkRange::new(0, 1), ChunkRange::new(3, 3)]
        );

        let mut reader = fx.catalogue.get_chunk_reader(&hash, 2).await.unwrap();
        assert_eq!(reader.size(), 25);
        assert_eq!(reader.hash(), Sha1Hash::of_bytes(&content[50..75]));
        let mut buf = [0u8; 32];
        let (n, off) = reader.read(&mut buf).unwrap();
        assert_eq!((n, off), (25, 0));
        assert_eq!(&buf[..n], &content[50..75]);

        // the other chunks are still refused
        let err = fx.catalogue.get_chunk_reader(&hash, 0).await.unwrap_err();
        assert!(matches!(err, CatalogueError::MissingChunk { chunk: 0, .. }));
    }

    #[tokio::test]
    async fn save_all_chunks_completes_the_file() {
        let fx = Fixture::new("complete");
        let content: Vec<u8> = (0..90u8).collect();
        let hash = Sha1Hash::of_bytes(&content);
        // 90 bytes at chunk_size 25: three full chunks and a 15-byte tail
        fx.catalogue
            .register_download(90, 4, 25, hash, "whole.bin")
            .await
            .unwrap();

        for (i, chunk) in content.chunks(25).enumerate() {
            fx.catalogue
                .save_chunk(&hash, i as u16, chunk)
                .await
                .unwrap();
        }

        assert!(fx.catalogue.file_complete(&hash).await.unwrap());
        assert!(fx.catalogue.missing_chunks(&hash, 8).await.unwrap().is_empty());
        assert_eq!(fx.catalogue.rehash(&hash).await.unwrap(), hash);

        // tail chunk reports its short size
        let reader = fx.catalogue.get_chunk_reader(&hash, 3).await.unwrap();
        assert_eq!(reader.size(), 15);
    }

    #[tokio::test]
    async fn save_chunk_rejects_wrong_length() {
        let fx = Fixture::new("shortwrite");
        let hash = Sha1Hash::of_bytes(b"short");
        fx.catalogue
            .register_download(100, 4, 25, hash, "short.bin")
            .await
            .unwrap();

        let err = fx.catalogue.save_chunk(&hash, 0, &[0u8; 10]).await.unwrap_err();
        assert!(matches!(
            err,
            CatalogueError::ShortWrite {
                expected: 25,
                got: 10
            }
        ));
    }

    #[tokio::test]
    async fn unshare_removes_record_and_sidecar() {
        let fx = Fixture::new("unshare");
        let path = fx.write_file("gone.bin", b"soon gone");
        let snapshot = fx.catalogue.share_file(&path).await.unwrap();

        let sidecar = fx.root.join("catalogue").join(snapshot.hash.to_hex());
        assert!(sidecar.exists());

        fx.catalogue.unshare_file(&snapshot.hash).await.unwrap();
        assert!(!sidecar.exists());
        assert!(matches!(
            fx.catalogue.contains(&snapshot.hash).await.unwrap_err(),
            CatalogueError::NotFound(_)
        ));

        // unsharing twice is NotFound
        assert!(matches!(
            fx.catalogue.unshare_file(&snapshot.hash).await.unwrap_err(),
            CatalogueError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn progress_hydrates_lazily_from_disk() {
        let root = std::env::temp_dir().join(format!(
            "gust-catalogue-test-hydrate-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(&root).unwrap();
        let path = root.join("lazy.bin");
        std::fs::write(&path, b"hydrate me").unwrap();

        let hash = {
            let catalogue =
                Catalogue::init(&root.join("catalogue"), root.join("downloads")).unwrap();
            catalogue.share_file(&path).await.unwrap().hash
        };

        // a second catalogue over the same directory must read the
        // sidecar from disk on first touch
        let reopened =
            Catalogue::init(&root.join("catalogue"), root.join("downloads")).unwrap();
        assert!(reopened.file_complete(&hash).await.unwrap());
        let _ = std::fs::remove_dir_all(&root);
    }
}
