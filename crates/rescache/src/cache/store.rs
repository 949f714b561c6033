//! # Reliable Resource Store
//!
//! Durable mapping from cache key to [`CacheEntry`], backed by a directory.
//!
//! Layout of the cache directory:
//!
//! - `<digest>-<uuid>.data` committed bytes of an entry
//! - `<digest>.meta` JSON sidecar naming the data file; its rename is the
//!   publish point of a commit
//! - `*.tmp` in-progress writes, deleted on abort and on startup
//!
//! `<digest>` is the SHA-256 of the rendered key. Committed data files get a
//! fresh name on every write, so a replacement never truncates a file an
//! existing reader has open.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::cache::entry::{CacheEntry, CacheKey};
use crate::clock::{Clock, SystemClock};
use crate::error::{CacheError, CacheResult};

const DATA_EXT: &str = "data";
const META_EXT: &str = "meta";
const TMP_SUFFIX: &str = ".tmp";

/// Sidecar persisted next to every committed data file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMetadata {
    key: String,
    data_file: String,
    mime_type: Option<String>,
    resource_name: Option<String>,
    size_bytes: i64,
    last_touched_millis: u64,
    committed_millis: u64,
    metacard_ref: Option<String>,
}

impl StoredMetadata {
    fn from_entry(entry: &CacheEntry, last_touched_millis: u64) -> Self {
        Self {
            key: entry.key.clone(),
            data_file: file_name(&entry.file_path),
            mime_type: entry.mime_type.clone(),
            resource_name: entry.resource_name.clone(),
            size_bytes: entry.size_bytes,
            last_touched_millis,
            committed_millis: entry.committed_millis,
            metacard_ref: entry.metacard_ref.clone(),
        }
    }
}

#[derive(Debug)]
struct IndexedEntry {
    entry: CacheEntry,
    meta_path: PathBuf,
    last_touched: AtomicU64,
    persisted_touch: AtomicU64,
    readers: AtomicUsize,
}

impl IndexedEntry {
    fn new(entry: CacheEntry, meta_path: PathBuf) -> Self {
        let touched = entry.last_touched_millis;
        Self {
            entry,
            meta_path,
            last_touched: AtomicU64::new(touched),
            persisted_touch: AtomicU64::new(touched),
            readers: AtomicUsize::new(0),
        }
    }

    fn snapshot(&self) -> CacheEntry {
        let mut entry = self.entry.clone();
        entry.last_touched_millis = self.last_touched.load(Ordering::Acquire);
        entry
    }

    fn touch(&self, now: u64) -> u64 {
        // fetch_max keeps the timestamp monotonic under concurrent hits
        self.last_touched.fetch_max(now, Ordering::AcqRel).max(now)
    }

    fn size(&self) -> u64 {
        self.entry.size().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct Index {
    entries: HashMap<String, Arc<IndexedEntry>>,
    total_bytes: u64,
}

impl Index {
    fn insert(&mut self, indexed: Arc<IndexedEntry>) -> Option<Arc<IndexedEntry>> {
        self.total_bytes += indexed.size();
        let previous = self.entries.insert(indexed.entry.key.clone(), indexed);
        if let Some(prev) = &previous {
            self.total_bytes = self.total_bytes.saturating_sub(prev.size());
        }
        previous
    }

    fn remove(&mut self, key: &str) -> Option<Arc<IndexedEntry>> {
        let removed = self.entries.remove(key);
        if let Some(prev) = &removed {
            self.total_bytes = self.total_bytes.saturating_sub(prev.size());
        }
        removed
    }
}

/// Outcome of a conditional removal requested by the eviction manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed(CacheEntry),
    /// An open reader holds the entry
    Pinned,
    /// Already gone
    Missing,
}

/// An in-progress write of one resource into a temp file.
///
/// Dropping an unfinished handle deletes its temp file.
#[derive(Debug)]
pub struct WriteHandle {
    key: String,
    temp_path: PathBuf,
    final_path: PathBuf,
    file: Option<fs::File>,
    mime_type: Option<String>,
    resource_name: Option<String>,
    metacard_ref: Option<String>,
    bytes_written: u64,
    finished: bool,
    #[cfg(test)]
    write_limit: u64,
}

impl WriteHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn set_metacard_ref(&mut self, metacard_ref: impl Into<String>) {
        self.metacard_ref = Some(metacard_ref.into());
    }

    /// Append a chunk to the temp file.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> CacheResult<()> {
        #[cfg(test)]
        if self.bytes_written + chunk.len() as u64 > self.write_limit {
            return Err(CacheError::store(
                format!("writing {}", self.temp_path.display()),
                std::io::Error::from(std::io::ErrorKind::StorageFull),
            ));
        }
        let file = self.file.as_mut().ok_or_else(|| {
            CacheError::Internal(format!("write to finished handle for {}", self.key))
        })?;
        file.write_all(chunk)
            .await
            .map_err(|e| CacheError::store(format!("writing {}", self.temp_path.display()), e))?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    async fn finish_file(&mut self) -> CacheResult<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        if !self.finished {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

/// Crash-consistent on-disk store of cached resources.
#[derive(Debug)]
pub struct ReliableResourceStore {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    entry_ttl_millis: Option<u64>,
    index: RwLock<Index>,
    #[cfg(test)]
    write_limit: AtomicU64,
}

/// An open cached file. While it lives the entry is pinned against eviction.
#[derive(Debug)]
pub struct CachedReader {
    pub entry: CacheEntry,
    pub file: fs::File,
    pin: ReaderPin,
}

impl CachedReader {
    pub fn into_parts(self) -> (CacheEntry, fs::File, ReaderPin) {
        (self.entry, self.file, self.pin)
    }
}

/// Keeps an entry pinned; unpins on drop.
#[derive(Debug)]
pub struct ReaderPin(Arc<IndexedEntry>);

impl Drop for ReaderPin {
    fn drop(&mut self) {
        self.0.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ReliableResourceStore {
    /// Open the store rooted at `dir`, rebuilding the index from disk.
    pub async fn open(dir: impl Into<PathBuf>) -> CacheResult<Self> {
        Self::open_with(dir, Arc::new(SystemClock), None).await
    }

    pub async fn open_with(
        dir: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
        entry_ttl_millis: Option<u64>,
    ) -> CacheResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| CacheError::store(format!("creating {}", dir.display()), e))?;

        let store = Self {
            dir,
            clock,
            entry_ttl_millis,
            index: RwLock::new(Index::default()),
            #[cfg(test)]
            write_limit: AtomicU64::new(u64::MAX),
        };
        store.rebuild_index().await?;
        Ok(store)
    }

    /// Make writes started from now on fail once a temp file would grow
    /// past `bytes`, as a full disk would.
    #[cfg(test)]
    pub(crate) fn fail_writes_beyond(&self, bytes: u64) {
        self.write_limit.store(bytes, Ordering::Relaxed);
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Scan the directory, keeping only entries with a valid sidecar and a
    /// data file of the recorded length. Everything else is garbage from an
    /// interrupted write and is deleted.
    async fn rebuild_index(&self) -> CacheResult<()> {
        let mut metas = Vec::new();
        let mut data_files = HashSet::new();
        let mut garbage = Vec::new();

        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            let name = file_name(&path);
            if name.ends_with(TMP_SUFFIX) {
                garbage.push(path);
            } else if has_extension(&path, META_EXT) {
                metas.push(path);
            } else if has_extension(&path, DATA_EXT) {
                data_files.insert(name);
            }
        }

        let mut referenced = HashSet::new();
        let mut loaded = Vec::new();
        for meta_path in metas {
            match self.load_entry(&meta_path, &data_files).await {
                Some(entry) => {
                    referenced.insert(file_name(&entry.file_path));
                    loaded.push(Arc::new(IndexedEntry::new(entry, meta_path)));
                }
                None => garbage.push(meta_path),
            }
        }
        for data in data_files.difference(&referenced) {
            garbage.push(self.dir.join(data));
        }

        for path in &garbage {
            match fs::remove_file(path).await {
                Ok(()) => debug!(path = ?path, "Removed stale cache file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = ?path, error = %e, "Failed to remove stale cache file"),
            }
        }

        let mut index = self.index.write();
        for indexed in loaded {
            index.insert(indexed);
        }
        info!(
            dir = %self.dir.display(),
            entries = index.entries.len(),
            total_bytes = index.total_bytes,
            removed = garbage.len(),
            "Cache index rebuilt"
        );
        Ok(())
    }

    async fn load_entry(&self, meta_path: &Path, data_files: &HashSet<String>) -> Option<CacheEntry> {
        let bytes = match fs::read(meta_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = ?meta_path, error = %e, "Failed to read cache metadata file");
                return None;
            }
        };
        let meta: StoredMetadata = match serde_json::from_slice(&bytes) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = ?meta_path, error = %e, "Failed to parse cache metadata");
                return None;
            }
        };

        let digest = CacheKey::digest(&meta.key);
        if file_stem(meta_path) != digest || !meta.data_file.starts_with(&digest) {
            warn!(path = ?meta_path, key = %meta.key, "Cache metadata does not match its file name");
            return None;
        }
        if meta.size_bytes < 0 || !data_files.contains(&meta.data_file) {
            return None;
        }

        let file_path = self.dir.join(&meta.data_file);
        let on_disk = fs::metadata(&file_path).await.ok()?.len();
        if on_disk != meta.size_bytes as u64 {
            warn!(
                key = %meta.key,
                expected = meta.size_bytes,
                actual = on_disk,
                "Cached file length does not match metadata"
            );
            let _ = fs::remove_file(&file_path).await;
            return None;
        }

        Some(CacheEntry {
            key: meta.key,
            file_path,
            mime_type: meta.mime_type,
            resource_name: meta.resource_name,
            size_bytes: meta.size_bytes,
            last_touched_millis: meta.last_touched_millis,
            committed_millis: meta.committed_millis,
            metacard_ref: meta.metacard_ref,
        })
    }

    fn get_indexed(&self, key: &str) -> Option<Arc<IndexedEntry>> {
        self.index.read().entries.get(key).cloned()
    }

    /// Drop `indexed` from the index if it is still the current entry for its key.
    async fn purge_stale(&self, indexed: &Arc<IndexedEntry>, reason: &str) {
        let removed = {
            let mut index = self.index.write();
            match index.entries.get(&indexed.entry.key) {
                Some(current) if Arc::ptr_eq(current, indexed) => {
                    index.remove(&indexed.entry.key)
                }
                _ => None,
            }
        };
        if let Some(removed) = removed {
            debug!(key = %removed.entry.key, reason, "Purging stale cache entry");
            delete_files(&removed).await;
        }
    }

    /// Look up a complete, unexpired entry and bump its last-touched time.
    pub async fn lookup(&self, key: &str) -> Option<CacheEntry> {
        let indexed = self.get_indexed(key)?;
        if !self.validate(&indexed).await {
            return None;
        }
        indexed.touch(self.clock.now_millis());
        Some(indexed.snapshot())
    }

    async fn validate(&self, indexed: &Arc<IndexedEntry>) -> bool {
        if !indexed.entry.is_complete() {
            return false;
        }
        if indexed
            .entry
            .is_expired(self.clock.now_millis(), self.entry_ttl_millis)
        {
            self.purge_stale(indexed, "expired").await;
            return false;
        }
        match fs::metadata(&indexed.entry.file_path).await {
            Ok(meta) if Some(meta.len()) == indexed.entry.size() => true,
            Ok(_) => {
                self.purge_stale(indexed, "length mismatch").await;
                false
            }
            Err(_) => {
                self.purge_stale(indexed, "file missing").await;
                false
            }
        }
    }

    /// Open a committed entry for reading, pinning it until the reader is dropped.
    pub async fn open_reader(&self, key: &str) -> Option<CachedReader> {
        let indexed = {
            let index = self.index.read();
            let indexed = index.entries.get(key)?.clone();
            // Pinned under the read lock so eviction cannot slip in between
            indexed.readers.fetch_add(1, Ordering::AcqRel);
            indexed
        };
        let pin = ReaderPin(indexed.clone());

        if !self.validate(&indexed).await {
            return None;
        }
        let file = match fs::File::open(&indexed.entry.file_path).await {
            Ok(file) => file,
            Err(e) => {
                warn!(key, error = %e, "Failed to open cached file");
                drop(pin);
                self.purge_stale(&indexed, "open failed").await;
                return None;
            }
        };
        indexed.touch(self.clock.now_millis());
        Some(CachedReader {
            entry: indexed.snapshot(),
            file,
            pin,
        })
    }

    /// Allocate a temp file for a new write of `key`.
    pub async fn begin_write(
        &self,
        key: &str,
        suggested_name: Option<String>,
        mime_type: Option<String>,
    ) -> CacheResult<WriteHandle> {
        let final_path = self.dir.join(format!(
            "{}-{}.{DATA_EXT}",
            CacheKey::digest(key),
            uuid::Uuid::new_v4().simple()
        ));
        let temp_path = PathBuf::from(format!("{}{TMP_SUFFIX}", final_path.display()));

        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await
            .map_err(|e| CacheError::store(format!("creating {}", temp_path.display()), e))?;

        debug!(key, path = ?temp_path, "Began cache write");
        Ok(WriteHandle {
            key: key.to_string(),
            temp_path,
            final_path,
            file: Some(file),
            mime_type,
            resource_name: suggested_name,
            metacard_ref: None,
            bytes_written: 0,
            finished: false,
            #[cfg(test)]
            write_limit: self.write_limit.load(Ordering::Relaxed),
        })
    }

    /// Promote a fully written temp file to a visible entry.
    pub async fn commit_write(
        &self,
        mut handle: WriteHandle,
        final_size: u64,
    ) -> CacheResult<CacheEntry> {
        let result = self.commit_inner(&mut handle, final_size).await;
        if result.is_err() {
            self.abort_write(&mut handle).await;
            let _ = fs::remove_file(&handle.final_path).await;
        }
        result
    }

    async fn commit_inner(
        &self,
        handle: &mut WriteHandle,
        final_size: u64,
    ) -> CacheResult<CacheEntry> {
        handle.finish_file().await?;
        if handle.bytes_written != final_size {
            return Err(CacheError::store(
                format!("committing {}", handle.key),
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "wrote {} bytes but {final_size} were declared",
                        handle.bytes_written
                    ),
                ),
            ));
        }

        fs::rename(&handle.temp_path, &handle.final_path)
            .await
            .map_err(|e| CacheError::store("renaming temp file", e))?;

        let now = self.clock.now_millis();
        let entry = CacheEntry {
            key: handle.key.clone(),
            file_path: handle.final_path.clone(),
            mime_type: handle.mime_type.clone(),
            resource_name: handle.resource_name.clone(),
            size_bytes: final_size as i64,
            last_touched_millis: now,
            committed_millis: now,
            metacard_ref: handle.metacard_ref.clone(),
        };
        let meta_path = self.meta_path(&entry.key);
        write_metadata(&meta_path, &StoredMetadata::from_entry(&entry, now)).await?;
        handle.finished = true;

        let previous = self
            .index
            .write()
            .insert(Arc::new(IndexedEntry::new(entry.clone(), meta_path)));
        if let Some(prev) = previous {
            if prev.entry.file_path != entry.file_path {
                remove_quietly(&prev.entry.file_path).await;
            }
        }

        debug!(key = %entry.key, size = final_size, "Committed cache entry");
        Ok(entry)
    }

    /// Discard an in-progress write. Safe to call more than once.
    pub async fn abort_write(&self, handle: &mut WriteHandle) {
        if handle.finished {
            return;
        }
        handle.file.take();
        handle.finished = true;
        remove_quietly(&handle.temp_path).await;
        debug!(key = %handle.key, "Aborted cache write");
    }

    /// Remove an entry and its files. Returns whether an entry existed.
    pub async fn remove(&self, key: &str) -> bool {
        let removed = self.index.write().remove(key);
        match removed {
            Some(indexed) => {
                delete_files(&indexed).await;
                true
            }
            None => false,
        }
    }

    /// Remove an entry unless an open reader pins it.
    pub async fn remove_if_unpinned(&self, key: &str) -> RemoveOutcome {
        let removed = {
            let mut index = self.index.write();
            match index.entries.get(key) {
                None => return RemoveOutcome::Missing,
                Some(e) if e.readers.load(Ordering::Acquire) > 0 => return RemoveOutcome::Pinned,
                Some(_) => index.remove(key),
            }
        };
        match removed {
            Some(indexed) => {
                delete_files(&indexed).await;
                RemoveOutcome::Removed(indexed.snapshot())
            }
            None => RemoveOutcome::Missing,
        }
    }

    /// Whether the index holds an entry for `key`, without validating it.
    pub fn contains(&self, key: &str) -> bool {
        self.index.read().entries.contains_key(key)
    }

    pub fn is_pinned(&self, key: &str) -> bool {
        self.get_indexed(key)
            .is_some_and(|e| e.readers.load(Ordering::Acquire) > 0)
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.index.read().total_bytes
    }

    pub fn entry_count(&self) -> u64 {
        self.index.read().entries.len() as u64
    }

    /// Snapshot of all entries.
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.index
            .read()
            .entries
            .values()
            .map(|e| e.snapshot())
            .collect()
    }

    /// Persist last-touched times that changed since load or commit.
    pub async fn sync_metadata(&self) -> CacheResult<usize> {
        let dirty: Vec<Arc<IndexedEntry>> = self
            .index
            .read()
            .entries
            .values()
            .filter(|e| {
                e.last_touched.load(Ordering::Acquire) != e.persisted_touch.load(Ordering::Acquire)
            })
            .cloned()
            .collect();

        let mut written = 0;
        for indexed in dirty {
            let touched = indexed.last_touched.load(Ordering::Acquire);
            let meta = StoredMetadata::from_entry(&indexed.entry, touched);
            // Skip entries removed meanwhile so their sidecar is not resurrected
            if self
                .get_indexed(&indexed.entry.key)
                .is_none_or(|current| !Arc::ptr_eq(&current, &indexed))
            {
                continue;
            }
            write_metadata(&indexed.meta_path, &meta).await?;
            indexed.persisted_touch.store(touched, Ordering::Release);
            written += 1;
        }
        debug!(written, "Synced cache metadata");
        Ok(written)
    }

    /// Remove every entry.
    pub async fn clear(&self) -> usize {
        let drained: Vec<Arc<IndexedEntry>> = {
            let mut index = self.index.write();
            index.total_bytes = 0;
            index.entries.drain().map(|(_, v)| v).collect()
        };
        for indexed in &drained {
            delete_files(indexed).await;
        }
        debug!(count = drained.len(), "Cleared cache entries");
        drained.len()
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{META_EXT}", CacheKey::digest(key)))
    }
}

async fn write_metadata(meta_path: &Path, meta: &StoredMetadata) -> CacheResult<()> {
    let json = serde_json::to_vec(meta).map_err(|e| {
        CacheError::store(
            "serializing metadata",
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        )
    })?;
    let temp = PathBuf::from(format!(
        "{}.{}{TMP_SUFFIX}",
        meta_path.display(),
        uuid::Uuid::new_v4().simple()
    ));

    let result = async {
        let mut file = fs::File::create(&temp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp, meta_path).await
    }
    .await;

    if let Err(e) = result {
        remove_quietly(&temp).await;
        return Err(CacheError::store(
            format!("writing {}", meta_path.display()),
            e,
        ));
    }
    Ok(())
}

async fn delete_files(indexed: &IndexedEntry) {
    remove_quietly(&indexed.meta_path).await;
    remove_quietly(&indexed.entry.file_path).await;
}

/// Remove a file, treating "already gone" as success and logging anything else.
async fn remove_quietly(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = ?path, error = %e, "Failed to remove cache file"),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().is_some_and(|e| e == ext)
}
