//! Storage manager: content-addressed regions on local disk.
//!
//! Each content item lives in `<region>/<hex hash>/` holding `data` and an
//! `info` sidecar (bincode `ContentInfo`). Stages move forward
//! `Uploading -> Downloaded -> Cached`; eviction moves `Downloaded` or `Cached`
//! content to trash and the sweep deletes it after the grace period. A
//! canonical link `<links>/<hex hash>` always resolves to the directory that
//! currently holds the content, or is absent.
//!
//! Directory moves and link swaps happen under the index lock, so stage
//! changes for one hash never interleave. Methods block on the filesystem;
//! async callers go through `spawn_blocking`.

pub mod utils;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use flock_core::{Bitfield, ContentHash, ContentInfo, Event, InfoError};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::events::EventProducer;

const DATA_FILE: &str = "data";
const INFO_FILE: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Uploading,
    Downloaded,
    Cached,
    Trashed,
}

/// Region directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    pub upload: PathBuf,
    pub download: PathBuf,
    pub cache: PathBuf,
    pub trash: PathBuf,
    pub links: PathBuf,
}

impl StoreLayout {
    /// Default layout under one data directory.
    pub fn under(root: &Path) -> Self {
        Self {
            upload: root.join("upload"),
            download: root.join("download"),
            cache: root.join("cache"),
            trash: root.join("trash"),
            links: root.join("links"),
        }
    }

    fn region(&self, stage: Stage) -> &Path {
        match stage {
            Stage::Uploading => &self.upload,
            Stage::Downloaded => &self.download,
            Stage::Cached => &self.cache,
            Stage::Trashed => &self.trash,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("content {0} not found")]
    NotFound(ContentHash),
    #[error("cannot {op} content in stage {from:?}")]
    InvalidStage { from: Stage, op: &'static str },
    #[error("bad metadata at {}: {reason}", path.display())]
    Metadata { path: PathBuf, reason: String },
    #[error("piece {index} does not fit content {hash}")]
    BadPiece { hash: ContentHash, index: u32 },
    #[error(transparent)]
    Info(#[from] InfoError),
    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn io_err<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> StoreError + 'a {
    move |source| StoreError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug)]
struct Entry {
    stage: Stage,
    info: ContentInfo,
    /// Logical access clock; larger is more recent.
    last_access: u64,
    trashed_at: Option<SystemTime>,
}

#[derive(Debug, Default)]
struct Index {
    entries: HashMap<ContentHash, Entry>,
    clock: u64,
}

impl Index {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

pub struct StoreManager {
    layout: StoreLayout,
    cache_budget: u64,
    trash_grace: Duration,
    events: EventProducer,
    index: Mutex<Index>,
}

impl StoreManager {
    /// Prepare the regions and rebuild the cache index. Upload, download and
    /// trash are recreated empty; cache is scanned and kept. Any failure here
    /// should abort startup.
    pub fn new(
        layout: StoreLayout,
        cache_budget: u64,
        trash_grace: Duration,
        events: EventProducer,
    ) -> Result<Self, StoreError> {
        utils::init_directories(
            &[&layout.upload, &layout.download, &layout.trash],
            &[&layout.cache, &layout.links],
        )
        .map_err(io_err("initialize", &layout.cache))?;
        let store = Self {
            layout,
            cache_budget,
            trash_grace,
            events,
            index: Mutex::new(Index::default()),
        };
        store.rebuild_cache_index()?;
        store.reconcile_links()?;
        Ok(store)
    }

    /// Run a store operation on the blocking pool.
    pub async fn blocking<R, F>(self: &Arc<Self>, op: F) -> Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnOnce(&StoreManager) -> Result<R, StoreError> + Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&store)).await?
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn cache_budget(&self) -> u64 {
        self.cache_budget
    }

    fn rebuild_cache_index(&self) -> Result<(), StoreError> {
        let mut found = Vec::new();
        utils::walk_directory(&self.layout.cache, 1, &mut |dir| {
            match load_info(dir) {
                Ok(info) => {
                    let mtime = fs::metadata(dir.join(DATA_FILE)).and_then(|m| m.modified())?;
                    found.push((mtime, info));
                }
                Err(e) => warn!(path = %dir.display(), error = %e, "skipping unreadable cache entry"),
            }
            Ok(())
        })
        .map_err(io_err("scan", &self.layout.cache))?;
        // Oldest first so the access clock keeps LRU order across restarts.
        found.sort_by_key(|(mtime, _)| *mtime);
        let mut index = self.index.lock();
        for (_, info) in found {
            let last_access = index.tick();
            index.entries.insert(
                info.hash(),
                Entry {
                    stage: Stage::Cached,
                    info,
                    last_access,
                    trashed_at: None,
                },
            );
        }
        info!(entries = index.entries.len(), "cache index rebuilt");
        Ok(())
    }

    /// Drop links that no longer resolve and relink every cached item.
    fn reconcile_links(&self) -> Result<(), StoreError> {
        let links = &self.layout.links;
        for entry in fs::read_dir(links).map_err(io_err("read", links))? {
            let path = entry.map_err(io_err("read", links))?.path();
            if fs::metadata(&path).is_err() {
                debug!(path = %path.display(), "removing dangling link");
                fs::remove_file(&path).map_err(io_err("remove link", &path))?;
            }
        }
        let index = self.index.lock();
        for hash in index.entries.keys() {
            let dir = self.dir_for(Stage::Cached, hash);
            let link = self.link_path(hash);
            utils::create_or_update_symlink(&dir, &link).map_err(io_err("link", &link))?;
        }
        Ok(())
    }

    fn dir_for(&self, stage: Stage, hash: &ContentHash) -> PathBuf {
        self.layout.region(stage).join(hash.to_hex())
    }

    /// Canonical link for `hash`.
    pub fn link_path(&self, hash: &ContentHash) -> PathBuf {
        self.layout.links.join(hash.to_hex())
    }

    /// Where `hash` sits in trash, if it was evicted and not yet swept.
    pub fn trash_path(&self, hash: &ContentHash) -> Option<PathBuf> {
        let index = self.index.lock();
        match index.entries.get(hash) {
            Some(e) if e.stage == Stage::Trashed => Some(self.dir_for(Stage::Trashed, hash)),
            _ => None,
        }
    }

    pub fn stage(&self, hash: &ContentHash) -> Option<Stage> {
        self.index.lock().entries.get(hash).map(|e| e.stage)
    }

    /// Physical directory currently holding `hash`.
    pub fn content_path(&self, hash: &ContentHash) -> Option<PathBuf> {
        let index = self.index.lock();
        index
            .entries
            .get(hash)
            .map(|e| self.dir_for(e.stage, hash))
    }

    /// Metadata of fully resident content that can be seeded.
    pub fn resident_info(&self, hash: &ContentHash) -> Option<ContentInfo> {
        let index = self.index.lock();
        match index.entries.get(hash) {
            Some(e) if matches!(e.stage, Stage::Downloaded | Stage::Cached) => Some(e.info.clone()),
            _ => None,
        }
    }

    /// Pieces held locally for `info`: full once resident, empty otherwise.
    /// Partially uploaded content is tracked by its swarm, not here.
    pub fn local_bitfield(&self, info: &ContentInfo) -> Bitfield {
        if self.resident_info(&info.hash()).is_some() {
            Bitfield::full(info.num_pieces())
        } else {
            Bitfield::new(info.num_pieces())
        }
    }

    /// Total size of cached content.
    pub fn cache_usage(&self) -> u64 {
        let index = self.index.lock();
        index
            .entries
            .values()
            .filter(|e| e.stage == Stage::Cached)
            .map(|e| e.info.length())
            .sum()
    }

    /// Create the working area for `info` in the upload region. Calling again
    /// before completion returns the same area. Trashed leftovers of the same
    /// hash are purged first.
    pub fn begin_upload(&self, info: &ContentInfo) -> Result<PathBuf, StoreError> {
        let hash = info.hash();
        let mut index = self.index.lock();
        match index.entries.get(&hash).map(|e| e.stage) {
            Some(Stage::Uploading) => return Ok(self.dir_for(Stage::Uploading, &hash)),
            Some(stage @ (Stage::Downloaded | Stage::Cached)) => {
                return Err(StoreError::InvalidStage {
                    from: stage,
                    op: "begin upload",
                })
            }
            Some(Stage::Trashed) => {
                let old = self.dir_for(Stage::Trashed, &hash);
                fs::remove_dir_all(&old).map_err(io_err("purge", &old))?;
                index.entries.remove(&hash);
            }
            None => {}
        }
        let dir = self.dir_for(Stage::Uploading, &hash);
        if let Err(e) = create_content_dir(&dir, info) {
            let _ = fs::remove_dir_all(&dir);
            return Err(e);
        }
        let last_access = index.tick();
        index.entries.insert(
            hash,
            Entry {
                stage: Stage::Uploading,
                info: info.clone(),
                last_access,
                trashed_at: None,
            },
        );
        debug!(%hash, "upload started");
        Ok(dir)
    }

    /// Drop an unfinished upload and its working area. Unknown hashes are
    /// ignored.
    pub fn abort_upload(&self, hash: &ContentHash) -> Result<(), StoreError> {
        let mut index = self.index.lock();
        match index.entries.get(hash).map(|e| e.stage) {
            None => return Ok(()),
            Some(Stage::Uploading) => {}
            Some(from) => return Err(StoreError::InvalidStage { from, op: "abort upload" }),
        }
        let dir = self.dir_for(Stage::Uploading, hash);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err("remove", &dir)(e)),
        }
        index.entries.remove(hash);
        debug!(%hash, "upload aborted");
        Ok(())
    }

    /// Write one verified piece into the upload area.
    pub fn write_piece(&self, hash: &ContentHash, index: u32, bytes: &[u8]) -> Result<(), StoreError> {
        let (info, stage) = self.lookup(hash)?;
        if stage != Stage::Uploading {
            return Err(StoreError::InvalidStage {
                from: stage,
                op: "write piece",
            });
        }
        let (start, end) = info
            .piece_range(index)
            .ok_or(StoreError::BadPiece { hash: *hash, index })?;
        if (end - start) as usize != bytes.len() {
            return Err(StoreError::BadPiece { hash: *hash, index });
        }
        let path = self.dir_for(Stage::Uploading, hash).join(DATA_FILE);
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(io_err("open", &path))?;
        file.write_all_at(bytes, start).map_err(io_err("write", &path))?;
        Ok(())
    }

    /// Read one piece from wherever the content lives (not trash). The file is
    /// opened under the index lock; the open handle survives a later move.
    pub fn read_piece(&self, hash: &ContentHash, index: u32) -> Result<Vec<u8>, StoreError> {
        let (file, path, start, len) = {
            let mut guard = self.index.lock();
            let now = guard.tick();
            let entry = guard.entries.get_mut(hash).ok_or(StoreError::NotFound(*hash))?;
            if entry.stage == Stage::Trashed {
                return Err(StoreError::InvalidStage {
                    from: Stage::Trashed,
                    op: "read piece",
                });
            }
            let (start, end) = entry
                .info
                .piece_range(index)
                .ok_or(StoreError::BadPiece { hash: *hash, index })?;
            if entry.stage == Stage::Cached {
                entry.last_access = now;
            }
            let path = self.dir_for(entry.stage, hash).join(DATA_FILE);
            let file = File::open(&path).map_err(io_err("open", &path))?;
            (file, path, start, end - start)
        };
        let mut buf = vec![0u8; len as usize];
        file.read_exact_at(&mut buf, start).map_err(io_err("read", &path))?;
        Ok(buf)
    }

    /// Move finished content from upload to download and point the canonical
    /// link at it. On failure the content is moved back and the error returned.
    pub fn complete_upload(&self, hash: &ContentHash) -> Result<PathBuf, StoreError> {
        let mut index = self.index.lock();
        let entry = index.entries.get_mut(hash).ok_or(StoreError::NotFound(*hash))?;
        if entry.stage != Stage::Uploading {
            return Err(StoreError::InvalidStage {
                from: entry.stage,
                op: "complete upload",
            });
        }
        let dest = self.relocate(hash, Stage::Uploading, Stage::Downloaded)?;
        entry.stage = Stage::Downloaded;
        info!(%hash, "upload complete");
        Ok(dest)
    }

    /// Move downloaded content into the durable cache. Already cached content
    /// is a no-op.
    pub fn promote(&self, hash: &ContentHash) -> Result<PathBuf, StoreError> {
        let mut index = self.index.lock();
        let now = index.tick();
        let entry = index.entries.get_mut(hash).ok_or(StoreError::NotFound(*hash))?;
        match entry.stage {
            Stage::Cached => return Ok(self.dir_for(Stage::Cached, hash)),
            Stage::Downloaded => {}
            from => return Err(StoreError::InvalidStage { from, op: "promote" }),
        }
        let dest = self.relocate(hash, Stage::Downloaded, Stage::Cached)?;
        entry.stage = Stage::Cached;
        entry.last_access = now;
        info!(%hash, "promoted to cache");
        Ok(dest)
    }

    /// Rename `hash` from one region to another and repoint its link. The
    /// moved directory is checked before the link is touched, and the link is
    /// swapped in one rename, so readers following it see either the old or
    /// the new directory. On failure the content goes back to `from` and the
    /// link is restored to its previous target.
    fn relocate(&self, hash: &ContentHash, from: Stage, to: Stage) -> Result<PathBuf, StoreError> {
        let src = self.dir_for(from, hash);
        let dest = self.dir_for(to, hash);
        let link = self.link_path(hash);
        let previous = fs::read_link(&link).ok();
        fs::rename(&src, &dest).map_err(io_err("move", &src))?;
        let moved = fs::metadata(&dest).and_then(|meta| {
            if meta.is_dir() {
                Ok(())
            } else {
                Err(io::Error::new(io::ErrorKind::Other, "moved content is not a directory"))
            }
        });
        let result = match moved {
            Ok(()) => {
                utils::create_or_update_symlink(&dest, &link).map_err(|source| StoreError::Io {
                    op: "link",
                    path: link.clone(),
                    source,
                })
            }
            Err(source) => Err(StoreError::Io {
                op: "move",
                path: dest.clone(),
                source,
            }),
        };
        if let Err(e) = result {
            self.undo_relocate(hash, &src, &dest, &link, previous.as_deref());
            return Err(e);
        }
        Ok(dest)
    }

    fn undo_relocate(
        &self,
        hash: &ContentHash,
        src: &Path,
        dest: &Path,
        link: &Path,
        previous: Option<&Path>,
    ) {
        if let Err(e) = fs::rename(dest, src) {
            warn!(%hash, error = %e, "rollback of content move failed");
        }
        let current = fs::read_link(link).ok();
        if current.as_deref() == previous {
            return;
        }
        let restored = match previous {
            Some(target) => utils::create_or_update_symlink(target, link),
            None => fs::remove_file(link),
        };
        if let Err(e) = restored {
            warn!(%hash, error = %e, "rollback of link failed");
        }
    }

    /// Move downloaded or cached content to trash and drop its link.
    /// Returns the number of bytes released.
    pub fn evict(&self, hash: &ContentHash) -> Result<u64, StoreError> {
        let mut index = self.index.lock();
        self.evict_locked(&mut index, hash)
    }

    fn evict_locked(&self, index: &mut Index, hash: &ContentHash) -> Result<u64, StoreError> {
        let entry = index.entries.get_mut(hash).ok_or(StoreError::NotFound(*hash))?;
        let from = entry.stage;
        if !matches!(from, Stage::Downloaded | Stage::Cached) {
            return Err(StoreError::InvalidStage { from, op: "evict" });
        }
        let src = self.dir_for(from, hash);
        let dest = self.dir_for(Stage::Trashed, hash);
        if dest.exists() {
            fs::remove_dir_all(&dest).map_err(io_err("purge", &dest))?;
        }
        // Link first: a reader never follows it into a directory that is gone.
        let link = self.link_path(hash);
        match fs::remove_file(&link) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err("remove link", &link)(e)),
        }
        if let Err(e) = fs::rename(&src, &dest) {
            if let Err(relink) = utils::create_or_update_symlink(&src, &link) {
                warn!(%hash, error = %relink, "restoring link after failed eviction failed");
            }
            return Err(io_err("move", &src)(e));
        }
        entry.stage = Stage::Trashed;
        entry.trashed_at = Some(SystemTime::now());
        let bytes = entry.info.length();
        info!(%hash, bytes, "evicted to trash");
        self.events.emit(Event::EvictionPerformed { hash: *hash, bytes });
        Ok(bytes)
    }

    /// Evict least recently used cached content until usage fits the budget.
    pub fn run_eviction_cycle(&self) -> Result<Vec<ContentHash>, StoreError> {
        let mut index = self.index.lock();
        let mut cached: Vec<(u64, ContentHash, u64)> = index
            .entries
            .iter()
            .filter(|(_, e)| e.stage == Stage::Cached)
            .map(|(h, e)| (e.last_access, *h, e.info.length()))
            .collect();
        let mut usage: u64 = cached.iter().map(|(_, _, len)| len).sum();
        if usage <= self.cache_budget {
            return Ok(Vec::new());
        }
        cached.sort();
        let mut evicted = Vec::new();
        for (_, hash, len) in cached {
            if usage <= self.cache_budget {
                break;
            }
            self.evict_locked(&mut index, &hash)?;
            usage -= len;
            evicted.push(hash);
        }
        Ok(evicted)
    }

    /// Permanently delete trash older than the grace period at `now`.
    /// Directories in trash the index does not know about are deleted once
    /// their mtime is past the grace period.
    pub fn sweep_trash(&self, now: SystemTime) -> Result<Vec<ContentHash>, StoreError> {
        let mut swept = Vec::new();
        let trash = self.layout.trash.clone();
        utils::walk_directory(&trash, 1, &mut |dir| {
            let known = dir
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<ContentHash>().ok());
            let mut index = self.index.lock();
            let trashed_at = match known.and_then(|h| index.entries.get(&h).map(|e| (h, e))) {
                Some((_, e)) if e.stage != Stage::Trashed => return Ok(()),
                Some((_, e)) => e.trashed_at,
                None => Some(fs::metadata(dir)?.modified()?),
            };
            let expired = trashed_at
                .map(|at| now.duration_since(at).map_or(false, |age| age >= self.trash_grace))
                .unwrap_or(true);
            if !expired {
                return Ok(());
            }
            fs::remove_dir_all(dir)?;
            if let Some(hash) = known {
                if index.entries.remove(&hash).is_some() {
                    swept.push(hash);
                }
            }
            Ok(())
        })
        .map_err(io_err("sweep", &trash))?;
        for hash in &swept {
            debug!(%hash, "trash swept");
            self.events.emit(Event::TrashSwept { hash: *hash });
        }
        Ok(swept)
    }

    /// Store a local blob as cached content. Already resident content is left
    /// as is.
    pub fn import(&self, data: &[u8], piece_length: u64) -> Result<ContentInfo, StoreError> {
        let info = ContentInfo::from_blob(data, piece_length)?;
        let hash = info.hash();
        if self.resident_info(&hash).is_some() {
            self.promote(&hash)?;
            return Ok(info);
        }
        self.begin_upload(&info)?;
        for index in 0..info.num_pieces() {
            if let Some((start, end)) = info.piece_range(index) {
                self.write_piece(&hash, index, &data[start as usize..end as usize])?;
            }
        }
        self.complete_upload(&hash)?;
        self.promote(&hash)?;
        Ok(info)
    }

    fn lookup(&self, hash: &ContentHash) -> Result<(ContentInfo, Stage), StoreError> {
        let index = self.index.lock();
        let entry = index.entries.get(hash).ok_or(StoreError::NotFound(*hash))?;
        Ok((entry.info.clone(), entry.stage))
    }
}

fn create_content_dir(dir: &Path, info: &ContentInfo) -> Result<(), StoreError> {
    fs::create_dir_all(dir).map_err(io_err("create", dir))?;
    let data = dir.join(DATA_FILE);
    let file = File::create(&data).map_err(io_err("create", &data))?;
    file.set_len(info.length()).map_err(io_err("allocate", &data))?;
    let meta = dir.join(INFO_FILE);
    let encoded = bincode::serialize(info).map_err(|e| StoreError::Metadata {
        path: meta.clone(),
        reason: e.to_string(),
    })?;
    fs::write(&meta, encoded).map_err(io_err("write", &meta))?;
    Ok(())
}

/// Read and check the sidecar of a content directory.
fn load_info(dir: &Path) -> Result<ContentInfo, StoreError> {
    let meta = dir.join(INFO_FILE);
    let bytes = fs::read(&meta).map_err(io_err("read", &meta))?;
    let info: ContentInfo = bincode::deserialize(&bytes).map_err(|e| StoreError::Metadata {
        path: meta.clone(),
        reason: e.to_string(),
    })?;
    let name = dir.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if name != info.hash().to_hex() {
        return Err(StoreError::Metadata {
            path: meta,
            reason: format!("directory name does not match hash {}", info.hash()),
        });
    }
    let data = dir.join(DATA_FILE);
    let len = fs::metadata(&data).map_err(io_err("stat", &data))?.len();
    if len != info.length() {
        return Err(StoreError::Metadata {
            path: data,
            reason: format!("data is {len} bytes, expected {}", info.length()),
        });
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(root: &Path, budget: u64) -> StoreManager {
        StoreManager::new(
            StoreLayout::under(root),
            budget,
            Duration::from_secs(60),
            EventProducer::noop(),
        )
        .unwrap()
    }

    fn blob(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn content_moves_upload_download_cache_with_link_following() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), 1 << 20);
        let data = blob(1, 40);
        let info = ContentInfo::from_blob(&data, 16).unwrap();
        let hash = info.hash();

        let area = store.begin_upload(&info).unwrap();
        assert_eq!(store.begin_upload(&info).unwrap(), area);
        assert_eq!(store.stage(&hash), Some(Stage::Uploading));
        for i in [2u32, 0, 1] {
            let (s, e) = info.piece_range(i).unwrap();
            store.write_piece(&hash, i, &data[s as usize..e as usize]).unwrap();
        }
        assert!(fs::symlink_metadata(store.link_path(&hash)).is_err());

        store.complete_upload(&hash).unwrap();
        assert_eq!(store.stage(&hash), Some(Stage::Downloaded));
        let link = store.link_path(&hash);
        assert_eq!(fs::read(link.join(DATA_FILE)).unwrap(), data);
        assert!(store.layout().upload.join(hash.to_hex()).symlink_metadata().is_err());

        store.promote(&hash).unwrap();
        assert_eq!(store.stage(&hash), Some(Stage::Cached));
        assert_eq!(fs::read_link(&link).unwrap(), store.layout().cache.join(hash.to_hex()));
        assert_eq!(fs::read(link.join(DATA_FILE)).unwrap(), data);
        assert_eq!(store.read_piece(&hash, 2).unwrap(), &data[32..]);
        assert_eq!(store.cache_usage(), 40);
        assert!(matches!(
            store.begin_upload(&info),
            Err(StoreError::InvalidStage { from: Stage::Cached, .. })
        ));
    }

    #[test]
    fn wrong_sized_piece_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), 1 << 20);
        let info = ContentInfo::from_blob(&blob(0, 40), 16).unwrap();
        store.begin_upload(&info).unwrap();
        assert!(matches!(
            store.write_piece(&info.hash(), 2, &[0; 16]),
            Err(StoreError::BadPiece { index: 2, .. })
        ));
        assert!(matches!(
            store.write_piece(&info.hash(), 3, &[0; 8]),
            Err(StoreError::BadPiece { index: 3, .. })
        ));
    }

    #[test]
    fn reads_during_promotion_never_miss_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open(dir.path(), 1 << 30));
        let mut contents = Vec::new();
        for seed in 0..32u8 {
            let data = blob(seed, 48);
            let info = ContentInfo::from_blob(&data, 16).unwrap();
            store.begin_upload(&info).unwrap();
            for i in 0..info.num_pieces() {
                let (s, e) = info.piece_range(i).unwrap();
                store.write_piece(&info.hash(), i, &data[s as usize..e as usize]).unwrap();
            }
            store.complete_upload(&info.hash()).unwrap();
            contents.push((info.hash(), data));
        }

        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let reader = {
            let store = store.clone();
            let done = done.clone();
            let contents = contents.clone();
            std::thread::spawn(move || {
                let mut reads = 0u32;
                while !done.load(std::sync::atomic::Ordering::Acquire) || reads == 0 {
                    for (hash, data) in &contents {
                        let piece = store.read_piece(hash, 1).expect("read during promote");
                        assert_eq!(piece, &data[16..32]);
                        reads += 1;
                    }
                }
                reads
            })
        };
        for (hash, _) in &contents {
            store.promote(hash).unwrap();
        }
        done.store(true, std::sync::atomic::Ordering::Release);
        assert!(reader.join().unwrap() > 0);
        for (hash, _) in &contents {
            assert_eq!(store.stage(hash), Some(Stage::Cached));
        }
    }

    #[test]
    fn failed_link_swap_leaves_content_where_it_was() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), 1 << 20);
        let data = blob(6, 20);
        let info = ContentInfo::from_blob(&data, 8).unwrap();
        let hash = info.hash();
        store.begin_upload(&info).unwrap();
        for i in 0..info.num_pieces() {
            let (s, e) = info.piece_range(i).unwrap();
            store.write_piece(&hash, i, &data[s as usize..e as usize]).unwrap();
        }
        // A regular file squatting on the link path cannot be swapped.
        fs::write(store.link_path(&hash), b"squatter").unwrap();

        assert!(matches!(
            store.complete_upload(&hash),
            Err(StoreError::Io { op: "link", .. })
        ));
        assert_eq!(store.stage(&hash), Some(Stage::Uploading));
        let upload = store.layout().upload.join(hash.to_hex());
        assert_eq!(fs::read(upload.join(DATA_FILE)).unwrap(), data);
        assert!(!store.layout().download.join(hash.to_hex()).exists());
        assert_eq!(fs::read(store.link_path(&hash)).unwrap(), b"squatter");

        fs::remove_file(store.link_path(&hash)).unwrap();
        store.complete_upload(&hash).unwrap();
        assert_eq!(fs::read(store.link_path(&hash).join(DATA_FILE)).unwrap(), data);
    }

    #[test]
    fn stage_order_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), 1 << 20);
        let info = ContentInfo::from_blob(&blob(0, 10), 4).unwrap();
        let hash = info.hash();
        assert!(matches!(store.promote(&hash), Err(StoreError::NotFound(_))));
        store.begin_upload(&info).unwrap();
        assert!(matches!(
            store.promote(&hash),
            Err(StoreError::InvalidStage { from: Stage::Uploading, .. })
        ));
        assert!(matches!(
            store.evict(&hash),
            Err(StoreError::InvalidStage { from: Stage::Uploading, .. })
        ));
        store.abort_upload(&hash).unwrap();
        assert_eq!(store.stage(&hash), None);
        assert!(utils::is_empty_dir(&store.layout().upload).unwrap());
        store.abort_upload(&hash).unwrap();
    }

    #[test]
    fn restart_keeps_cache_and_wipes_transient_regions() {
        let dir = tempfile::tempdir().unwrap();
        let (cached, partial) = {
            let store = open(dir.path(), 1 << 20);
            let cached = store.import(&blob(7, 100), 32).unwrap();
            let evicted = store.import(&blob(9, 50), 32).unwrap();
            store.evict(&evicted.hash()).unwrap();
            let partial = ContentInfo::from_blob(&blob(3, 20), 8).unwrap();
            store.begin_upload(&partial).unwrap();
            (cached, partial)
        };
        // A stray link pointing into a wiped region.
        let stray = dir.path().join("links").join("stray");
        std::os::unix::fs::symlink(dir.path().join("download").join("gone"), &stray).unwrap();

        let store = open(dir.path(), 1 << 20);
        assert_eq!(store.stage(&cached.hash()), Some(Stage::Cached));
        assert_eq!(store.resident_info(&cached.hash()), Some(cached.clone()));
        assert_eq!(store.stage(&partial.hash()), None);
        assert!(utils::is_empty_dir(&store.layout().upload).unwrap());
        assert!(utils::is_empty_dir(&store.layout().trash).unwrap());
        assert!(fs::symlink_metadata(&stray).is_err());
        assert_eq!(
            fs::read(store.link_path(&cached.hash()).join(DATA_FILE)).unwrap(),
            blob(7, 100)
        );
    }

    #[test]
    fn eviction_cycle_brings_usage_under_budget_lru_first() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut rx) = EventProducer::channel();
        let store = StoreManager::new(
            StoreLayout::under(dir.path()),
            250,
            Duration::from_secs(60),
            events,
        )
        .unwrap();
        let a = store.import(&blob(1, 100), 64).unwrap();
        let b = store.import(&blob(2, 100), 64).unwrap();
        let c = store.import(&blob(3, 100), 64).unwrap();
        // Touch a so b becomes least recently used.
        store.read_piece(&a.hash(), 0).unwrap();
        assert_eq!(store.cache_usage(), 300);

        let evicted = store.run_eviction_cycle().unwrap();
        assert_eq!(evicted, vec![b.hash()]);
        assert!(store.cache_usage() <= 250);
        assert_eq!(store.stage(&b.hash()), Some(Stage::Trashed));
        assert_eq!(store.stage(&c.hash()), Some(Stage::Cached));
        assert!(fs::symlink_metadata(store.link_path(&b.hash())).is_err());
        assert_eq!(
            rx.try_recv().unwrap(),
            Event::EvictionPerformed {
                hash: b.hash(),
                bytes: 100
            }
        );
        assert!(store.run_eviction_cycle().unwrap().is_empty());
    }

    #[test]
    fn trash_is_retrievable_until_grace_passes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), 1 << 20);
        let data = blob(5, 64);
        let info = store.import(&data, 32).unwrap();
        let hash = info.hash();
        store.evict(&hash).unwrap();

        let trashed = store.trash_path(&hash).unwrap();
        assert_eq!(fs::read(trashed.join(DATA_FILE)).unwrap(), data);
        assert!(store.sweep_trash(SystemTime::now()).unwrap().is_empty());
        assert!(trashed.exists());

        let later = SystemTime::now() + Duration::from_secs(61);
        assert_eq!(store.sweep_trash(later).unwrap(), vec![hash]);
        assert!(!trashed.exists());
        assert_eq!(store.stage(&hash), None);
    }

    #[test]
    fn re_upload_after_eviction_purges_trash() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path(), 1 << 20);
        let data = blob(4, 30);
        let info = store.import(&data, 16).unwrap();
        store.evict(&info.hash()).unwrap();
        let again = store.import(&data, 16).unwrap();
        assert_eq!(again, info);
        assert_eq!(store.stage(&info.hash()), Some(Stage::Cached));
        assert!(store.trash_path(&info.hash()).is_none());
        assert!(!store.layout().trash.join(info.hash().to_hex()).exists());
    }
}
