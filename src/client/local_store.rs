use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::client::block_set::{block_count, BlockSet};
use crate::client::error::StoreError;
use crate::client::file_state::{FileState, SIDECAR_EXTENSION};

/// Every file this client shares or downloads, keyed by tracker file id.
///
/// Each entry has its own lock: marking blocks of one file never waits on another
/// file, and two marks on the same file reach the side-car in order.
pub struct LocalFileStore {
    blocks_dir: PathBuf,
    downloads_dir: PathBuf,
    files: RwLock<BTreeMap<u32, Arc<Mutex<FileState>>>>,
}

impl LocalFileStore {
    /// Creates the directories if needed and recovers every readable side-car.
    /// Side-cars that cannot be parsed are skipped, not fatal.
    pub fn open(blocks_dir: &Path, downloads_dir: &Path) -> Result<LocalFileStore, StoreError> {
        let blocks_dir = ensure_dir(blocks_dir)?;
        let downloads_dir = ensure_dir(downloads_dir)?;

        let mut files = BTreeMap::new();
        let entries = fs::read_dir(&blocks_dir).map_err(|source| StoreError::Read {
            path: blocks_dir.clone(),
            source,
        })?;
        for entry in entries {
            let path = match entry {
                Ok(e) => e.path(),
                Err(e) => {
                    log::warn!("could not list entry of {}: {e}", blocks_dir.display());
                    continue;
                }
            };
            let file_id = match FileState::parse_file_id(&path) {
                Some(id) => id,
                None => {
                    if path.extension().is_some_and(|e| e == SIDECAR_EXTENSION) {
                        log::warn!("skipping block state with unparsable name {}", path.display());
                    }
                    continue;
                }
            };
            match FileState::load(&blocks_dir, file_id) {
                Ok(state) => {
                    log::debug!("recovered {state}");
                    files.insert(file_id, Arc::new(Mutex::new(state)));
                }
                Err(e) => log::warn!("skipping block state of file {file_id}: {e}"),
            }
        }
        log::info!(
            "local store opened: {} files tracked in {}",
            files.len(),
            blocks_dir.display()
        );

        Ok(LocalFileStore {
            blocks_dir,
            downloads_dir,
            files: RwLock::new(files),
        })
    }

    pub fn blocks_dir(&self) -> &Path {
        &self.blocks_dir
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    pub fn contains(&self, file_id: u32) -> bool {
        self.files
            .read()
            .expect("another user panicked while holding the lock")
            .contains_key(&file_id)
    }

    /// Snapshot of one file's state.
    pub fn get(&self, file_id: u32) -> Option<FileState> {
        let entry = self.entry(file_id)?;
        let state = entry
            .lock()
            .expect("another user panicked while holding the lock")
            .clone();
        Some(state)
    }

    /// Runs `f` on one file's state under its lock, without cloning it.
    pub fn with_state<R>(&self, file_id: u32, f: impl FnOnce(&FileState) -> R) -> Option<R> {
        let entry = self.entry(file_id)?;
        let state = entry
            .lock()
            .expect("another user panicked while holding the lock");
        Some(f(&state))
    }

    /// Snapshot of every tracked file, ascending by id.
    pub fn stats(&self) -> Vec<FileState> {
        let entries: Vec<_> = self
            .files
            .read()
            .expect("another user panicked while holding the lock")
            .values()
            .cloned()
            .collect();
        entries
            .iter()
            .map(|e| {
                e.lock()
                    .expect("another user panicked while holding the lock")
                    .clone()
            })
            .collect()
    }

    /// Up to `limit` missing blocks as `(file_id, block_idx)`, ascending, leaving out
    /// those `skip` accepts. Complete files cost one check each; nothing is cloned.
    pub fn next_missing(
        &self,
        limit: usize,
        mut skip: impl FnMut(u32, u32) -> bool,
    ) -> Vec<(u32, u32)> {
        let mut picked = Vec::new();
        if limit == 0 {
            return picked;
        }
        let files = self
            .files
            .read()
            .expect("another user panicked while holding the lock");
        for (file_id, entry) in files.iter() {
            let state = entry
                .lock()
                .expect("another user panicked while holding the lock");
            if state.blocks().is_complete() {
                continue;
            }
            for block_idx in state.blocks().missing() {
                if skip(*file_id, block_idx) {
                    continue;
                }
                picked.push((*file_id, block_idx));
                if picked.len() == limit {
                    return picked;
                }
            }
        }
        picked
    }

    /// Ids of the files with at least one block to serve, ascending.
    pub fn shareable_ids(&self) -> Vec<u32> {
        let files = self
            .files
            .read()
            .expect("another user panicked while holding the lock");
        files
            .iter()
            .filter(|(_, entry)| {
                !entry
                    .lock()
                    .expect("another user panicked while holding the lock")
                    .blocks()
                    .is_empty()
            })
            .map(|(file_id, _)| *file_id)
            .collect()
    }

    /// Tracks an already complete local file (the upload path): every block is owned.
    pub fn add_as_existing(&self, file_id: u32, path: &Path) -> Result<FileState, StoreError> {
        let path = fs::canonicalize(path).map_err(|source| StoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let size = fs::metadata(&path)
            .map_err(|source| StoreError::Read {
                path: path.clone(),
                source,
            })?
            .len();
        let total = block_count(size).ok_or(StoreError::TooLarge { size })?;
        let state = FileState::new(file_id, BlockSet::full(total), path);
        self.add_and_dump(state)
    }

    /// Preallocates a file of `size` bytes in the downloads dir and tracks it with no
    /// block owned (the download-queue path). Only the last component of `name` is
    /// used. When `name` is taken, on disk or by another tracked file, the file is
    /// stored as `<file_id>-<name>` instead. Queuing an id that is already tracked
    /// returns its current state untouched.
    pub fn add_empty(&self, file_id: u32, size: u64, name: &str) -> Result<FileState, StoreError> {
        let file_name = match Path::new(name).file_name() {
            Some(n) => n.to_owned(),
            None => return Err(StoreError::UnsupportedPath(PathBuf::from(name))),
        };
        let total = block_count(size).ok_or(StoreError::TooLarge { size })?;

        // held until the new entry is in: two queued downloads cannot pick the same path
        let mut files = self
            .files
            .write()
            .expect("another user panicked while holding the lock");
        if let Some(entry) = files.get(&file_id) {
            return Ok(entry
                .lock()
                .expect("another user panicked while holding the lock")
                .clone());
        }
        let taken: HashSet<PathBuf> = files
            .values()
            .map(|e| {
                e.lock()
                    .expect("another user panicked while holding the lock")
                    .path()
                    .to_path_buf()
            })
            .collect();

        let preferred = self.downloads_dir.join(&file_name);
        let path = if !taken.contains(&preferred) && !preferred.exists() {
            preferred
        } else {
            let mut unique = OsString::from(format!("{file_id}-"));
            unique.push(&file_name);
            let fallback = self.downloads_dir.join(unique);
            // an untracked fallback on disk can only be a leftover of this id: reuse it
            if taken.contains(&fallback) {
                return Err(StoreError::PathInUse(fallback));
            }
            log::info!(
                "{} is taken, storing file {file_id} as {}",
                preferred.display(),
                fallback.display()
            );
            fallback
        };

        let write_err = |source| StoreError::Write {
            path: path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(write_err)?;
        file.set_len(size).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;

        let state = FileState::new(file_id, BlockSet::empty(total), path);
        state.dump(&self.blocks_dir)?;
        log::info!("tracking {state}");
        files.insert(file_id, Arc::new(Mutex::new(state.clone())));
        Ok(state)
    }

    /// Marks a block as owned and persists it. Unknown ids are ignored.
    pub fn mark_as_ready(&self, file_id: u32, block_idx: u32) -> Result<bool, StoreError> {
        let entry = match self.entry(file_id) {
            Some(e) => e,
            None => return Ok(false),
        };
        let mut state = entry
            .lock()
            .expect("another user panicked while holding the lock");
        let added = state.mark_owned(block_idx, &self.blocks_dir)?;
        if added && state.blocks().is_complete() {
            log::info!("file {} completed: {}", file_id, state.path().display());
        }
        Ok(added)
    }

    fn add_and_dump(&self, state: FileState) -> Result<FileState, StoreError> {
        state.dump(&self.blocks_dir)?;
        log::info!("tracking {state}");
        self.files
            .write()
            .expect("another user panicked while holding the lock")
            .insert(state.file_id(), Arc::new(Mutex::new(state.clone())));
        Ok(state)
    }

    fn entry(&self, file_id: u32) -> Option<Arc<Mutex<FileState>>> {
        self.files
            .read()
            .expect("another user panicked while holding the lock")
            .get(&file_id)
            .cloned()
    }
}

fn ensure_dir(dir: &Path) -> Result<PathBuf, StoreError> {
    fs::create_dir_all(dir).map_err(|source| StoreError::Write {
        path: dir.to_path_buf(),
        source,
    })?;
    fs::canonicalize(dir).map_err(|source| StoreError::Read {
        path: dir.to_path_buf(),
        source,
    })
}
