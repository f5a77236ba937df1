use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use size::Size;

use crate::client::block_set::BlockSet;
use crate::client::error::StoreError;
use crate::client::BLOCK_SIZE;
use crate::protocol::wire::{put_u32, put_utf};

pub const SIDECAR_EXTENSION: &str = "stats";

/// Block ownership of one local file, mirrored to `<blocks_dir>/<file_id>.stats`.
///
/// Side-car layout: path as u16-length-prefixed utf-8, total blocks (int32), owned
/// count (int32), then the owned indices (int32 each), all big-endian.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct FileState {
    file_id: u32,
    blocks: BlockSet,
    path: PathBuf,
}

impl FileState {
    pub fn new(file_id: u32, blocks: BlockSet, path: PathBuf) -> Self {
        FileState {
            file_id,
            blocks,
            path,
        }
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn blocks(&self) -> &BlockSet {
        &self.blocks
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn missing_blocks(&self) -> Vec<u32> {
        self.blocks.complement()
    }

    pub fn sidecar_path(blocks_dir: &Path, file_id: u32) -> PathBuf {
        blocks_dir.join(format!("{file_id}.{SIDECAR_EXTENSION}"))
    }

    /// File id encoded in a side-car name, `None` for anything that is not `<u32>.stats`.
    pub fn parse_file_id(sidecar: &Path) -> Option<u32> {
        if sidecar.extension()?.to_str()? != SIDECAR_EXTENSION {
            return None;
        }
        sidecar.file_stem()?.to_str()?.parse::<u32>().ok()
    }

    /// Marks `block_idx` as owned. The new state reaches the side-car before it is
    /// visible in memory, so on failure nothing changes. Returns whether the block
    /// was newly added.
    pub fn mark_owned(&mut self, block_idx: u32, blocks_dir: &Path) -> Result<bool, StoreError> {
        if self.blocks.contains(block_idx) {
            return Ok(false);
        }
        let mut next = self.blocks.clone();
        if !next.insert(block_idx) {
            log::warn!(
                "block {block_idx} is out of range for file {} ({} blocks)",
                self.file_id,
                self.blocks.total()
            );
            return Ok(false);
        }
        write_sidecar(blocks_dir, self.file_id, &next, &self.path)?;
        self.blocks = next;
        Ok(true)
    }

    pub fn dump(&self, blocks_dir: &Path) -> Result<(), StoreError> {
        write_sidecar(blocks_dir, self.file_id, &self.blocks, &self.path)
    }

    pub fn load(blocks_dir: &Path, file_id: u32) -> Result<FileState, StoreError> {
        let sidecar = Self::sidecar_path(blocks_dir, file_id);
        let raw = fs::read(&sidecar).map_err(|source| StoreError::Read {
            path: sidecar.clone(),
            source,
        })?;
        let (path, blocks) = decode(&raw).map_err(|reason| StoreError::Malformed {
            path: sidecar,
            reason,
        })?;
        Ok(FileState::new(file_id, blocks, path))
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        write!(
            f,
            "{}: {name}; {} blocks of {}, {} ready",
            self.file_id,
            self.blocks.total(),
            Size::from_bytes(BLOCK_SIZE),
            self.blocks.owned_count()
        )
    }
}

fn encode(blocks: &BlockSet, path: &Path) -> Result<Vec<u8>, StoreError> {
    let path_str = match path.to_str() {
        Some(p) => p,
        None => return Err(StoreError::UnsupportedPath(path.to_path_buf())),
    };
    let mut buf = Vec::new();
    if put_utf(&mut buf, path_str).is_err() {
        return Err(StoreError::UnsupportedPath(path.to_path_buf()));
    }
    put_u32(&mut buf, blocks.total());
    put_u32(&mut buf, blocks.owned_count() as u32);
    for idx in blocks.owned() {
        put_u32(&mut buf, idx);
    }
    Ok(buf)
}

fn decode(mut raw: &[u8]) -> Result<(PathBuf, BlockSet), String> {
    let path_len = u16::from_be_bytes(take(&mut raw)?) as usize;
    if raw.len() < path_len {
        return Err(format!(
            "path needs {path_len} bytes, only {} left",
            raw.len()
        ));
    }
    let (path_bytes, rest) = raw.split_at(path_len);
    raw = rest;
    let path = match std::str::from_utf8(path_bytes) {
        Ok(p) => PathBuf::from(p),
        Err(e) => return Err(format!("path is not utf-8: {e}")),
    };

    let total = i32::from_be_bytes(take(&mut raw)?);
    let count = i32::from_be_bytes(take(&mut raw)?);
    if total < 0 || count < 0 || count > total {
        return Err(format!("invalid counts: {count} owned of {total}"));
    }
    let total = total as u32;

    let mut owned = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let idx = u32::from_be_bytes(take(&mut raw)?);
        if idx >= total {
            return Err(format!("block {idx} out of range ({total} blocks)"));
        }
        owned.push(idx);
    }
    if !raw.is_empty() {
        return Err(format!("{} trailing bytes", raw.len()));
    }
    Ok((path, BlockSet::from_owned(owned, total)))
}

fn take<const N: usize>(raw: &mut &[u8]) -> Result<[u8; N], String> {
    if raw.len() < N {
        return Err(format!("truncated: needed {N} bytes, {} left", raw.len()));
    }
    let (head, rest) = raw.split_at(N);
    *raw = rest;
    let mut buf = [0u8; N];
    buf.copy_from_slice(head);
    Ok(buf)
}

// temp file + fsync + rename: a crash leaves either the old or the new side-car, never a torn one
fn write_sidecar(
    blocks_dir: &Path,
    file_id: u32,
    blocks: &BlockSet,
    path: &Path,
) -> Result<(), StoreError> {
    let bytes = encode(blocks, path)?;
    let sidecar = FileState::sidecar_path(blocks_dir, file_id);
    let tmp = sidecar.with_extension(format!("{SIDECAR_EXTENSION}.tmp"));

    let write_err = |source| StoreError::Write {
        path: tmp.clone(),
        source,
    };
    let mut f = File::create(&tmp).map_err(write_err)?;
    f.write_all(&bytes).map_err(write_err)?;
    f.sync_all().map_err(write_err)?;
    drop(f);

    fs::rename(&tmp, &sidecar).map_err(|source| StoreError::Write {
        path: sidecar.clone(),
        source,
    })?;
    Ok(())
}
