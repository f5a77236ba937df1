use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use size::Size;
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("could not access journal {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("journal {}, line {line} is malformed: {reason}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("file name {0:?} contains a line break and cannot be journaled")]
    InvalidName(String),
    #[error("no file id left to assign")]
    IdsExhausted,
    #[error("journal {} could not be repaired after a failed append, refusing new records", .0.display())]
    Poisoned(PathBuf),
}

/// A published file. Immutable once journaled.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct FileRecord {
    pub id: u32,
    pub size: u64,
    pub name: String,
}

impl FileRecord {
    /// `id/size/name`; the name may itself contain `/`.
    pub fn serialize(&self) -> String {
        format!("{}/{}/{}", self.id, self.size, self.name)
    }

    pub fn deserialize(raw: &str) -> Result<FileRecord, String> {
        let mut parts = raw.splitn(3, '/');
        let (id, size, name) = match (parts.next(), parts.next(), parts.next()) {
            (Some(id), Some(size), Some(name)) => (id, size, name),
            _ => return Err(format!("expected id/size/name, got {raw:?}")),
        };
        let id = id
            .parse::<u32>()
            .map_err(|e| format!("invalid id {id:?}: {e}"))?;
        let size = size
            .parse::<u64>()
            .map_err(|e| format!("invalid size {size:?}: {e}"))?;
        Ok(FileRecord {
            id,
            size,
            name: name.to_string(),
        })
    }
}

impl fmt::Display for FileRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {} ({})", self.id, self.name, Size::from_bytes(self.size))
    }
}

struct JournalWriter {
    file: File,
    // bytes of complete, synced lines
    len: u64,
    last_id: Option<u32>,
    poisoned: bool,
}

impl JournalWriter {
    /// Appends and syncs `line`. On failure the file is cut back to its previous
    /// length so that no partial line is left behind; if even that fails the writer
    /// refuses every later append.
    async fn append(&mut self, line: &str) -> io::Result<()> {
        let start = self.len;
        let written = match self.file.write_all(line.as_bytes()).await {
            Ok(()) => match self.file.flush().await {
                Ok(()) => self.file.sync_data().await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => {
                self.len += line.len() as u64;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.truncate(start).await {
                    log::error!("could not cut journal back to {start} bytes: {rollback}");
                    self.poisoned = true;
                }
                Err(e)
            }
        }
    }

    async fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len).await?;
        self.file.sync_data().await
    }
}

/// Durable, append-only registry of published files.
///
/// `add` holds the writer lock across id assignment, the synced append and the
/// in-memory publish, so ids are unique, log lines never interleave and the
/// in-memory order is the log order. Readers only take a short snapshot lock.
pub struct Journal {
    path: PathBuf,
    writer: Mutex<JournalWriter>,
    records: RwLock<Vec<FileRecord>>,
}

impl Journal {
    /// Opens (creating if needed) the journal and replays it. Any malformed line fails
    /// the whole open: the tracker must not run on a partially understood journal.
    pub async fn open(path: &Path) -> Result<Journal, JournalError> {
        let io_err = |source| JournalError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).await.map_err(io_err)?;
            }
        }
        log::debug!("touch journal file {}", path.display());
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(io_err)?;

        log::debug!("load journal records");
        let mut content = fs::read_to_string(path).await.map_err(io_err)?;
        // a line without its newline was never acknowledged: the append was torn
        if !content.is_empty() && !content.ends_with('\n') {
            let keep = content.rfind('\n').map_or(0, |i| i + 1);
            log::warn!(
                "journal {} ends with the unterminated record {:?}, dropping it",
                path.display(),
                &content[keep..]
            );
            file.set_len(keep as u64).await.map_err(io_err)?;
            file.sync_data().await.map_err(io_err)?;
            content.truncate(keep);
        }
        let mut records = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            let record = FileRecord::deserialize(line).map_err(|reason| JournalError::Parse {
                path: path.to_path_buf(),
                line: idx + 1,
                reason,
            })?;
            records.push(record);
        }
        let last_id = records.iter().map(|r| r.id).max();
        log::info!(
            "journal {} loaded with {} records",
            path.display(),
            records.len()
        );

        Ok(Journal {
            path: path.to_path_buf(),
            writer: Mutex::new(JournalWriter {
                file,
                len: content.len() as u64,
                last_id,
                poisoned: false,
            }),
            records: RwLock::new(records),
        })
    }

    /// Journals a new file and returns its id (max id so far + 1, 0 on an empty journal).
    pub async fn add(&self, size: u64, name: &str) -> Result<u32, JournalError> {
        if name.contains(['\n', '\r']) {
            return Err(JournalError::InvalidName(name.to_string()));
        }

        let mut writer = self.writer.lock().await;
        if writer.poisoned {
            return Err(JournalError::Poisoned(self.path.clone()));
        }
        let id = match writer.last_id {
            None => 0,
            Some(last) => last.checked_add(1).ok_or(JournalError::IdsExhausted)?,
        };
        let record = FileRecord {
            id,
            size,
            name: name.to_string(),
        };

        let line = record.serialize() + "\n";
        writer
            .append(&line)
            .await
            .map_err(|source| JournalError::Io {
                path: self.path.clone(),
                source,
            })?;
        writer.last_id = Some(id);

        log::info!("journaled new file {record}");
        self.records
            .write()
            .expect("another user panicked while holding the lock")
            .push(record);
        Ok(id)
    }

    pub fn records(&self) -> Vec<FileRecord> {
        self.records
            .read()
            .expect("another user panicked while holding the lock")
            .clone()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.records
            .read()
            .expect("another user panicked while holding the lock")
            .iter()
            .map(|r| r.id)
            .collect()
    }
}
