use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("could not read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("could not write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("block state {} is malformed: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },
    #[error("path {} cannot be stored in a block state file", .0.display())]
    UnsupportedPath(PathBuf),
    #[error("file of {size} bytes has more blocks than int32 indices can address")]
    TooLarge { size: u64 },
    #[error("{} already holds another tracked file", .0.display())]
    PathInUse(PathBuf),
}
