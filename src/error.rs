use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GangwayError {
    #[error("proxy already running for this command (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("invalid command name {0:?}: must be non-empty and contain no '/'")]
    InvalidCommand(String),

    #[error("cannot create proxy directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("directory watch failed: {0}")]
    Watch(#[from] notify::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
