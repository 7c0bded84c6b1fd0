//! Single-watcher lock file.
//!
//! `<cmd>.pid` holds the watcher's PID as decimal text. A second watcher
//! for the same command refuses to start while the recorded PID is alive;
//! a stale or garbled lock is reclaimed silently.

use std::path::PathBuf;

use crate::error::GangwayError;

#[derive(Debug)]
pub(crate) struct PidLock {
    path: PathBuf,
}

impl PidLock {
    pub(crate) fn acquire(path: PathBuf) -> Result<Self, GangwayError> {
        if let Ok(content) = std::fs::read_to_string(&path) {
            match content.trim().parse::<u32>() {
                // A live PID refuses the lock even when it is our own:
                // tests run several watchers in one process.
                Ok(pid) if pid_alive(pid) => {
                    return Err(GangwayError::AlreadyRunning { pid });
                }
                Ok(pid) => {
                    tracing::debug!(pid, "reclaiming stale pid lock");
                }
                Err(_) => {
                    tracing::debug!(path = %path.display(), "reclaiming malformed pid lock");
                }
            }
        }
        std::fs::write(&path, format!("{}\n", std::process::id()))?;
        Ok(Self { path })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Signal-0 probe; EPERM still means the PID exists.
fn pid_alive(pid: u32) -> bool {
    if unsafe { libc::kill(pid as i32, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
