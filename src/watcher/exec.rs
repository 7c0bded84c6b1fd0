//! Execution of one claimed request.
//!
//! Each request runs in its own task: spawn the bound command in a fresh
//! process group with its streams plumbed straight into the response
//! files, wait for it, then commit the exit line. The exit marker is
//! written only after the child has been reaped, which is what guarantees
//! the client's final drain sees every output byte.

use std::ffi::OsString;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;

use crate::wire::{self, ExitLine};

use super::WatcherState;

/// Kills the child's whole process group if the owning task is dropped
/// before the child is reaped. Dropping a `tokio::process::Child` only
/// abandons the leader PID; grandchildren would survive an aborted task
/// as orphans. Disarmed once `wait` returns.
struct GroupGuard {
    pgid: Option<i32>,
}

impl GroupGuard {
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid {
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
}

pub(crate) async fn run_request(
    state: Arc<WatcherState>,
    dir: PathBuf,
    command: String,
    id: String,
    args: Vec<OsString>,
) {
    let line = execute(&state, &dir, &command, &id, args).await;
    finalize(&dir, &id, &line).await;
    // Registry entry and counter survive until the exit marker is
    // committed: the drain gate and the heartbeat reaper both key off them.
    state.remove(&id);
    state.finish_request();
    tracing::info!(id = %id, exit = %line.render(), "request finished");
}

async fn execute(
    state: &Arc<WatcherState>,
    dir: &Path,
    command: &str,
    id: &str,
    args: Vec<OsString>,
) -> ExitLine {
    let stdout_path = wire::artifact(dir, id, wire::STDOUT_SUFFIX);
    let stderr_path = wire::artifact(dir, id, wire::STDERR_SUFFIX);
    let stdin_path = wire::artifact(dir, id, wire::STDIN_SUFFIX);

    let stdout_file = match open_append(&stdout_path) {
        Ok(f) => f,
        Err(e) => {
            tracing::error!(id = %id, "cannot create stdout file: {e}");
            return ExitLine::with_reason(wire::CODE_SPAWN_FAILED, wire::reason::SPAWN_FAILED);
        }
    };
    let stderr_file = match open_append(&stderr_path) {
        Ok(f) => f,
        Err(e) => {
            tracing::error!(id = %id, "cannot create stderr file: {e}");
            return ExitLine::with_reason(wire::CODE_SPAWN_FAILED, wire::reason::SPAWN_FAILED);
        }
    };

    let has_stdin = stdin_path.exists();
    let stdin = if has_stdin {
        match std::fs::File::open(&stdin_path) {
            Ok(f) => Stdio::from(f),
            Err(_) => Stdio::null(),
        }
    } else {
        Stdio::null()
    };

    let mut cmd = Command::new(command);
    cmd.args(&args)
        .stdin(stdin)
        .stdout(Stdio::from(stdout_file))
        .stderr(Stdio::from(stderr_file))
        .process_group(0); // child leads its own group; pgid == pid

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(id = %id, command, "spawn failed: {e}");
            // Surface the spawn error on the client's stderr.
            if let Ok(mut f) = open_append(&stderr_path) {
                let _ = writeln!(f, "{command}: {e}");
            }
            if has_stdin {
                let _ = std::fs::remove_file(&stdin_path);
            }
            return ExitLine::with_reason(wire::CODE_SPAWN_FAILED, wire::reason::SPAWN_FAILED);
        }
    };

    let pgid = child.id().map(|pid| pid as i32);
    if let Some(pgid) = pgid {
        state.register(id, pgid);
    }
    let mut guard = GroupGuard { pgid };

    let status = child.wait().await;
    guard.disarm();

    if has_stdin {
        let _ = std::fs::remove_file(&stdin_path);
    }

    match status {
        Ok(status) => {
            if let Some(code) = status.code() {
                ExitLine::code((code & 0xff) as u8)
            } else if let Some(sig) = status.signal() {
                let code = wire::signal_exit_code(sig);
                // The reason token belongs only to kills this watcher
                // initiated; an externally signalled child reports bare
                // 128+S.
                match state.host_kill_reason(id) {
                    Some(reason) => ExitLine::with_reason(code, reason),
                    None => ExitLine::code(code),
                }
            } else {
                ExitLine::code(1)
            }
        }
        Err(e) => {
            tracing::error!(id = %id, "wait failed: {e}");
            ExitLine::code(1)
        }
    }
}

/// Commit the exit line: write `.exit.tmp`, rename to `.exit`. The rename
/// is the single signal the client waits for.
pub(crate) async fn finalize(dir: &Path, id: &str, line: &ExitLine) {
    let tmp = wire::artifact(dir, id, wire::EXIT_TMP_SUFFIX);
    let path = wire::artifact(dir, id, wire::EXIT_SUFFIX);
    if let Err(e) = tokio::fs::write(&tmp, format!("{}\n", line.render())).await {
        tracing::error!(id = %id, "cannot write exit marker: {e}");
        return;
    }
    if let Err(e) = tokio::fs::rename(&tmp, &path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        tracing::error!(id = %id, "cannot publish exit marker: {e}");
    }
}

fn open_append(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}
