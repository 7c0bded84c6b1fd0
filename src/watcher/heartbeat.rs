//! Client-liveness enforcement.
//!
//! Clients touch `.heartbeat` roughly every 300 ms while they wait. This
//! task polls the file's mtime once a second and, when it goes stale with
//! work in flight, reaps every in-flight process group. A stale heartbeat
//! with nothing in flight is ignored — an idle proxy has no clients to
//! keep it fresh.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

use crate::config::ProxyConfig;
use crate::wire;

use super::{WatcherState, pgroup};

const HEARTBEAT_POLL: Duration = Duration::from_secs(1);

pub(crate) async fn monitor(
    state: Arc<WatcherState>,
    dir: PathBuf,
    config: ProxyConfig,
    shutdown: CancellationToken,
) {
    let heartbeat = dir.join(wire::HEARTBEAT_FILE);
    let mut tick = tokio::time::interval(HEARTBEAT_POLL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tick.tick() => {}
        }
        if state.active() == 0 {
            continue;
        }
        if !is_stale(&heartbeat, config.heartbeat_stale) {
            continue;
        }
        let victims = state.mark_all_for_kill(wire::reason::KILLED);
        if victims.is_empty() {
            continue;
        }
        tracing::warn!(count = victims.len(), "heartbeat stale, reaping in-flight requests");
        for (id, pgid) in victims {
            let grace = config.kill_grace;
            tokio::spawn(async move {
                let sig = pgroup::kill_process_group(pgid, grace).await;
                tracing::warn!(id = %id, signal = ?sig, "killed abandoned request");
            });
        }
    }
}

/// Missing file counts as stale; a client touches the heartbeat before it
/// ever publishes a request.
fn is_stale(path: &Path, threshold: Duration) -> bool {
    match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(mtime) => SystemTime::now()
            .duration_since(mtime)
            .is_ok_and(|age| age > threshold),
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_heartbeat_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        assert!(is_stale(&dir.path().join(".heartbeat"), Duration::from_secs(5)));
    }

    #[test]
    fn fresh_heartbeat_is_not_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".heartbeat");
        std::fs::write(&path, b"").unwrap();
        assert!(!is_stale(&path, Duration::from_secs(5)));
    }

    #[test]
    fn old_heartbeat_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".heartbeat");
        std::fs::write(&path, b"").unwrap();
        let past = filetime::FileTime::from_system_time(SystemTime::now() - Duration::from_secs(30));
        filetime::set_file_mtime(&path, past).unwrap();
        assert!(is_stale(&path, Duration::from_secs(5)));
    }
}
