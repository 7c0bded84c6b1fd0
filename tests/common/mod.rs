//! Shared harness: an in-process watcher on a temp proxy directory, plus
//! raw-protocol helpers for the tests that must impersonate a client.

#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use gangway::config::ProxyConfig;
use gangway::error::GangwayError;
use gangway::watcher::Watcher;
use gangway::wire;

pub struct TestProxy {
    pub dir: TempDir,
    pub shutdown: CancellationToken,
    pub handle: tokio::task::JoinHandle<Result<(), GangwayError>>,
}

impl TestProxy {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Cancel and wait for the watcher to finish its drain.
    pub async fn stop(self) -> Result<(), GangwayError> {
        self.shutdown.cancel();
        self.handle.await.expect("watcher task panicked")
    }
}

/// Short kill/drain graces so tests finish quickly. The heartbeat window
/// stays at its default: the client script refreshes it every ~300 ms and
/// a tight threshold would make loaded test runs reap healthy requests.
pub fn fast_config() -> ProxyConfig {
    ProxyConfig {
        heartbeat_stale: Duration::from_secs(5),
        kill_grace: Duration::from_millis(200),
        shutdown_grace: Duration::from_millis(400),
    }
}

pub async fn start_proxy(cmd: &str, config: ProxyConfig) -> TestProxy {
    let dir = tempfile::tempdir().expect("tempdir");
    start_proxy_in(dir, cmd, config).await
}

pub async fn start_proxy_in(dir: TempDir, cmd: &str, config: ProxyConfig) -> TestProxy {
    let watcher = Watcher::new(dir.path(), cmd, config).expect("watcher");
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(watcher.run(shutdown.clone()));
    // The installed client script doubles as the readiness marker.
    let script = dir.path().join(cmd);
    assert!(
        wait_for(|| script.exists(), Duration::from_secs(5)).await,
        "watcher did not come up"
    );
    TestProxy { dir, shutdown, handle }
}

pub async fn wait_for(cond: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// Publish a request the way the client script does: tmp, then rename.
pub fn write_request(dir: &Path, id: &str, argv: &[&str]) {
    let tmp = wire::artifact(dir, id, wire::REQ_TMP_SUFFIX);
    std::fs::write(&tmp, wire::encode_argv(argv)).expect("write req.tmp");
    std::fs::rename(tmp, wire::artifact(dir, id, wire::REQ_SUFFIX)).expect("publish req");
}

pub fn touch_heartbeat(dir: &Path) {
    std::fs::write(dir.join(wire::HEARTBEAT_FILE), b"").expect("touch heartbeat");
}

pub fn read_exit(dir: &Path, id: &str) -> Option<String> {
    std::fs::read_to_string(wire::artifact(dir, id, wire::EXIT_SUFFIX))
        .ok()
        .map(|s| s.trim_end().to_string())
}

pub fn exit_exists(dir: &Path, id: &str) -> bool {
    wire::artifact(dir, id, wire::EXIT_SUFFIX).exists()
}

pub fn req_claimed(dir: &Path, id: &str) -> bool {
    !wire::artifact(dir, id, wire::REQ_SUFFIX).exists()
}
