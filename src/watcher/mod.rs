//! Host-side watcher: accepts, executes, streams, and finalizes requests
//! published into the shared proxy directory, enforces client liveness,
//! and shuts down without orphaning in-flight work.

mod exec;
mod heartbeat;
mod pgroup;
mod pidlock;

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ProxyConfig;
use crate::error::GangwayError;
use crate::script;
use crate::wire::{self, ExitLine};

/// Fallback cadence for picking up requests when the filesystem delivers
/// no change events (some bind-mount setups don't). Atomic publication and
/// claim-by-unlink make the rescan idempotent.
const RESCAN_INTERVAL: Duration = Duration::from_millis(500);
const DRAIN_POLL: Duration = Duration::from_millis(100);
/// Response artifacts older than this are deleted at startup.
const SWEEP_MAX_AGE: Duration = Duration::from_secs(300);

/// Process-wide coordination state for one watcher, shared by the event
/// loop, the per-request tasks, and the heartbeat monitor. Owned by the
/// `Watcher` value rather than living in statics so tests can run
/// independent watchers side by side.
pub(crate) struct WatcherState {
    /// Requests claimed but not yet finalized. Gates the shutdown drain
    /// and heartbeat enforcement.
    active: AtomicUsize,
    /// Once set, new requests are rejected with `125:shutdown`.
    draining: AtomicBool,
    inflight: Mutex<HashMap<String, InFlight>>,
}

struct InFlight {
    pgid: i32,
    /// Reason token for a host-initiated kill; consulted when the child's
    /// wait status reports death by signal.
    host_kill: Option<&'static str>,
}

impl WatcherState {
    fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    fn begin_request(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn finish_request(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn set_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub(crate) fn register(&self, id: &str, pgid: i32) {
        self.lock_inflight()
            .insert(id.to_string(), InFlight { pgid, host_kill: None });
    }

    pub(crate) fn remove(&self, id: &str) {
        self.lock_inflight().remove(id);
    }

    pub(crate) fn host_kill_reason(&self, id: &str) -> Option<&'static str> {
        self.lock_inflight().get(id).and_then(|e| e.host_kill)
    }

    /// Mark every entry not already being killed and return what to
    /// signal. The mark is set before any signal goes out so the finalize
    /// path sees it even when the child dies instantly.
    pub(crate) fn mark_all_for_kill(&self, reason: &'static str) -> Vec<(String, i32)> {
        let mut guard = self.lock_inflight();
        let mut victims = Vec::new();
        for (id, entry) in guard.iter_mut() {
            if entry.host_kill.is_none() {
                entry.host_kill = Some(reason);
                victims.push((id.clone(), entry.pgid));
            }
        }
        victims
    }

    fn lock_inflight(&self) -> std::sync::MutexGuard<'_, HashMap<String, InFlight>> {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct Watcher {
    dir: PathBuf,
    command: String,
    config: ProxyConfig,
    state: Arc<WatcherState>,
}

impl Watcher {
    pub fn new(
        dir: impl Into<PathBuf>,
        command: impl Into<String>,
        config: ProxyConfig,
    ) -> Result<Self, GangwayError> {
        let command = command.into();
        if command.is_empty() || command.contains('/') {
            return Err(GangwayError::InvalidCommand(command));
        }
        Ok(Self {
            dir: dir.into(),
            command,
            config,
            state: Arc::new(WatcherState::new()),
        })
    }

    /// Run until `shutdown` fires, then drain and clean up. The binary
    /// wires SIGINT/SIGTERM into the token; tests cancel it directly.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), GangwayError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| GangwayError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;
        let _ = std::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o755));

        // Lock released by Drop on every exit path.
        let _pid_lock =
            pidlock::PidLock::acquire(self.dir.join(format!("{}.pid", self.command)))?;
        let script_path = script::install(&self.dir, &self.command)?;
        sweep_orphans(&self.dir);

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut fs_watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                let _ = event_tx.send(res);
            })?;
        fs_watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;

        let monitor = tokio::spawn(heartbeat::monitor(
            self.state.clone(),
            self.dir.clone(),
            self.config,
            shutdown.clone(),
        ));

        let mut requests: JoinSet<()> = JoinSet::new();
        let mut rescan = tokio::time::interval(RESCAN_INTERVAL);
        rescan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            dir = %self.dir.display(),
            command = %self.command,
            "proxy ready"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = event_rx.recv() => match event {
                    Some(Ok(ev)) => {
                        if touches_request(&ev) {
                            self.scan_pending(&mut requests).await;
                        }
                    }
                    Some(Err(e)) => tracing::warn!("directory watch error: {e}"),
                    // Watcher thread gone; the rescan tick still covers us.
                    None => {}
                },
                _ = rescan.tick() => self.scan_pending(&mut requests).await,
                Some(_) = requests.join_next(), if !requests.is_empty() => {}
            }
        }

        self.drain(&mut requests).await;
        monitor.abort();
        drop(fs_watcher);
        let _ = std::fs::remove_file(&script_path);
        tracing::info!("proxy stopped");
        Ok(())
    }

    /// Scan for `.req` files and admit (or, while draining, reject) each.
    /// Safe to call redundantly: claiming unlinks the request, so a file
    /// is only ever admitted once.
    async fn scan_pending(&self, requests: &mut JoinSet<()>) {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("cannot scan proxy directory: {e}");
                return;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id) = name.strip_suffix(wire::REQ_SUFFIX) else {
                continue;
            };
            self.admit(id.to_string(), requests).await;
        }
    }

    async fn admit(&self, id: String, requests: &mut JoinSet<()>) {
        if self.state.is_draining() {
            self.reject(&id).await;
            return;
        }
        let req_path = wire::artifact(&self.dir, &id, wire::REQ_SUFFIX);
        let bytes = match std::fs::read(&req_path) {
            Ok(bytes) => bytes,
            // Already claimed by an earlier scan of the same event burst.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!(id = %id, "cannot read request: {e}");
                return;
            }
        };
        let _ = std::fs::remove_file(&req_path); // claim
        let argv = wire::parse_argv(&bytes);
        if argv.is_empty() {
            // Defensive: a well-behaved client always sends argv[0].
            tracing::warn!(id = %id, "dropping request with empty argv");
            return;
        }
        self.state.begin_request();
        tracing::debug!(id = %id, fields = argv.len(), "claimed request");
        // argv[0] is the command name as the client saw it; the bound
        // command gets the remaining fields as its arguments.
        let args = argv[1..].to_vec();
        requests.spawn(exec::run_request(
            self.state.clone(),
            self.dir.clone(),
            self.command.clone(),
            id,
            args,
        ));
    }

    /// Refuse a request during shutdown: empty stdout, a one-line stderr,
    /// `125:shutdown`, then release the request file.
    async fn reject(&self, id: &str) {
        let _ = std::fs::write(wire::artifact(&self.dir, id, wire::STDOUT_SUFFIX), b"");
        let _ = std::fs::write(
            wire::artifact(&self.dir, id, wire::STDERR_SUFFIX),
            b"proxy shutting down\n",
        );
        exec::finalize(
            &self.dir,
            id,
            &ExitLine::with_reason(wire::CODE_SHUTDOWN, wire::reason::SHUTDOWN),
        )
        .await;
        let _ = std::fs::remove_file(wire::artifact(&self.dir, id, wire::REQ_SUFFIX));
        tracing::info!(id = %id, "rejected request during shutdown");
    }

    /// Shutdown sequence: reject new work, wait for the active counter to
    /// drain, escalate on the survivors, then let their finalize paths
    /// commit `128+S:shutdown`.
    async fn drain(&self, requests: &mut JoinSet<()>) {
        self.state.set_draining();
        tracing::info!(active = self.state.active(), "shutting down, draining requests");

        let deadline = Instant::now() + self.config.shutdown_grace;
        while self.state.active() > 0 && Instant::now() < deadline {
            // New arrivals during the drain still get a 125:shutdown answer.
            self.scan_pending(requests).await;
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let victims = self.state.mark_all_for_kill(wire::reason::SHUTDOWN);
        if !victims.is_empty() {
            tracing::warn!(count = victims.len(), "drain window elapsed, killing survivors");
            let mut kills = JoinSet::new();
            for (id, pgid) in victims {
                let grace = self.config.kill_grace;
                kills.spawn(async move {
                    let sig = pgroup::kill_process_group(pgid, grace).await;
                    tracing::warn!(id = %id, signal = ?sig, "killed request at shutdown");
                });
            }
            while kills.join_next().await.is_some() {}
        }

        // The killed children still need to be reaped and their exit
        // markers committed before the scaffolding goes away.
        let grace = tokio::time::sleep(self.config.kill_grace + Duration::from_secs(2));
        tokio::pin!(grace);
        loop {
            tokio::select! {
                joined = requests.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
                _ = &mut grace => {
                    tracing::warn!(remaining = requests.len(), "request tasks hung, abandoning");
                    requests.abort_all();
                    break;
                }
            }
        }

        // Anything that raced the drain still gets an answer.
        self.scan_pending(requests).await;
    }
}

fn touches_request(event: &notify::Event) -> bool {
    event.paths.iter().any(|p| {
        p.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(wire::REQ_SUFFIX))
    })
}

/// Delete response artifacts older than the sweep threshold. `.req` files
/// are never swept: a request that predates the watcher is still claimed
/// and executed once the event loop is up.
fn sweep_orphans(dir: &Path) {
    const SWEEPABLE: [&str; 6] = [
        wire::STDOUT_SUFFIX,
        wire::STDERR_SUFFIX,
        wire::EXIT_SUFFIX,
        wire::EXIT_TMP_SUFFIX,
        wire::STDIN_SUFFIX,
        wire::REQ_TMP_SUFFIX,
    ];
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    let mut removed = 0usize;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !SWEEPABLE.iter().any(|s| name.ends_with(s)) {
            continue;
        }
        let old = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|mtime| {
                std::time::SystemTime::now()
                    .duration_since(mtime)
                    .is_ok_and(|age| age > SWEEP_MAX_AGE)
            })
            .unwrap_or(false);
        if old && std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    if removed > 0 {
        tracing::info!(removed, "swept orphaned response artifacts");
    }
}
