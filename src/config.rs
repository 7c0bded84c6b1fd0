use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default shared directory, relative to the watcher's working directory.
pub const DEFAULT_PROXY_DIR: &str = ".gangway/proxy";

/// Grace periods for the host watcher. All values come from `PROXY_*`
/// environment variables; absent or unparseable values fall back to the
/// defaults silently (a misconfigured grace must never stop the proxy).
#[derive(Debug, Clone, Copy)]
pub struct ProxyConfig {
    /// How long since the last heartbeat touch before in-flight clients
    /// are presumed gone and their process groups are reaped.
    pub heartbeat_stale: Duration,
    /// Wait between SIGTERM and SIGKILL during escalation.
    pub kill_grace: Duration,
    /// Drain window on shutdown before surviving requests are killed.
    pub shutdown_grace: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            heartbeat_stale: Duration::from_secs(5),
            kill_grace: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl ProxyConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            heartbeat_stale: duration_from_env("PROXY_HEARTBEAT_STALE", defaults.heartbeat_stale),
            kill_grace: duration_from_env("PROXY_KILL_GRACE", defaults.kill_grace),
            shutdown_grace: duration_from_env("PROXY_SHUTDOWN_GRACE", defaults.shutdown_grace),
        }
    }
}

/// Resolve the shared proxy directory: `PROXY_DIR` when set, else the
/// conventional location under the current directory. The client script
/// self-locates via `dirname $0`, so host and container only need the
/// bind mount to line up.
pub fn proxy_dir_from_env() -> PathBuf {
    match env::var("PROXY_DIR") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(DEFAULT_PROXY_DIR),
    }
}

/// Parse a duration in (possibly fractional) seconds from the environment.
/// Invalid values fall back without noise beyond a debug line — the spec
/// requires silent degradation to defaults.
fn duration_from_env(var: &str, default: Duration) -> Duration {
    match env::var(var) {
        Ok(raw) => match raw.trim().parse::<f64>() {
            Ok(secs) if secs.is_finite() && secs >= 0.0 => Duration::from_secs_f64(secs),
            _ => {
                tracing::debug!(var, value = %raw, "unparseable duration, using default");
                default
            }
        },
        Err(_) => default,
    }
}
