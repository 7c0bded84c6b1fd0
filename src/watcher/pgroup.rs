//! Process-group signal escalation.
//!
//! Children run as leaders of their own process group, so signalling
//! `-pgid` reaches grandchildren spawned by shells and wrappers too. The
//! escalation ladder is SIGTERM, a bounded liveness poll, then SIGKILL.

use std::time::Duration;

use tokio::time::Instant;

const KILL_POLL: Duration = Duration::from_millis(100);

/// Probe the group with signal 0. ESRCH is the only "gone" answer; EPERM
/// or success both mean something in the group is still alive.
pub(crate) fn group_alive(pgid: i32) -> bool {
    if unsafe { libc::kill(-pgid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

fn signal_group(pgid: i32, sig: i32) {
    unsafe {
        libc::kill(-pgid, sig);
    }
}

/// Kill the whole process group: SIGTERM, poll up to `grace`, then
/// SIGKILL. Returns the signal that ended the group, or `None` when the
/// group was already dead.
pub(crate) async fn kill_process_group(pgid: i32, grace: Duration) -> Option<&'static str> {
    if !group_alive(pgid) {
        return None;
    }
    signal_group(pgid, libc::SIGTERM);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        tokio::time::sleep(KILL_POLL.min(grace)).await;
        if !group_alive(pgid) {
            return Some("SIGTERM");
        }
    }
    signal_group(pgid, libc::SIGKILL);
    Some("SIGKILL")
}
