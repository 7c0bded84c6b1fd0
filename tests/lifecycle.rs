//! Watcher lifecycle: heartbeat reaping, shutdown drain, orphan sweep,
//! and the PID lock. These tests speak the raw wire protocol (hand-written
//! request files) where the client script's own heartbeat loop would
//! defeat the scenario under test.

mod common;

use std::time::Duration;

use filetime::FileTime;
use gangway::config::ProxyConfig;
use gangway::error::GangwayError;
use gangway::watcher::Watcher;
use tokio_util::sync::CancellationToken;

use common::{
    exit_exists, read_exit, req_claimed, start_proxy, start_proxy_in, touch_heartbeat, wait_for,
    write_request,
};

fn backdate(path: &std::path::Path, by: Duration) {
    let past = FileTime::from_system_time(std::time::SystemTime::now() - by);
    filetime::set_file_mtime(path, past).expect("backdate mtime");
}

#[tokio::test]
async fn stale_heartbeat_reaps_inflight_process_group() {
    let config = ProxyConfig {
        heartbeat_stale: Duration::from_millis(500),
        kill_grace: Duration::from_millis(200),
        shutdown_grace: Duration::from_millis(400),
    };
    let proxy = start_proxy("sleep", config).await;

    touch_heartbeat(proxy.path());
    write_request(proxy.path(), "reap-1", &["sleep", "30"]);
    assert!(
        wait_for(|| req_claimed(proxy.path(), "reap-1"), Duration::from_secs(5)).await,
        "request was never claimed"
    );

    // No further heartbeat touches: the monitor should declare the client
    // gone and kill the group within stale + poll + kill grace.
    assert!(
        wait_for(|| exit_exists(proxy.path(), "reap-1"), Duration::from_secs(8)).await,
        "abandoned request was never finalized"
    );
    // sleep dies on the group SIGTERM: 128+15, tagged as a host kill.
    assert_eq!(read_exit(proxy.path(), "reap-1").as_deref(), Some("143:killed"));

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn stale_heartbeat_with_no_inflight_work_is_ignored() {
    let config = ProxyConfig {
        heartbeat_stale: Duration::from_millis(300),
        kill_grace: Duration::from_millis(200),
        shutdown_grace: Duration::from_millis(400),
    };
    let proxy = start_proxy("echo", config).await;

    touch_heartbeat(proxy.path());
    backdate(&proxy.path().join(".heartbeat"), Duration::from_secs(60));
    tokio::time::sleep(Duration::from_millis(2500)).await;

    assert!(!proxy.handle.is_finished(), "watcher died on an idle stale heartbeat");
    // A request submitted afterwards still goes through.
    touch_heartbeat(proxy.path());
    write_request(proxy.path(), "after-idle", &["echo", "still", "alive"]);
    assert!(
        wait_for(|| exit_exists(proxy.path(), "after-idle"), Duration::from_secs(5)).await
    );
    assert_eq!(read_exit(proxy.path(), "after-idle").as_deref(), Some("0"));

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn shutdown_rejects_new_requests_and_drains_running_ones() {
    let config = ProxyConfig {
        heartbeat_stale: Duration::from_secs(30),
        kill_grace: Duration::from_millis(200),
        shutdown_grace: Duration::from_secs(3),
    };
    let mut proxy = start_proxy("sh", config).await;

    touch_heartbeat(proxy.path());
    write_request(proxy.path(), "slow-ok", &["sh", "-c", "sleep 0.6; echo done"]);
    assert!(
        wait_for(|| req_claimed(proxy.path(), "slow-ok"), Duration::from_secs(5)).await
    );

    proxy.shutdown.cancel();
    // Arrives mid-drain: must be answered with 125:shutdown, not executed.
    write_request(proxy.path(), "late", &["sh", "-c", "echo never"]);

    assert!(
        wait_for(|| exit_exists(proxy.path(), "late"), Duration::from_secs(5)).await,
        "late request never got a rejection"
    );
    assert_eq!(read_exit(proxy.path(), "late").as_deref(), Some("125:shutdown"));
    let stderr =
        std::fs::read_to_string(proxy.path().join("late.stderr")).unwrap_or_default();
    assert!(stderr.contains("shutting down"), "stderr: {stderr:?}");

    (&mut proxy.handle).await.unwrap().unwrap();
    // The running request finished inside the drain window.
    assert_eq!(read_exit(proxy.path(), "slow-ok").as_deref(), Some("0"));
    let stdout = std::fs::read_to_string(proxy.path().join("slow-ok.stdout")).unwrap();
    assert_eq!(stdout, "done\n");
}

#[tokio::test]
async fn shutdown_kills_children_that_outlive_the_drain_window() {
    let config = ProxyConfig {
        heartbeat_stale: Duration::from_secs(30),
        kill_grace: Duration::from_millis(300),
        shutdown_grace: Duration::from_millis(300),
    };
    let mut proxy = start_proxy("sh", config).await;

    touch_heartbeat(proxy.path());
    // A busy loop: SIGTERM is ignored and the shell never exits on its
    // own, so only the SIGKILL escalation ends it.
    write_request(proxy.path(), "hung", &["sh", "-c", "trap '' TERM; while :; do :; done"]);
    assert!(
        wait_for(|| req_claimed(proxy.path(), "hung"), Duration::from_secs(5)).await
    );
    // Let the shell install its trap before shutdown races it.
    tokio::time::sleep(Duration::from_millis(300)).await;

    proxy.shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), &mut proxy.handle)
        .await
        .expect("shutdown hung")
        .unwrap()
        .unwrap();

    assert_eq!(read_exit(proxy.path(), "hung").as_deref(), Some("137:shutdown"));
}

#[tokio::test]
async fn startup_sweeps_old_artifacts_and_keeps_requests() {
    let dir = tempfile::tempdir().unwrap();
    let old = Duration::from_secs(600);

    for name in ["stale.stdout", "stale.stderr", "stale.exit", "stale.stdin"] {
        let path = dir.path().join(name);
        std::fs::write(&path, b"leftover").unwrap();
        backdate(&path, old);
    }
    let fresh = dir.path().join("fresh.stdout");
    std::fs::write(&fresh, b"recent").unwrap();

    // A request that predates the watcher is not swept — it is executed.
    touch_heartbeat(dir.path());
    write_request(dir.path(), "early", &["echo", "caught", "up"]);
    backdate(&dir.path().join("early.req"), old);

    let proxy = start_proxy_in(dir, "echo", common::fast_config()).await;

    assert!(
        wait_for(|| exit_exists(proxy.path(), "early"), Duration::from_secs(5)).await,
        "pre-start request was never executed"
    );
    assert_eq!(read_exit(proxy.path(), "early").as_deref(), Some("0"));
    assert_eq!(
        std::fs::read_to_string(proxy.path().join("early.stdout")).unwrap(),
        "caught up\n"
    );

    for name in ["stale.stdout", "stale.stderr", "stale.exit", "stale.stdin"] {
        assert!(!proxy.path().join(name).exists(), "{name} survived the sweep");
    }
    assert!(fresh.exists(), "young artifact was swept");

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn second_watcher_for_same_command_is_refused() {
    let proxy = start_proxy("echo", common::fast_config()).await;

    let second = Watcher::new(proxy.path(), "echo", common::fast_config()).unwrap();
    let err = second
        .run(CancellationToken::new())
        .await
        .expect_err("second watcher should refuse to start");
    assert!(matches!(err, GangwayError::AlreadyRunning { .. }), "{err:?}");

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn stale_or_garbled_pid_lock_does_not_block_startup() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("echo.pid"), "not a pid\n").unwrap();

    let mut proxy = start_proxy_in(dir, "echo", common::fast_config()).await;
    let recorded: u32 = std::fs::read_to_string(proxy.path().join("echo.pid"))
        .unwrap()
        .trim()
        .parse()
        .expect("lock should hold our pid");
    assert_eq!(recorded, std::process::id());

    proxy.shutdown.cancel();
    (&mut proxy.handle).await.unwrap().unwrap();
    // Clean shutdown removes its scaffolding.
    assert!(!proxy.path().join("echo.pid").exists());
    assert!(!proxy.path().join("echo").exists());
}

#[tokio::test]
async fn empty_request_is_dropped_without_response() {
    let proxy = start_proxy("echo", common::fast_config()).await;

    touch_heartbeat(proxy.path());
    let tmp = proxy.path().join("void.req.tmp");
    std::fs::write(&tmp, b"").unwrap();
    std::fs::rename(&tmp, proxy.path().join("void.req")).unwrap();

    assert!(
        wait_for(|| req_claimed(proxy.path(), "void"), Duration::from_secs(5)).await,
        "empty request was never consumed"
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!exit_exists(proxy.path(), "void"));
    assert!(!proxy.path().join("void.stdout").exists());

    proxy.stop().await.unwrap();
}
