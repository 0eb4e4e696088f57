mod common;

use common::{TestOps, executor, options, replace_config, wait_for_key, wait_until};
use moor_tether::config::encode;
use moor_tether::{MemoryChannel, SessionConfig, Tether, TetherError};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::sync::Arc;
use std::time::Duration;

static LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

fn alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

#[tokio::test]
async fn test_reload_starts_new_and_terminates_removed_sessions() {
    let _guard = LOCK.lock().await;
    let initial = executor(vec![SessionConfig::new("s1", "sleep", &["30"])]);
    let channel = Arc::new(MemoryChannel::new(encode(&initial)));
    let ops = Arc::new(TestOps::default());
    let tether = Tether::new(channel.clone(), ops.clone(), options());
    let handle = tether.handle();
    let task = tokio::spawn(tether.start());

    let pid: i32 = wait_for_key(&channel, "session.s1.pid").await.parse().unwrap();
    assert!(alive(pid));

    replace_config(
        &channel,
        &executor(vec![SessionConfig::new("s2", "echo", &["two"])]),
    );
    handle.reload().await.unwrap();

    assert_eq!(wait_for_key(&channel, "session.s2.exit_status").await, "0");
    wait_until("removed session to exit", || !alive(pid)).await;
    // the host dropped s1, so nothing is written back for it
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(channel.snapshot().keys().all(|k| !k.starts_with("session.s1.")));

    handle.stop().await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reload_leaves_running_sessions_alone() {
    let _guard = LOCK.lock().await;
    let initial = executor(vec![SessionConfig::new("s1", "sleep", &["30"])]);
    let channel = Arc::new(MemoryChannel::new(encode(&initial)));
    let ops = Arc::new(TestOps::default());
    let tether = Tether::new(channel.clone(), ops, options());
    let handle = tether.handle();
    let task = tokio::spawn(tether.start());

    let pid = wait_for_key(&channel, "session.s1.pid").await;
    handle.reload().await.unwrap();
    handle.reload().await.unwrap();
    assert_eq!(channel.get("session.s1.pid").unwrap(), pid);
    assert!(alive(pid.parse().unwrap()));

    handle.signal("s1", Signal::SIGKILL).await.unwrap();
    assert_eq!(wait_for_key(&channel, "session.s1.exit_status").await, "137");

    handle.stop().await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_removed_session_ignoring_sigterm_is_killed() {
    let _guard = LOCK.lock().await;
    let stubborn = SessionConfig::new("s1", "sh", &["-c", "trap '' TERM; exec sleep 30"]);
    let channel = Arc::new(MemoryChannel::new(encode(&executor(vec![stubborn]))));
    let tether = Tether::new(channel.clone(), Arc::new(TestOps::default()), options());
    let handle = tether.handle();
    let task = tokio::spawn(tether.start());

    let pid: i32 = wait_for_key(&channel, "session.s1.pid").await.parse().unwrap();
    // give the shell time to install its trap
    tokio::time::sleep(Duration::from_millis(300)).await;

    replace_config(&channel, &executor(Vec::new()));
    handle.reload().await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(alive(pid));
    wait_until("escalation to SIGKILL", || !alive(pid)).await;

    handle.stop().await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_bad_session_entry_only_drops_that_session() {
    let _guard = LOCK.lock().await;
    let channel = Arc::new(MemoryChannel::new(encode(&executor(Vec::new()))));
    let tether = Tether::new(channel.clone(), Arc::new(TestOps::default()), options());
    let handle = tether.handle();
    let task = tokio::spawn(tether.start());

    let mut config = executor(vec![SessionConfig::new("good", "echo", &["ok"])]);
    config.add_session(SessionConfig::new("bad", "true", &[]));
    replace_config(&channel, &config);
    channel.set("session.bad.tty", "yes");
    handle.reload().await.unwrap();

    assert_eq!(wait_for_key(&channel, "session.good.exit_status").await, "0");
    let error = channel.get("session.bad.error").unwrap();
    assert!(error.contains("session.bad.tty"), "{}", error);
    assert!(channel.get("session.bad.pid").is_none());
    assert!(!handle.is_stopped());

    handle.stop().await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_incomplete_session_launches_once_fixed() {
    let _guard = LOCK.lock().await;
    let channel = Arc::new(MemoryChannel::new(encode(&executor(Vec::new()))));
    let tether = Tether::new(channel.clone(), Arc::new(TestOps::default()), options());
    let handle = tether.handle();
    let task = tokio::spawn(tether.start());

    // without a cmd there is no entry to report an error on
    channel.set("session.s9.name", "s9");
    handle.reload().await.unwrap();
    assert!(channel.get("session.s9.error").is_none());

    channel.set("session.s9.cmd", "true");
    handle.reload().await.unwrap();
    assert_eq!(wait_for_key(&channel, "session.s9.exit_status").await, "0");

    handle.stop().await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unreadable_executor_fails_reload_only() {
    let _guard = LOCK.lock().await;
    let initial = executor(vec![SessionConfig::new("s1", "sleep", &["30"])]);
    let channel = Arc::new(MemoryChannel::new(encode(&initial)));
    let tether = Tether::new(channel.clone(), Arc::new(TestOps::default()), options());
    let handle = tether.handle();
    let task = tokio::spawn(tether.start());

    let pid: i32 = wait_for_key(&channel, "session.s1.pid").await.parse().unwrap();
    channel.set("executor.created", "yesterday");
    let err = handle.reload().await.unwrap_err();
    assert!(matches!(err, TetherError::Config(_)));
    assert!(!handle.is_stopped());
    assert!(alive(pid));

    handle.stop().await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_exit_of_deleted_session_leaves_no_keys() {
    let _guard = LOCK.lock().await;
    let initial = executor(vec![SessionConfig::new("s1", "sleep", &["0.5"])]);
    let channel = Arc::new(MemoryChannel::new(encode(&initial)));
    let tether = Tether::new(channel.clone(), Arc::new(TestOps::default()), options());
    let handle = tether.handle();
    let task = tokio::spawn(tether.start());

    let pid: i32 = wait_for_key(&channel, "session.s1.pid").await.parse().unwrap();

    // the host drops s1 and adds s2, but s1 exits before the reload
    let next = executor(vec![SessionConfig::new("s2", "echo", &["two"])]);
    replace_config(&channel, &next);
    wait_until("s1 to exit", || !alive(pid)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(channel.snapshot().keys().all(|k| !k.starts_with("session.s1.")));

    handle.reload().await.unwrap();
    assert_eq!(wait_for_key(&channel, "session.s2.exit_status").await, "0");

    handle.stop().await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_orphans_are_reaped_quietly() {
    let _guard = LOCK.lock().await;
    // orphaned grandchildren are reparented to us, as they would be to PID 1
    nix::sys::prctl::set_child_subreaper(true).unwrap();

    let session = SessionConfig::new("s1", "sh", &["-c", "sleep 0.2 >/dev/null 2>&1 & exit 0"]);
    let channel = Arc::new(MemoryChannel::new(encode(&executor(vec![session]))));
    let tether = Tether::new(channel.clone(), Arc::new(TestOps::default()), options());
    let handle = tether.handle();
    let task = tokio::spawn(tether.start());

    assert_eq!(wait_for_key(&channel, "session.s1.exit_status").await, "0");
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(!handle.is_stopped());
    handle.reload().await.unwrap();

    handle.stop().await;
    task.await.unwrap().unwrap();
}
