//! Readiness handshake tests with `/bin/sh` standing in for the worker.
//!
//! Signal dispositions are process-wide, so every case runs inside one test.

use origin_fs::daemon::{spawn_and_wait, DaemonError, Readiness, Relaunch};
use origin_fs::provider::UnsupportedProvider;
use origin_fs::{Error, Settings, StorageManager};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn sh(script: &str) -> Relaunch {
    // `worker` becomes $0; the appended flags become $1 and $2.
    Relaunch::new("/bin/sh", ["-c", script, "worker"])
}

#[test]
fn test_readiness_handshake() {
    let timeout = Duration::from_secs(10);

    // Worker signals readiness and keeps serving.
    let outcome = spawn_and_wait(&sh("kill -USR1 $PPID; sleep 2"), timeout).unwrap();
    assert_eq!(outcome, Readiness::Ready);

    // Worker dies before readiness; its status is reported.
    let outcome = spawn_and_wait(&sh("exit 7"), timeout).unwrap();
    assert_eq!(outcome, Readiness::Exited(7));

    // Readiness from any process other than the worker is ignored.
    let stranger = r#"sh -c 'kill -USR1 "$1"' stranger "$PPID"; sleep 1; exit 5"#;
    let outcome = spawn_and_wait(&sh(stranger), timeout).unwrap();
    assert_eq!(outcome, Readiness::Exited(5));

    // Worker is told to stay in the foreground and whom to notify.
    let check_args = r#"[ "$1" = "--foreground" ] && [ "$2" = "--notify-pid=$PPID" ] && exit 0; exit 3"#;
    let outcome = spawn_and_wait(&sh(check_args), timeout).unwrap();
    assert_eq!(outcome, Readiness::Exited(0));

    // Worker hangs; the wait is bounded and the worker is terminated.
    let started = Instant::now();
    let err = spawn_and_wait(&sh("sleep 30"), Duration::from_millis(300)).unwrap_err();
    assert!(matches!(err, DaemonError::Timeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(10));

    // Through the manager, a failed worker's status becomes the exit code.
    let dir = tempdir().unwrap();
    let mut settings = Settings::rooted_at(dir.path());
    settings.readiness_timeout_secs = 10;
    let manager = StorageManager::open(settings, Arc::new(UnsupportedProvider)).unwrap();
    manager.create("A").unwrap();

    let err = manager.mount_detached("A", &sh("exit 8")).unwrap_err();
    assert!(matches!(err, Error::WorkerExited { code: 8, .. }));
    assert_eq!(err.exit_code(), 8);

    manager
        .mount_detached("A", &sh("kill -USR1 $PPID; sleep 1"))
        .unwrap();

    // Mounting in-process fails cleanly without a provider.
    let err = manager.mount("A").unwrap_err();
    assert!(matches!(err, Error::Attach { .. }));
    assert!(!manager.registry().origin("A").unwrap().is_mounted());
}
