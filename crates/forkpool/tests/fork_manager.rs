//! End-to-end tests for the fork manager.
//!
//! Forking tests share one coordination server per process and must not overlap, so every
//! test here is `#[serial]`.

#![cfg(unix)]

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use forkpool::coordination::CoordinationClient;
use forkpool::fork::kind;
use forkpool::{
    CapturedError, ForkError, ForkManager, ForkManagerConfig, ForkOutcome, ForkStatus, Role,
    TaskFailure,
};
use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::Pid;
use serde_json::{Value, json};
use serial_test::serial;

fn forking() -> ForkManager {
    ForkManager::with_config(ForkManagerConfig::default().with_poll_interval(Duration::from_millis(10)))
}

fn inline() -> ForkManager {
    ForkManager::with_config(ForkManagerConfig::default().with_async(false))
}

// =============================================================================
// Results
// =============================================================================

#[test]
#[serial]
fn results_follow_submission_order() {
    let mut manager = forking();
    // Later forks finish first.
    for n in 0..5u64 {
        manager
            .create()
            .unwrap()
            .run(move |_| {
                std::thread::sleep(Duration::from_millis(50 * (5 - n)));
                Ok::<_, anyhow::Error>(n)
            })
            .submit()
            .unwrap();
    }

    let values = manager.fork_values().unwrap();
    assert_eq!(values, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
    assert!(!manager.has_errors());
}

#[test]
#[serial]
fn values_survive_the_round_trip() {
    let samples = vec![
        json!(true),
        Value::Null,
        json!("null"),
        json!(false),
        json!(0),
        json!(1),
        json!({}),
        json!([]),
        json!({"nested": {"list": [1.5, "two", null]}}),
    ];

    for mut manager in [forking(), inline()] {
        for sample in samples.clone() {
            manager
                .create()
                .unwrap()
                .run(move |_| Ok::<_, anyhow::Error>(sample))
                .submit()
                .unwrap();
        }
        assert_eq!(manager.fork_values().unwrap(), samples);
    }
}

#[test]
#[serial]
fn errors_are_excluded_but_visible() {
    let mut manager = forking();
    manager.create().unwrap().run(|_| Ok::<_, anyhow::Error>("a")).submit().unwrap();
    manager
        .create()
        .unwrap()
        .label("broken")
        .run(|_| Err::<(), _>(anyhow::anyhow!("it broke")))
        .submit()
        .unwrap();
    manager.create().unwrap().run(|_| Ok::<_, anyhow::Error>("c")).submit().unwrap();

    assert_eq!(manager.fork_values().unwrap(), vec![json!("a"), json!("c")]);
    assert!(manager.has_errors());

    let failed = manager.forks(Some(ForkStatus::Error));
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].label(), "broken");

    let all = manager.fork_results(true).unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[1].error().map(CapturedError::message), Some("it broke"));
}

#[test]
#[serial]
fn captured_error_crosses_the_process_boundary() {
    let mut manager = forking();
    let id = manager
        .create()
        .unwrap()
        .run(|_| -> Result<(), TaskFailure> { Err(TaskFailure::with_code("quota exceeded", 42)) })
        .submit()
        .unwrap();
    let line = line!() - 3;
    manager.await_forks().unwrap();

    let fork = manager.fork(id).unwrap();
    assert_eq!(fork.status(), ForkStatus::Error);
    let error = fork.result().and_then(ForkOutcome::error).unwrap();
    assert_eq!(error.message(), "quota exceeded");
    assert_eq!(error.code(), 42);
    assert!(error.kind().ends_with("TaskFailure"), "{}", error.kind());
    assert_eq!(error.file(), Some(file!()));
    assert_eq!(error.line(), Some(line));
}

#[test]
#[serial]
fn panic_in_child_is_captured() {
    let mut manager = forking();
    let id = manager
        .create()
        .unwrap()
        .run(|_| -> anyhow::Result<()> { panic!("child panicked") })
        .submit()
        .unwrap();
    manager.await_forks().unwrap();

    let error = manager.fork(id).unwrap().result().and_then(ForkOutcome::error).unwrap();
    assert_eq!(error.kind(), kind::PANIC);
    assert_eq!(error.message(), "child panicked");
}

#[test]
#[serial]
fn child_that_exits_without_reporting_is_an_error() {
    let mut manager = forking();
    let id = manager
        .create()
        .unwrap()
        .run(|_| -> anyhow::Result<()> { std::process::exit(3) })
        .submit()
        .unwrap();
    manager.await_forks().unwrap();

    let error = manager.fork(id).unwrap().result().and_then(ForkOutcome::error).unwrap();
    assert_eq!(error.kind(), kind::EXITED);
    assert!(error.message().contains("exit code 3"), "{}", error.message());
}

// =============================================================================
// Handles and callbacks
// =============================================================================

#[test]
#[serial]
fn child_sees_itself_as_child_and_parent_gets_pid() {
    let mut manager = forking();
    let id = manager
        .create()
        .unwrap()
        .run(|fork| {
            fork.set_label("inside");
            Ok::<_, anyhow::Error>(json!({
                "role": fork.role(),
                "pid": fork.pid(),
                "me": std::process::id(),
            }))
        })
        .submit()
        .unwrap();

    let fork = manager.fork(id).unwrap();
    assert!(fork.is_asynchronous());
    assert_eq!(fork.role(), Role::Parent);
    let pid = fork.pid().expect("parent knows the child pid");

    let values = manager.fork_values().unwrap();
    assert_eq!(values[0]["role"], json!("child"));
    assert_eq!(values[0]["pid"], json!(pid));
    assert_eq!(values[0]["me"], json!(pid));
    assert_eq!(manager.fork(id).unwrap().label(), "inside");
}

#[test]
#[serial]
fn callbacks_run_in_the_parent() {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let mut manager = forking();

    let ok = seen.clone();
    manager
        .create()
        .unwrap()
        .run(|_| Ok::<_, anyhow::Error>(7))
        .on_success(move |value, fork| {
            ok.borrow_mut().push((fork.id().get(), value.clone(), std::process::id()));
        })
        .submit()
        .unwrap();
    let failed = seen.clone();
    manager
        .create()
        .unwrap()
        .run(|_| Err::<(), _>(anyhow::anyhow!("no")))
        .on_error(move |error, fork| {
            failed
                .borrow_mut()
                .push((fork.id().get(), json!(error.message()), std::process::id()));
        })
        .submit()
        .unwrap();

    manager.await_forks().unwrap();
    manager.await_forks().unwrap();

    // Callbacks fire in completion order.
    let mut seen = seen.borrow().clone();
    seen.sort_by_key(|(id, _, _)| *id);
    let me = std::process::id();
    assert_eq!(seen, vec![(1, json!(7), me), (2, json!("no"), me)]);
}

#[test]
#[serial]
fn terminate_kills_running_forks() {
    let mut manager = forking();
    let id = manager
        .create()
        .unwrap()
        .run(|_| {
            std::thread::sleep(Duration::from_secs(30));
            Ok::<_, anyhow::Error>(())
        })
        .submit()
        .unwrap();
    assert_eq!(manager.fork(id).unwrap().status(), ForkStatus::InProgress);

    let started = Instant::now();
    manager.terminate_forks();
    assert!(started.elapsed() < Duration::from_secs(5));

    let fork = manager.fork(id).unwrap();
    assert_eq!(fork.status(), ForkStatus::Error);
    assert_eq!(
        fork.result().and_then(ForkOutcome::error).map(CapturedError::kind),
        Some(kind::TERMINATED)
    );
}

// =============================================================================
// Timeouts and scheduling
// =============================================================================

#[test]
#[serial]
fn slow_fork_times_out() {
    let mut manager = forking();
    manager.set_wait_timeout(Duration::from_secs(2));
    manager.create().unwrap().run(|_| Ok::<_, anyhow::Error>("quick")).submit().unwrap();
    let slow = manager
        .create()
        .unwrap()
        .label("slow")
        .run(|_| {
            std::thread::sleep(Duration::from_secs(4));
            Ok::<_, anyhow::Error>("late")
        })
        .submit()
        .unwrap();

    let started = Instant::now();
    assert_eq!(manager.fork_values().unwrap(), vec![json!("quick")]);
    assert!(started.elapsed() < Duration::from_millis(3500));

    let error = manager.fork(slow).unwrap().result().and_then(ForkOutcome::error).unwrap();
    assert!(error.is_timeout());
}

#[test]
#[serial]
fn strict_timeout_raises() {
    let mut manager = forking();
    manager
        .set_wait_timeout(Duration::from_millis(300))
        .set_strict_timeouts(true);
    manager
        .create()
        .unwrap()
        .label("stuck")
        .run(|_| {
            std::thread::sleep(Duration::from_secs(10));
            Ok::<_, anyhow::Error>(())
        })
        .submit()
        .unwrap();

    match manager.await_forks() {
        Err(ForkError::WaitTimeout { forks }) => assert_eq!(forks, vec!["stuck"]),
        other => panic!("expected a wait timeout, got {other:?}"),
    }
}

#[test]
#[serial]
fn never_more_than_max_forks_in_progress() {
    let mut manager = forking();
    manager.set_max_forks(2);
    for _ in 0..5 {
        manager
            .create()
            .unwrap()
            .run(|_| {
                std::thread::sleep(Duration::from_millis(500));
                Ok::<_, anyhow::Error>(())
            })
            .submit()
            .unwrap();
        assert!(manager.forks(Some(ForkStatus::InProgress)).len() <= 2);
    }
    assert_eq!(manager.forks(Some(ForkStatus::NotStarted)).len(), 3);

    while manager.update_fork_status().unwrap() > 0 {
        assert!(manager.forks(Some(ForkStatus::InProgress)).len() <= 2);
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(manager.forks(Some(ForkStatus::Complete)).len(), 5);
}

// =============================================================================
// Nesting
// =============================================================================

#[test]
#[serial]
fn manager_inside_a_fork() {
    let mut manager = forking();
    manager
        .create()
        .unwrap()
        .run(|_| -> Result<Vec<Value>, ForkError> {
            let mut inner = ForkManager::new();
            for n in 1..=3u64 {
                inner
                    .create()?
                    .run(move |_| Ok::<_, anyhow::Error>(n * 100))
                    .submit()?;
            }
            inner.fork_values()
        })
        .submit()
        .unwrap();

    assert_eq!(manager.fork_values().unwrap(), vec![json!([100, 200, 300])]);
}

#[test]
#[serial]
fn inline_manager_runs_in_this_process() {
    let mut manager = inline();
    let id = manager
        .create()
        .unwrap()
        .run(|fork| Ok::<_, anyhow::Error>(json!({"pid": fork.pid(), "me": std::process::id()})))
        .submit()
        .unwrap();

    // Finished during submit.
    assert_eq!(manager.fork(id).unwrap().status(), ForkStatus::Complete);
    let values = manager.fork_values().unwrap();
    assert_eq!(values[0]["pid"], Value::Null);
    assert_eq!(values[0]["me"], json!(std::process::id()));
}

// =============================================================================
// Coordination server lifecycle
// =============================================================================

fn submit_value(manager: &mut ForkManager, value: u64) {
    manager
        .create()
        .unwrap()
        .run(move |_| Ok::<_, anyhow::Error>(value))
        .submit()
        .unwrap();
}

#[test]
#[serial]
fn managers_share_one_server_until_the_last_lease_exits() {
    let mut first = forking();
    let mut second = forking();
    submit_value(&mut first, 1);
    submit_value(&mut second, 2);

    let addr = first.coordination_addr().expect("first manager has a server");
    assert_eq!(second.coordination_addr(), Some(addr));

    let client = CoordinationClient::new(addr);
    let status = client.status().unwrap();
    let prefix = format!("{}.", std::process::id());
    assert_eq!(status.leases.len(), 2);
    assert!(status.leases.keys().all(|lease| lease.starts_with(&prefix)));

    assert_eq!(first.fork_values().unwrap(), vec![json!(1)]);
    assert_eq!(second.fork_values().unwrap(), vec![json!(2)]);

    drop(first);
    assert_eq!(client.status().unwrap().leases.len(), 1);

    drop(second);
    assert!(client.status().is_err(), "server still answering after the last lease");
    // Forks and the server have all been reaped.
    assert_eq!(
        waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)),
        Err(Errno::ECHILD)
    );

    let mut third = forking();
    submit_value(&mut third, 3);
    let respawned = third.coordination_addr().expect("a new server was spawned");
    assert_eq!(CoordinationClient::new(respawned).status().unwrap().leases.len(), 1);
    assert_eq!(third.fork_values().unwrap(), vec![json!(3)]);
}

#[test]
#[serial]
fn nested_manager_reuses_the_ancestor_server() {
    let mut manager = forking();
    manager
        .create()
        .unwrap()
        .run(|_| -> Result<Value, ForkError> {
            let mut inner = ForkManager::new();
            inner.create()?.run(|_| Ok::<_, anyhow::Error>(0)).submit()?;
            let addr = inner.coordination_addr().map(|a| a.to_string());
            inner.await_forks()?;
            Ok(json!(addr))
        })
        .submit()
        .unwrap();

    let outer = manager.coordination_addr().unwrap().to_string();
    assert_eq!(manager.fork_values().unwrap(), vec![json!(outer)]);
    // The child took no lease of its own.
    let status = CoordinationClient::new(manager.coordination_addr().unwrap())
        .status()
        .unwrap();
    assert_eq!(status.leases.len(), 1);
}

#[test]
#[serial]
fn status_set_inside_the_child_is_kept() {
    let mut manager = forking();
    let id = manager
        .create()
        .unwrap()
        .run(|fork| -> anyhow::Result<()> {
            fork.set_status(ForkStatus::Complete)?;
            anyhow::bail!("failed after finishing")
        })
        .submit()
        .unwrap();
    manager.await_forks().unwrap();

    let fork = manager.fork(id).unwrap();
    assert_eq!(fork.status(), ForkStatus::Complete);
    assert!(fork.result().is_none());
    assert!(!manager.has_errors());
}
