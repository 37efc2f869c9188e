//! End-to-end scenarios. Each test spawns the real compiled `tunicorn`
//! binary as a subprocess, drives it with real signals via `kill(2)`,
//! and inspects the live process tree — the same approach
//! `gpu_stats::pid::process_tree` uses to enumerate a parent's
//! descendants under `/proc`, since forking inside the test binary
//! itself (already multithreaded by the test harness) is unsound.

use std::collections::HashSet;
use std::fs;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

struct Supervisor {
    child: Child,
}

impl Supervisor {
    fn start(workers: u32, extra: &str) -> (Self, tempfile::TempDir) {
        Self::start_with_timeout(workers, 5, extra)
    }

    fn start_with_timeout(workers: u32, timeout_secs: u64, extra: &str) -> (Self, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("tunicorn.json");
        let port = free_tcp_port();
        let body = format!(
            r#"{{"WORKERS": {workers}, "BIND": ["127.0.0.1:{port}"], "TIMEOUT": {timeout_secs}, "GRACEFUL_TIMEOUT": 2 {extra}}}"#
        );
        fs::write(&config_path, body).unwrap();

        let child = Command::new(env!("CARGO_BIN_EXE_tunicorn"))
            .arg("demo:echo")
            .arg("-c")
            .arg(&config_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to launch tunicorn");

        std::thread::sleep(Duration::from_millis(300));
        (Supervisor { child }, dir)
    }

    fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    fn signal(&self, sig: Signal) {
        kill(Pid::from_raw(self.pid()), sig).unwrap();
    }

    fn children(&self) -> Vec<i32> {
        process_tree(self.pid()).unwrap_or_default()
    }

    fn wait_for<F: Fn(&Self) -> bool>(&self, timeout: Duration, pred: F) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if pred(self) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        false
    }

    fn wait_exit(&mut self, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(Some(status)) = self.child.try_wait() {
                return status.code();
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        None
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let _ = self.signal_checked(Signal::SIGKILL);
        let _ = self.child.wait();
    }
}

impl Supervisor {
    fn signal_checked(&self, sig: Signal) -> nix::Result<()> {
        kill(Pid::from_raw(self.pid()), sig)
    }
}

fn process_tree(parent_pid: i32) -> std::io::Result<Vec<i32>> {
    let mut descendants = Vec::new();
    let mut stack = vec![parent_pid];
    let mut seen = std::collections::HashSet::new();
    while let Some(pid) = stack.pop() {
        if !seen.insert(pid) {
            continue;
        }
        let path = format!("/proc/{pid}/task/{pid}/children");
        if let Ok(contents) = fs::read_to_string(&path) {
            let kids: Vec<i32> = contents.split_whitespace().filter_map(|s| s.parse().ok()).collect();
            stack.extend(&kids);
            descendants.extend(&kids);
        }
    }
    Ok(descendants)
}

fn free_tcp_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn process_exists(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

#[test]
fn spawns_to_target_count() {
    let (sup, _dir) = Supervisor::start(3, "");
    let reached = sup.wait_for(Duration::from_secs(2), |s| s.children().len() == 3);
    assert!(reached, "expected 3 workers, saw {:?}", sup.children());
}

#[test]
fn scales_up_then_down_and_retires_workers() {
    let (sup, _dir) = Supervisor::start(2, "");
    assert!(sup.wait_for(Duration::from_secs(2), |s| s.children().len() == 2));

    sup.signal(Signal::SIGTTIN);
    sup.signal(Signal::SIGTTIN);
    assert!(sup.wait_for(Duration::from_secs(2), |s| s.children().len() == 4));
    let before_shrink: HashSet<i32> = sup.children().into_iter().collect();

    sup.signal(Signal::SIGTTOU);
    sup.signal(Signal::SIGTTOU);
    sup.signal(Signal::SIGTTOU);
    assert!(sup.wait_for(Duration::from_secs(2), |s| s.children().len() == 1));

    // Not just a count drop: the three retired pids must actually be
    // gone, i.e. the worker process received SIGTERM and exited, rather
    // than the master reporting a smaller count while orphans linger.
    let after_shrink: HashSet<i32> = sup.children().into_iter().collect();
    let retired: Vec<i32> = before_shrink.difference(&after_shrink).copied().collect();
    assert_eq!(retired.len(), 3, "expected 3 workers retired, saw {before_shrink:?} -> {after_shrink:?}");
    for pid in retired {
        assert!(!process_exists(pid), "retired worker {pid} is still alive");
    }
}

#[test]
fn ttou_at_one_worker_is_a_no_op() {
    let (sup, _dir) = Supervisor::start(1, "");
    assert!(sup.wait_for(Duration::from_secs(2), |s| s.children().len() == 1));
    sup.signal(Signal::SIGTTOU);
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(sup.children().len(), 1);
}

#[test]
fn graceful_shutdown_exits_cleanly() {
    let (mut sup, _dir) = Supervisor::start(2, "");
    assert!(sup.wait_for(Duration::from_secs(2), |s| s.children().len() == 2));

    sup.signal(Signal::SIGTERM);
    let status = sup
        .child
        .wait()
        .expect("master should exit after SIGTERM");
    assert!(status.success());
}

#[test]
fn signal_burst_stays_responsive() {
    let (sup, _dir) = Supervisor::start(2, "");
    assert!(sup.wait_for(Duration::from_secs(2), |s| s.children().len() == 2));

    for _ in 0..20 {
        let _ = sup.signal_checked(Signal::SIGCHLD);
    }

    // The master should still respond to ordinary scaling signals after
    // an oversized burst; the bounded queue drops excess but never wedges.
    sup.signal(Signal::SIGTTIN);
    assert!(sup.wait_for(Duration::from_secs(2), |s| s.children().len() == 3));
}

#[test]
fn boot_failure_halts_master_with_worker_boot_error() {
    // CHDIR to a path that does not exist fails in the child before
    // `booted` flips true, so the worker exits with WORKER_BOOT_ERROR
    // and the master must halt with that same status.
    let (mut sup, _dir) = Supervisor::start(1, r#", "CHDIR": "/nonexistent/tunicorn-test-dir""#);
    let code = sup.wait_exit(Duration::from_secs(5));
    assert_eq!(code, Some(3), "master should exit 3 on worker boot failure");
}

#[test]
fn stuck_worker_is_aborted_then_killed_and_replaced() {
    let (sup, _dir) = Supervisor::start_with_timeout(1, 2, "");
    assert!(sup.wait_for(Duration::from_secs(2), |s| s.children().len() == 1));
    let stuck_pid = sup.children()[0];

    // Freeze the worker without touching its code: a stopped process
    // cannot call back into its heartbeat, so it goes stale exactly the
    // way a wedged accept loop would.
    kill(Pid::from_raw(stuck_pid), Signal::SIGSTOP).unwrap();

    // The murder policy ticks every 5s: first sends SIGABRT, then, since
    // a stopped process can't act on it, escalates to SIGKILL on the
    // next tick. Allow two ticks plus the initial staleness window.
    let reaped = sup.wait_for(Duration::from_secs(20), |_| !process_exists(stuck_pid));
    assert!(reaped, "stuck worker {stuck_pid} was never killed");

    // manage_workers should replace it to keep the pool at target size.
    assert!(sup.wait_for(Duration::from_secs(5), |s| {
        s.children().len() == 1 && s.children()[0] != stuck_pid
    }));
}
