//! `Arbiter`: the master process. Owns the listener set and worker
//! pool, runs the signal-driven control loop, and is the only thing in
//! this crate allowed to fork.
//!
//! Grounded in `launcher.rs`'s `Launcher::start()` (`fork::{fork, Fork}`
//! plus a parent/child split) for the fork mechanics, generalized from
//! one subprocess to an N-worker pool with heartbeat-based supervision.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fork::{fork, Fork};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{error, info, warn};

use crate::app::Application;
use crate::config::{Config, WORKER_BOOT_ERROR, APP_LOAD_ERROR};
use crate::error::{Result, SupervisorError};
use crate::heartbeat::WorkerHeartbeat;
use crate::listener::{self, Listener};
use crate::pidfile::Pidfile;
use crate::signaler::{self, Signaler};
use crate::worker::{self, Worker, WorkerContext, WorkerRecord};

/// What the control loop should do after a handler returns — replaces
/// the original's `StopIteration`-as-control-flow with an explicit
/// return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    Continue,
    ShutdownGraceful,
    ShutdownImmediate,
}

const MURDER_TICK: Duration = Duration::from_secs(5);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Arbiter {
    config: Config,
    app: Application,
    listeners: Vec<Listener>,
    workers: BTreeMap<i32, WorkerRecord>,
    worker_age: u64,
    num_workers: u32,
    master_pid: Pid,
    inherited_master_pid: Option<Pid>,
    signaler: Signaler,
    pidfile: Pidfile,
}

impl Arbiter {
    pub fn new(config: Config, app: Application) -> nix::Result<Self> {
        Ok(Arbiter {
            num_workers: config.workers,
            pidfile: Pidfile::new(config.pid_file.clone()),
            listeners: Vec::new(),
            workers: BTreeMap::new(),
            worker_age: 0,
            master_pid: Pid::this(),
            inherited_master_pid: None,
            signaler: Signaler::init()?,
            config,
            app,
        })
    }

    pub fn start(&mut self) -> Result<()> {
        self.master_pid = Pid::this();
        if let Ok(raw) = std::env::var("TUNICORN_PID") {
            if let Ok(pid) = raw.parse::<i32>() {
                self.inherited_master_pid = Some(Pid::from_raw(pid));
                info!(prior_master = pid, "running as re-exec replacement");
            }
        }
        self.pidfile.create(Pid::this())?;

        if let Ok(raw) = std::env::var("TUNICORN_FD") {
            self.listeners = inherit_listeners(&raw)?;
        } else {
            self.listeners = listener::create_sockets(&self.config)?;
        }

        for l in &self.listeners {
            info!(addr = %l, "listening");
        }
        info!(flavor = ?self.config.worker_class, workers = self.num_workers, "arbiter starting");
        Ok(())
    }

    /// Terminating escapes: a `ShutdownGraceful`/`ShutdownImmediate`
    /// result → `halt(0)`; a propagated `SupervisorError::Halt` (from
    /// `reap_workers` on worker boot or app-load failure) →
    /// `halt(reason, exit_status)`; any other error → log, non-graceful
    /// `stop`, exit `-1`.
    pub fn run(&mut self) -> i32 {
        if let Err(e) = self.manage_workers() {
            error!(error = %e, "manage_workers failed during startup");
        }
        loop {
            let outcome = match self.signaler.pop_signal() {
                Some(sig) => self.dispatch(sig),
                None => {
                    self.signaler.sleep(MURDER_TICK);
                    self.murder_workers();
                    self.manage_workers().map(|_| HandlerResult::Continue)
                }
            };
            self.signaler.wake();
            match outcome {
                Ok(HandlerResult::Continue) => continue,
                Ok(HandlerResult::ShutdownGraceful) => {
                    self.stop(true);
                    let _ = self.halt("shutting down", 0);
                    return 0;
                }
                Ok(HandlerResult::ShutdownImmediate) => {
                    self.stop(false);
                    let _ = self.halt("shutting down", 0);
                    return 0;
                }
                Err(SupervisorError::Halt { reason, exit_status }) => {
                    let _ = self.halt(&reason, exit_status);
                    return exit_status;
                }
                Err(e) => {
                    error!(error = %e, "unexpected error in control loop");
                    self.stop(false);
                    return -1;
                }
            }
        }
    }

    fn dispatch(&mut self, raw: i32) -> Result<HandlerResult> {
        let Some(name) = signaler::handler_name(raw) else {
            warn!(raw, "unrecognized signal, dropping");
            return Ok(HandlerResult::Continue);
        };
        Ok(match name {
            "hup" => self.handle_hup(),
            "quit" => HandlerResult::ShutdownImmediate,
            "int" => HandlerResult::ShutdownImmediate,
            "term" => HandlerResult::ShutdownGraceful,
            "ttin" => self.handle_ttin(),
            "ttou" => self.handle_ttou(),
            "usr1" => self.handle_usr1(),
            "usr2" => self.handle_usr2(),
            "winch" => self.handle_winch(),
            "chld" => return self.handle_chld(),
            other => {
                warn!(signal = other, "no handle_{other} implemented, dropping");
                HandlerResult::Continue
            }
        })
    }

    fn handle_hup(&mut self) -> HandlerResult {
        info!("HUP received; reload is a documented stub");
        HandlerResult::Continue
    }

    fn handle_ttin(&mut self) -> HandlerResult {
        self.num_workers += 1;
        if let Err(e) = self.manage_workers() {
            error!(error = %e, "manage_workers failed after TTIN");
        }
        HandlerResult::Continue
    }

    fn handle_ttou(&mut self) -> HandlerResult {
        if self.num_workers > 1 {
            self.num_workers -= 1;
            if let Err(e) = self.manage_workers() {
                error!(error = %e, "manage_workers failed after TTOU");
            }
        }
        HandlerResult::Continue
    }

    fn handle_usr1(&mut self) -> HandlerResult {
        for pid in self.workers.keys() {
            let _ = kill(Pid::from_raw(*pid), Signal::SIGUSR1);
        }
        HandlerResult::Continue
    }

    fn handle_usr2(&mut self) -> HandlerResult {
        warn!("USR2 (re-exec) is a documented stub; ignoring");
        HandlerResult::Continue
    }

    fn handle_winch(&mut self) -> HandlerResult {
        HandlerResult::Continue
    }

    fn handle_chld(&mut self) -> Result<HandlerResult> {
        self.reap_workers()?;
        Ok(HandlerResult::Continue)
    }

    fn manage_workers(&mut self) -> Result<()> {
        let before = self.workers.len();
        if (self.workers.len() as u32) < self.num_workers {
            self.spawn_workers()?;
        }
        // Actual removal from `self.workers` happens later, on reap; the
        // excess count must be computed once up front rather than
        // re-read from `self.workers.len()` each iteration, or every
        // worker (not just the oldest excess) would be sent SIGTERM.
        let excess = (self.workers.len() as u32).saturating_sub(self.num_workers);
        if excess > 0 {
            let mut by_age: Vec<i32> = self.workers.keys().copied().collect();
            by_age.sort_by_key(|pid| self.workers[pid].age);
            for pid in by_age.into_iter().take(excess as usize) {
                let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
            }
        }
        if self.workers.len() != before {
            info!(active = self.workers.len(), target = self.num_workers, "worker count changed");
        }
        Ok(())
    }

    fn spawn_workers(&mut self) -> Result<()> {
        let to_spawn = self.num_workers.saturating_sub(self.workers.len() as u32);
        for _ in 0..to_spawn {
            self.spawn_worker()?;
            let jitter = rand::random::<f64>() * 0.1;
            std::thread::sleep(Duration::from_secs_f64(jitter));
        }
        Ok(())
    }

    fn spawn_worker(&mut self) -> Result<()> {
        self.worker_age += 1;
        let age = self.worker_age;

        let heartbeat = Arc::new(WorkerHeartbeat::new()?);
        let mut child_listeners = Vec::with_capacity(self.listeners.len());
        for l in &self.listeners {
            let dup = listener::dup_for_child(l).map_err(|e| SupervisorError::Fork(e.to_string()))?;
            child_listeners.push(match l {
                Listener::Tcp(_) => unsafe { Listener::from_inherited_tcp(dup) },
                Listener::Unix(_, path, _) => unsafe { Listener::from_inherited_unix(dup, path.clone()) },
            });
        }

        let ctx = WorkerContext {
            age,
            master_pid: self.master_pid,
            listeners: child_listeners,
            app: self.app.clone(),
            timeout: Duration::from_secs(self.config.timeout_secs) / 2,
            graceful_timeout: Duration::from_secs(self.config.graceful_timeout_secs),
            worker_connections: self.config.worker_connections,
            heartbeat: Arc::clone(&heartbeat),
            uid: self.config.uid,
            gid: self.config.gid,
            initgroups: self.config.initgroups,
            env: self.config.env.clone(),
            chdir: self.config.chdir.clone(),
            alive: Arc::new(AtomicBool::new(true)),
            booted: Arc::new(AtomicBool::new(false)),
        };
        let flavor = self.config.worker_class;
        let booted = Arc::clone(&ctx.booted);

        match fork().map_err(|_| SupervisorError::Fork("fork() failed".to_string()))? {
            Fork::Parent(pid) => {
                info!(pid, age, "spawned worker");
                self.workers.insert(
                    pid,
                    WorkerRecord {
                        age,
                        pid: Pid::from_raw(pid),
                        flavor,
                        aborted: false,
                        heartbeat,
                    },
                );
                Ok(())
            }
            Fork::Child => {
                let exit_code = run_child(flavor, ctx, &booted);
                std::process::exit(exit_code);
            }
        }
    }

    /// Loops until `waitpid` has no more harvestable child; `ECHILD`
    /// just means no children remain, not an error.
    fn reap_workers(&mut self) -> Result<()> {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => self.handle_wait_status(status)?,
                Err(nix::errno::Errno::ECHILD) => break,
                Err(_) => break,
            }
        }
        Ok(())
    }

    fn handle_wait_status(&mut self, status: WaitStatus) -> Result<()> {
        let (pid, exit_code) = match status {
            WaitStatus::Exited(pid, code) => (pid.as_raw(), code),
            WaitStatus::Signaled(pid, _, _) => (pid.as_raw(), -1),
            _ => return Ok(()),
        };

        if exit_code == WORKER_BOOT_ERROR {
            return Err(SupervisorError::halt("Worker failed to boot", WORKER_BOOT_ERROR));
        }
        if exit_code == APP_LOAD_ERROR {
            return Err(SupervisorError::halt("App failed to load", APP_LOAD_ERROR));
        }
        self.workers.remove(&pid);
        Ok(())
    }

    fn murder_workers(&mut self) {
        if self.config.timeout_secs == 0 {
            return;
        }
        let timeout = Duration::from_secs(self.config.timeout_secs);
        for (pid, record) in self.workers.iter_mut() {
            let last_update = match record.heartbeat.last_update() {
                Ok(t) => t,
                Err(e) => {
                    warn!(pid, error = %e, "failed to read heartbeat, skipping");
                    continue;
                }
            };
            let stale = last_update.elapsed().unwrap_or_default() > timeout;
            if !stale {
                continue;
            }
            if record.aborted {
                error!(pid, "worker still stuck after SIGABRT, sending SIGKILL");
                let _ = kill(Pid::from_raw(*pid), Signal::SIGKILL);
            } else {
                error!(pid, "worker heartbeat stale, aborting");
                record.aborted = true;
                let _ = kill(Pid::from_raw(*pid), Signal::SIGABRT);
            }
        }
    }

    fn stop(&mut self, graceful: bool) {
        if self.inherited_master_pid.is_none() {
            self.listeners.clear();
        }
        let signal = if graceful { Signal::SIGTERM } else { Signal::SIGQUIT };
        for pid in self.workers.keys() {
            let _ = kill(Pid::from_raw(*pid), signal);
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.graceful_timeout_secs);
        while !self.workers.is_empty() && Instant::now() < deadline {
            std::thread::sleep(STOP_POLL_INTERVAL);
            let _ = self.reap_workers();
        }
        for pid in self.workers.keys() {
            let _ = kill(Pid::from_raw(*pid), Signal::SIGKILL);
        }
        let _ = self.reap_workers();
    }

    fn halt(&mut self, reason: &str, exit_status: i32) -> Result<()> {
        self.stop(true);
        info!(reason, exit_status, "master halting");
        self.pidfile.unlink();
        Ok(())
    }

    /// Documented stub; reload is not implemented.
    pub fn reload(&mut self) -> Result<()> {
        Ok(())
    }

    /// Documented stub; re-exec is not implemented.
    pub fn reexec(&mut self) -> Result<()> {
        warn!("reexec is not implemented");
        Ok(())
    }
}

fn run_child(flavor: crate::config::WorkerClass, ctx: WorkerContext, booted: &Arc<AtomicBool>) -> i32 {
    let pid = nix::unistd::getpid();
    info!(pid = pid.as_raw(), "worker process starting");
    let heartbeat = Arc::clone(&ctx.heartbeat);
    let signaler = match Signaler::init() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "worker failed to re-init signals");
            drop(heartbeat);
            return -1;
        }
    };
    let mut worker = worker::spawn_flavor(flavor, ctx, signaler);
    let result = worker.init_process();
    drop(heartbeat);
    match result {
        Ok(()) => 0,
        Err(SupervisorError::AppImport(_)) => APP_LOAD_ERROR,
        Err(_) if !booted.load(Ordering::SeqCst) => WORKER_BOOT_ERROR,
        Err(e) => {
            error!(error = %e, "worker exiting on error");
            -1
        }
    }
}

fn inherit_listeners(raw: &str) -> Result<Vec<Listener>> {
    let mut out = Vec::new();
    for fd_str in raw.split(',').filter(|s| !s.is_empty()) {
        let fd: i32 = fd_str
            .parse()
            .map_err(|_| SupervisorError::Fork(format!("invalid TUNICORN_FD entry {fd_str:?}")))?;
        out.push(unsafe { Listener::from_inherited_tcp(fd) });
    }
    Ok(out)
}
