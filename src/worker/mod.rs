//! `Worker`: the child-side contract every worker flavor implements,
//! plus the master-side [`WorkerRecord`] bookkeeping and the flavor
//! registry — a tagged variant/factory table in place of class
//! inheritance.

pub mod cooperative;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::unistd::Pid;
use tracing::{info, warn};

use crate::app::Application;
use crate::config::WorkerClass;
use crate::error::Result;
use crate::heartbeat::WorkerHeartbeat;
use crate::listener::Listener;
use crate::posix;
use crate::signaler::Signaler;

/// Everything a freshly-forked child needs to become a running worker.
/// Built by the arbiter before fork and moved into the child.
pub struct WorkerContext {
    pub age: u64,
    pub master_pid: Pid,
    pub listeners: Vec<Listener>,
    pub app: Application,
    pub timeout: Duration,
    pub graceful_timeout: Duration,
    pub worker_connections: usize,
    pub heartbeat: Arc<WorkerHeartbeat>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub initgroups: bool,
    pub env: BTreeMap<String, String>,
    pub chdir: Option<PathBuf>,
    pub alive: Arc<AtomicBool>,
    pub booted: Arc<AtomicBool>,
}

/// The child-side contract. One implementation per worker flavor; only
/// the cooperative-task flavor is built in.
pub trait Worker {
    /// Apply env overrides, switch uid/gid, reseed, install signals, mark
    /// booted, then run. The default implementation fixes this ordering;
    /// flavors only need to implement [`Worker::run`].
    fn init_process(&mut self) -> Result<()> {
        let ctx = self.context();
        for (k, v) in &ctx.env {
            std::env::set_var(k, v);
        }
        if let Some(dir) = &ctx.chdir {
            std::env::set_current_dir(dir)?;
        }
        posix::set_owner_process(ctx.uid, ctx.gid, ctx.initgroups)
            .map_err(|e| crate::error::SupervisorError::Fork(e.to_string()))?;
        posix::reseed();
        self.init_signals();
        self.context().booted.store(true, Ordering::SeqCst);
        self.run()
    }

    /// Re-install signal handlers in the post-fork child; the parent's
    /// self-pipe and registrations are not valid here.
    fn init_signals(&mut self);

    /// Resolve `sig` to `handle_<name>` and invoke it; unmapped signals
    /// are logged and dropped.
    fn signal(&mut self, raw: i32) {
        match crate::signaler::handler_name(raw) {
            Some("term") | Some("int") => handle_exit(self.context()),
            Some("quit") => handle_quit(self.context()),
            Some("abort") => handle_abort(self.context()),
            Some("usr1") => { /* reopen-logs convention: no-op here */ }
            Some(other) => {
                info!(signal = other, "worker: no handler, ignoring");
            }
            None => warn!(raw, "worker: unrecognized signal"),
        }
    }

    /// The concrete flavor's accept/dispatch loop.
    fn run(&mut self) -> Result<()>;

    /// Must be called at least once every `timeout` — the sole liveness
    /// contract the master's murder policy relies on.
    fn notify(&self) -> std::io::Result<()> {
        self.context().heartbeat.notify()
    }

    fn context(&self) -> &WorkerContext;
}

/// Sets `alive = false`. Used by `SIGTERM`/`SIGINT` in the child.
pub fn handle_exit(ctx: &WorkerContext) {
    ctx.alive.store(false, Ordering::SeqCst);
}

/// Sets `alive = false`, sleeps briefly to let an in-flight accept settle,
/// then exits 0.
pub fn handle_quit(ctx: &WorkerContext) {
    ctx.alive.store(false, Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(100));
    std::process::exit(0);
}

/// Sets `alive = false` and exits 1. Invoked on `SIGABRT` from the
/// master's murder policy.
pub fn handle_abort(ctx: &WorkerContext) {
    ctx.alive.store(false, Ordering::SeqCst);
    std::process::exit(1);
}

/// Master-side bookkeeping for one live worker.
pub struct WorkerRecord {
    pub age: u64,
    pub pid: Pid,
    pub flavor: WorkerClass,
    pub aborted: bool,
    pub heartbeat: Arc<WorkerHeartbeat>,
}

/// Construct the concrete flavor named by `class`, handing it ownership
/// of `signaler` so it can drain and dispatch its own signal queue.
pub fn spawn_flavor(class: WorkerClass, ctx: WorkerContext, signaler: Signaler) -> Box<dyn Worker> {
    match class {
        WorkerClass::Cooperative => Box::new(cooperative::CoopWorker::new(ctx, signaler)),
    }
}
