//! The one built-in worker flavor: a single-threaded cooperative
//! scheduler accepting connections across every inherited listener,
//! bounded by a connection-count semaphore.
//!
//! The original cooperates with gevent's hub; `tokio`'s current-thread
//! runtime is the idiomatic Rust analogue — a single OS thread running a
//! user-space scheduler, reinitialized post-fork the same way gevent's
//! hub is "patched" and recreated in the child.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener as TokioTcpListener, UnixListener as TokioUnixListener};
use tokio::runtime::Builder;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::listener::Listener;
use crate::signaler::Signaler;
use crate::worker::{Worker, WorkerContext};

pub struct CoopWorker {
    ctx: WorkerContext,
    signaler: Option<Signaler>,
}

impl CoopWorker {
    pub fn new(ctx: WorkerContext, signaler: Signaler) -> Self {
        CoopWorker {
            ctx,
            signaler: Some(signaler),
        }
    }
}

impl Worker for CoopWorker {
    fn init_signals(&mut self) {
        // Re-registration happens via `Signaler::init()` called by the
        // arbiter's child path before `init_process`; the cooperative
        // flavor's only extra responsibility is recreating its hub,
        // which `run()` does by building a fresh runtime.
    }

    fn run(&mut self) -> Result<()> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| crate::error::SupervisorError::Fork(e.to_string()))?;
        runtime.block_on(self.serve())
    }

    fn context(&self) -> &WorkerContext {
        &self.ctx
    }
}

impl CoopWorker {
    async fn serve(&mut self) -> Result<()> {
        let permits = self.ctx.listeners.len().max(1) * self.ctx.worker_connections;
        let pool = Arc::new(Semaphore::new(permits));

        let mut tasks = Vec::new();
        for listener in self.ctx.listeners.drain(..) {
            let pool = Arc::clone(&pool);
            let alive = Arc::clone(&self.ctx.alive);
            tasks.push(tokio::spawn(accept_loop(listener, pool, alive)));
        }

        // The self-pipe read is a blocking `poll(2)`, so it is drained on
        // a dedicated blocking task rather than the reactor thread; popped
        // signal numbers cross over a channel to be dispatched on `self`.
        let signaler = self.signaler.take().expect("signaler consumed exactly once");
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || loop {
            match signaler.pop_signal() {
                Some(raw) => {
                    if tx.send(raw).is_err() {
                        break;
                    }
                }
                None => signaler.sleep(Duration::from_millis(500)),
            }
        });

        while self.ctx.alive.load(Ordering::SeqCst) {
            if let Err(e) = self.notify() {
                warn!(error = %e, "failed to update heartbeat");
            }
            while let Ok(raw) = rx.try_recv() {
                self.signal(raw);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        info!("worker shutting down, draining connections");
        let deadline = Instant::now() + self.ctx.graceful_timeout;
        while Instant::now() < deadline {
            if pool.available_permits() == permits {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        for task in tasks {
            task.abort();
        }
        Ok(())
    }
}

async fn accept_loop(listener: Listener, pool: Arc<Semaphore>, alive: Arc<std::sync::atomic::AtomicBool>) {
    match listener {
        Listener::Tcp(std_listener) => {
            let Ok(tokio_listener) = TokioTcpListener::from_std(std_listener) else {
                error!("failed to adopt inherited TCP listener into the runtime");
                return;
            };
            loop {
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(permit) = pool.clone().try_acquire_owned() else {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                };
                match tokio_listener.accept().await {
                    Ok((stream, _addr)) => {
                        tokio::spawn(async move {
                            handle_connection(stream).await;
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        debug!(error = %e, "accept failed");
                    }
                }
            }
        }
        Listener::Unix(std_listener, _path, _) => {
            let Ok(tokio_listener) = TokioUnixListener::from_std(std_listener) else {
                error!("failed to adopt inherited Unix listener into the runtime");
                return;
            };
            loop {
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(permit) = pool.clone().try_acquire_owned() else {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                };
                match tokio_listener.accept().await {
                    Ok((stream, _addr)) => {
                        tokio::spawn(async move {
                            handle_unix_connection(stream).await;
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        debug!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
}

async fn handle_connection(mut stream: tokio::net::TcpStream) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut buf = [0u8; 4096];
    if let Ok(n) = stream.read(&mut buf).await {
        if n > 0 {
            let _ = stream.write_all(&buf[..n]).await;
        }
    }
}

async fn handle_unix_connection(mut stream: tokio::net::UnixStream) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut buf = [0u8; 4096];
    if let Ok(n) = stream.read(&mut buf).await {
        if n > 0 {
            let _ = stream.write_all(&buf[..n]).await;
        }
    }
}
