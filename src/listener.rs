//! Listening sockets: binding from [`Endpoint`](crate::config::Endpoint)
//! descriptors, retrying past transient bind failures, and re-wrapping
//! inherited file descriptors across a fork without rebinding.
//!
//! Grounded in `launcher.rs`'s pre-fork socket handling (this repo's
//! only existing precedent for a process that owns a listening fd
//! across a child boundary), generalized here from "one socket, one
//! child" to "N sockets, N workers".

use std::fs;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::net::{TcpListener as StdTcpListener, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{Config, Endpoint};
use crate::error::{Result, SupervisorError};
use crate::posix;

const BIND_RETRIES: u32 = 5;
const BIND_RETRY_DELAY: Duration = Duration::from_secs(1);

/// One bound, listening socket, abstracting over TCP and Unix transports.
///
/// The Unix variant's `owns_path` flag controls whether `Drop` unlinks the
/// socket path: `true` for the master's own bound listener, `false` for the
/// duplicated fd handed to a forked child — only the master's copy is
/// responsible for filesystem cleanup. Without this a worker's copy,
/// dropped in the parent right after `fork()` returns, would unlink the
/// path out from under the still-listening master.
pub enum Listener {
    Tcp(StdTcpListener),
    Unix(StdUnixListener, std::path::PathBuf, bool),
}

impl Listener {
    pub fn raw_fd(&self) -> RawFd {
        match self {
            Listener::Tcp(l) => l.as_raw_fd(),
            Listener::Unix(l, _, _) => l.as_raw_fd(),
        }
    }

    /// Re-wrap an inherited fd without touching the network stack again.
    /// Used by a freshly-forked worker to pick up the master's sockets.
    ///
    /// # Safety
    /// `fd` must be a valid, open listening socket fd owned by the
    /// caller (the standard contract of `FromRawFd`).
    pub unsafe fn from_inherited_tcp(fd: RawFd) -> Self {
        Listener::Tcp(StdTcpListener::from_raw_fd(fd))
    }

    pub unsafe fn from_inherited_unix(fd: RawFd, path: std::path::PathBuf) -> Self {
        Listener::Unix(StdUnixListener::from_raw_fd(fd), path, false)
    }
}

impl std::fmt::Display for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Listener::Tcp(l) => write!(f, "{}", l.local_addr().map(|a| a.to_string()).unwrap_or_default()),
            Listener::Unix(_, path, _) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Bind every configured endpoint, retrying transient failures up to
/// [`BIND_RETRIES`] times with a fixed delay, ported from the
/// original's `create_sockets` loop.
pub fn create_sockets(config: &Config) -> Result<Vec<Listener>> {
    let previous = apply_umask(config.umask);
    let result = (|| {
        let mut listeners = Vec::with_capacity(config.listeners.len());
        for endpoint in &config.listeners {
            listeners.push(bind_with_retry(endpoint, config)?);
        }
        Ok(listeners)
    })();
    apply_umask(previous.bits() as u32);
    result
}

fn apply_umask(mask: u32) -> nix::sys::stat::Mode {
    use nix::sys::stat::{umask, Mode};
    umask(Mode::from_bits_truncate(mask))
}

fn bind_with_retry(endpoint: &Endpoint, config: &Config) -> Result<Listener> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match bind_one(endpoint, config) {
            Ok(listener) => {
                info!(addr = %endpoint, "listening");
                return Ok(listener);
            }
            Err(err) if attempt < BIND_RETRIES && is_retryable(&err) => {
                warn!(addr = %endpoint, attempt, "bind failed, retrying: {err}");
                std::thread::sleep(BIND_RETRY_DELAY);
            }
            Err(err) => {
                return Err(SupervisorError::Bind {
                    addr: endpoint.to_string(),
                    source: err,
                })
            }
        }
    }
}

fn is_retryable(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::AddrInUse | std::io::ErrorKind::AddrNotAvailable
    )
}

fn bind_one(endpoint: &Endpoint, config: &Config) -> std::io::Result<Listener> {
    match endpoint {
        Endpoint::Tcp { host, port } | Endpoint::Tcp6 { host, port } => {
            let addr = format!("{host}:{port}")
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no address"))?;
            let socket = socket2::Socket::new(
                socket2::Domain::for_address(addr),
                socket2::Type::STREAM,
                None,
            )?;
            socket.set_reuse_address(true)?;
            #[cfg(unix)]
            socket.set_reuse_port(true)?;
            socket.set_nodelay(true)?;
            socket.bind(&addr.into())?;
            socket.listen(config.backlog)?;
            socket.set_nonblocking(true)?;
            let std_listener: StdTcpListener = socket.into();
            posix::set_close_on_exec(&std_listener).ok();
            Ok(Listener::Tcp(std_listener))
        }
        Endpoint::Unix { path } => bind_unix(path, config),
    }
}

fn bind_unix(path: &Path, config: &Config) -> std::io::Result<Listener> {
    if path.exists() {
        let meta = fs::symlink_metadata(path)?;
        if !is_socket(&meta) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{path:?} exists and is not a socket"),
            ));
        }
        fs::remove_file(path)?;
    }
    let listener = StdUnixListener::bind(path)?;
    listener.set_nonblocking(true)?;
    posix::set_close_on_exec(&listener).ok();
    if config.uid.is_some() || config.gid.is_some() {
        let uid = config.uid.map(nix::unistd::Uid::from_raw);
        let gid = config.gid.map(nix::unistd::Gid::from_raw);
        nix::unistd::chown(path, uid, gid).map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    }
    Ok(Listener::Unix(listener, path.to_path_buf(), true))
}

#[cfg(unix)]
fn is_socket(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    meta.file_type().is_socket()
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix(_, path, owns_path) = self {
            if *owns_path {
                let _ = fs::remove_file(path);
            }
        }
    }
}

/// Serialize the raw fds of a listener set for the `TUNICORN_FD`
/// environment variable a forked child inherits: a comma-separated
/// list of fd numbers, in bind order.
pub fn encode_fds(listeners: &[Listener]) -> String {
    listeners
        .iter()
        .map(|l| l.raw_fd().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Leak a listener's underlying fd across an impending fork so the
/// standard `Drop` impl (which would close it / unlink the socket path)
/// doesn't run in the parent after spawning children. Workers hold their
/// own clone via [`Listener::from_inherited_tcp`]/[`from_inherited_unix`].
pub fn dup_for_child(listener: &Listener) -> nix::Result<RawFd> {
    let raw = listener.raw_fd();
    let dup = nix::unistd::dup(raw)?;
    Ok(dup.into_raw_fd())
}
