//! `PosixUtil`: small POSIX primitives shared by the listener, signaler,
//! and worker modules — non-blocking/close-on-exec flag mutation,
//! user/group switching, and RNG reseeding after fork. Ported from the
//! original `tunicorn/util.py` (`set_non_blocking`, `close_on_exec`,
//! `set_owner_process`, `seed`), using `nix` in place of raw `fcntl`
//! calls the way the corpus's POSIX-facing crates do (see
//! `DerickEddington-signals_receipts` and the `nix`-based process
//! helpers in `nvidia_gpu_stats`/`gpu_stats`).

use std::os::unix::io::AsRawFd;

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::unistd::{self, Gid, Uid};

/// Mark `fd` non-blocking (`O_NONBLOCK`).
pub fn set_non_blocking<Fd: AsRawFd>(fd: &Fd) -> nix::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = OFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFL)?);
    fcntl(raw, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Mark `fd` close-on-exec (`FD_CLOEXEC`).
pub fn set_close_on_exec<Fd: AsRawFd>(fd: &Fd) -> nix::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = FdFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFD)?);
    fcntl(raw, FcntlArg::F_SETFD(flags | FdFlag::FD_CLOEXEC))?;
    Ok(())
}

/// Switch the calling process's uid/gid, optionally loading supplementary
/// groups for the target user. Ported from `set_owner_process`: group is
/// switched before user (a uid switch to non-root forecloses further
/// privilege changes).
pub fn set_owner_process(
    uid: Option<u32>,
    gid: Option<u32>,
    initgroups: bool,
) -> nix::Result<()> {
    if let Some(gid) = gid {
        if initgroups {
            if let (Some(uid), Ok(name)) = (uid, username_for_uid(uid)) {
                unistd::initgroups(&std::ffi::CString::new(name).unwrap(), Gid::from_raw(gid))?;
            }
        }
        unistd::setgid(Gid::from_raw(gid))?;
    }
    if let Some(uid) = uid {
        unistd::setuid(Uid::from_raw(uid))?;
    }
    Ok(())
}

fn username_for_uid(uid: u32) -> Result<String, ()> {
    nix::unistd::User::from_uid(Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|u| u.name)
        .ok_or(())
}

/// Reseed the process-local RNG after fork, the way `util.seed()` reseeds
/// Python's `random` module from `os.urandom`. `rand`'s thread-local RNG
/// already reseeds itself from the OS per-thread on first use post-fork,
/// but we touch it explicitly here so a worker's very first jittered
/// sleep isn't correlated with its siblings.
pub fn reseed() {
    use rand::RngCore;
    let mut discard = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut discard);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn nonblocking_roundtrip() {
        let (a, _b) = UnixStream::pair().unwrap();
        set_non_blocking(&a).unwrap();
        let raw = a.as_raw_fd();
        let flags = fcntl(raw, FcntlArg::F_GETFL).unwrap();
        assert!(OFlag::from_bits_truncate(flags).contains(OFlag::O_NONBLOCK));
    }

    #[test]
    fn cloexec_roundtrip() {
        let (a, _b) = UnixStream::pair().unwrap();
        set_close_on_exec(&a).unwrap();
        let raw = a.as_raw_fd();
        let flags = fcntl(raw, FcntlArg::F_GETFD).unwrap();
        assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
    }
}
