//! `Pidfile`: an optional collaborator that records the master's pid on
//! disk and removes it on a clean halt — resolving the original's
//! "referenced but never constructed `self.pidfile`" gap by making it a
//! concrete, always-constructible type that happens to be a no-op when
//! unconfigured.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;

pub struct Pidfile {
    path: Option<PathBuf>,
}

impl Pidfile {
    pub fn new(path: Option<PathBuf>) -> Self {
        Pidfile { path }
    }

    /// Write the given pid to the configured path, if any. Refuses to
    /// overwrite a stale pidfile pointing at a still-running process
    /// other than ourselves.
    pub fn create(&self, pid: Pid) -> io::Result<()> {
        let Some(path) = &self.path else { return Ok(()) };
        if let Some(existing) = Self::read(path)? {
            if existing != pid && process_alive(existing) {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("pidfile {path:?} already belongs to a live process ({existing})"),
                ));
            }
        }
        fs::write(path, format!("{pid}\n"))
    }

    pub fn unlink(&self) {
        if let Some(path) = &self.path {
            let _ = fs::remove_file(path);
        }
    }

    fn read(path: &Path) -> io::Result<Option<Pid>> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(contents.trim().parse::<i32>().ok().map(Pid::from_raw)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn process_alive(pid: Pid) -> bool {
    nix::sys::signal::kill(pid, None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_pidfile_is_a_no_op() {
        let pf = Pidfile::new(None);
        assert!(pf.create(Pid::this()).is_ok());
        pf.unlink();
    }

    #[test]
    fn writes_and_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunicorn.pid");
        let pf = Pidfile::new(Some(path.clone()));
        pf.create(Pid::this()).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap().trim(),
            Pid::this().to_string()
        );
        pf.unlink();
        assert!(!path.exists());
    }
}
