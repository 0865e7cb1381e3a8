use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Filesystem lock recording the pid of the one process holding a given role.
/// The exclusive `create` is the only cross-process mutex in the wrapper.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

/// Result of a `read`: the live pid (if any) plus whether a stale entry was
/// repaired, so callers and tests can observe the repair separately from the
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    pub pid: Option<i32>,
    pub repaired: bool,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the recorded pid, validating liveness. A garbled first line or a
    /// dead pid is repaired by deleting the file: every reader doubles as the
    /// garbage collector for stale locks left behind by a crashed owner.
    pub fn read(&self) -> io::Result<ReadOutcome> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(ReadOutcome { pid: None, repaired: false });
            }
            Err(e) => return Err(e),
        };
        let pid = raw
            .lines()
            .next()
            .unwrap_or("")
            .trim()
            .parse::<i32>()
            .ok()
            .filter(|p| *p > 0);
        match pid {
            Some(p) if process_alive(Pid::from_raw(p)) => Ok(ReadOutcome {
                pid: Some(p),
                repaired: false,
            }),
            _ => {
                self.delete()?;
                Ok(ReadOutcome { pid: None, repaired: true })
            }
        }
    }

    /// Exclusive create-if-absent: returns true if this caller won the
    /// instance slot, false if the file already exists. Existing content is
    /// never touched. Callers should `read` first so a stale file gets
    /// repaired before the retry.
    pub fn create(&self, pid: i32) -> io::Result<bool> {
        let mut f = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e),
        };
        f.write_all(format!("{pid}\n").as_bytes())?;
        Ok(true)
    }

    /// Best-effort remove; an absent file is not an error.
    pub fn delete(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Signal-0 liveness probe. EPERM means the process exists but belongs to
/// someone else, which still counts as alive.
pub(crate) fn process_alive(pid: Pid) -> bool {
    match kill(pid, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
