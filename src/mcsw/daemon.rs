use crate::mcsw::pidfile::{process_alive, PidFile};
use anyhow::Context as _;
use chrono::Local;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{fork, setsid, ForkResult, Pid};
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::time::Duration;

/// Timestamped event line on stderr, shared by the whole wrapper.
pub(crate) fn mc_event(component: &str, msg: impl AsRef<str>) {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    eprintln!("{ts} [{component}] {}", msg.as_ref());
}

/// Turns the calling process into a detached background service guarded by a
/// pid file, and implements the client-side stop for a running daemon.
#[derive(Debug)]
pub struct Daemon {
    pidfile: PidFile,
    stop_timeout_secs: u64,
}

impl Daemon {
    pub fn new(pidfile: PidFile, stop_timeout_secs: u64) -> Self {
        Self {
            pidfile,
            stop_timeout_secs,
        }
    }

    /// Double fork with `setsid` in between: the first fork frees the
    /// invoking shell, the session leader detaches from the controlling
    /// terminal, and the second fork ensures the survivor can never reacquire
    /// one. Intermediate parents `_exit` without cleanup. Returns whether the
    /// exclusive pid-file create won the instance slot. A fork failure is
    /// fatal; there is no recovery path.
    fn daemonize(&self) -> anyhow::Result<bool> {
        match unsafe { fork() }.context("first fork")? {
            ForkResult::Parent { .. } => unsafe { libc::_exit(0) },
            ForkResult::Child => {}
        }
        setsid().context("setsid")?;
        match unsafe { fork() }.context("second fork")? {
            ForkResult::Parent { .. } => unsafe { libc::_exit(0) },
            ForkResult::Child => {}
        }
        close_inherited_fds();
        Ok(self.pidfile.create(std::process::id() as i32)?)
    }

    /// Idempotent start: if the pid file already names a live daemon, report
    /// it and do nothing. Otherwise detach and run `action`; the pid file is
    /// deleted when `action` returns, including signal-driven returns.
    pub fn start<F>(&self, action: F) -> anyhow::Result<()>
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        let read = self.pidfile.read()?;
        if read.repaired {
            mc_event(
                "daemon",
                format!(
                    "attempt=start outcome=stale_pidfile_repaired pidfile={}",
                    self.pidfile.path().display()
                ),
            );
        }
        if let Some(pid) = read.pid {
            mc_event(
                "daemon",
                format!(
                    "attempt=start outcome=already_running pid={pid} pidfile={}",
                    self.pidfile.path().display()
                ),
            );
            return Ok(());
        }
        if !self.daemonize()? {
            // Detached already, but a concurrent starter won the slot. The
            // pid file is theirs; exit without touching it.
            mc_event(
                "daemon",
                format!(
                    "attempt=start outcome=pidfile_locked pidfile={}",
                    self.pidfile.path().display()
                ),
            );
            std::process::exit(1);
        }
        let _guard = PidFileGuard(&self.pidfile);
        action()
    }

    /// Signal a running daemon and wait for it to exit: SIGTERM, liveness
    /// polled once per second up to the timeout, then SIGKILL. A target that
    /// disappears between read and signal is already stopped, not an error.
    pub fn stop(&self) -> anyhow::Result<()> {
        let read = self.pidfile.read()?;
        let Some(pid) = read.pid else {
            mc_event("daemon", "attempt=stop outcome=not_running");
            return Ok(());
        };
        let target = Pid::from_raw(pid);
        mc_event("daemon", format!("attempt=stop sig=SIGTERM pid={pid}"));
        match kill(target, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(e).with_context(|| format!("SIGTERM pid {pid}")),
        }
        for _ in 0..self.stop_timeout_secs {
            if !process_alive(target) {
                mc_event("daemon", format!("outcome=stopped pid={pid}"));
                return Ok(());
            }
            std::thread::sleep(Duration::from_secs(1));
        }
        mc_event(
            "daemon",
            format!(
                "outcome=term_timeout pid={pid} waited_s={} decision=kill",
                self.stop_timeout_secs
            ),
        );
        match kill(target, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("SIGKILL pid {pid}")),
        }
    }
}

/// Deletes the daemon's pid file when the run loop unwinds.
struct PidFileGuard<'a>(&'a PidFile);

impl Drop for PidFileGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.0.delete() {
            mc_event("daemon", format!("attempt=pidfile_delete outcome=error err={e}"));
        }
    }
}

/// Close everything above stderr; those descriptors were inherited from the
/// invoking environment and do not belong to the daemon.
fn close_inherited_fds() {
    let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let max = if max <= 0 { 1024 } else { max };
    for fd in 3..max as libc::c_int {
        unsafe {
            libc::close(fd);
        }
    }
}

/// Best-effort `READY=1` to systemd's notify socket; silently a no-op when
/// not running under systemd.
pub fn systemd_ready() {
    let Some(path) = std::env::var_os("NOTIFY_SOCKET") else {
        return;
    };
    let Ok(sock) = UnixDatagram::unbound() else {
        return;
    };
    let _ = sock.send_to(b"READY=1", Path::new(&path));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn stop_without_pidfile_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let d = Daemon::new(PidFile::new(dir.path().join("d.pid")), 2);
        d.stop().unwrap();
    }

    #[test]
    fn stop_with_stale_pidfile_self_heals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.pid");
        let mut child = Command::new("true").spawn().unwrap();
        let dead = child.id() as i32;
        child.wait().unwrap();
        let pf = PidFile::new(&path);
        assert!(pf.create(dead).unwrap());
        Daemon::new(pf, 2).stop().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn stop_terminates_a_live_target() {
        let dir = tempfile::tempdir().unwrap();
        let pf = PidFile::new(dir.path().join("d.pid"));
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id() as i32;
        assert!(pf.create(pid).unwrap());
        // Reap in the background so the dead child does not linger as a
        // zombie that still answers the liveness probe.
        let waiter = std::thread::spawn(move || child.wait());
        Daemon::new(pf, 5).stop().unwrap();
        waiter.join().unwrap().unwrap();
        assert!(!process_alive(Pid::from_raw(pid)));
    }
}
