use crate::mcsw::config::WrapperConfig;
use crate::mcsw::daemon::mc_event;
use crate::mcsw::error::{Result, WrapperError};
use crate::mcsw::pidfile::PidFile;
use crate::mcsw::properties::PropertiesFile;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Which escalation stage finally produced the server's exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStage {
    /// The in-band `stop` console command; the clean path that lets the
    /// server flush world state.
    StopCommand,
    Term,
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyStopped,
    Stopped { stage: StopStage },
}

/// Supervisor for the one managed server process. The in-memory handle is
/// authoritative for "do we own a child"; the pid file is the durable,
/// cross-instance record. Callers must serialize invocations; there is no
/// internal locking around handle mutation.
pub struct Minecraft {
    process: Option<Child>,
    stdout: Option<File>,
    stderr: Option<File>,
    pidfile: PidFile,
    cfg: WrapperConfig,
}

impl Minecraft {
    pub fn new(cfg: WrapperConfig) -> Self {
        let pidfile = PidFile::new(cfg.working_directory.join(&cfg.server_pidfile));
        Self {
            process: None,
            stdout: None,
            stderr: None,
            pidfile,
            cfg,
        }
    }

    /// Current server pid, or 0 when not running. Liveness is re-probed on
    /// every call; a child that exited asynchronously is reaped here and the
    /// handle, log sinks, and pid file are cleared (lazy reaping).
    pub fn pid(&mut self) -> u32 {
        let Some(child) = self.process.as_mut() else {
            return 0;
        };
        match child.try_wait() {
            Ok(None) => child.id(),
            Ok(Some(status)) => {
                mc_event("minecraft", format!("outcome=exited status={status}"));
                self.clear_handle();
                0
            }
            Err(e) => {
                mc_event("minecraft", format!("outcome=probe_error err={e}"));
                self.clear_handle();
                0
            }
        }
    }

    /// Start the server with the given heap size (e.g. `1024M`).
    ///
    /// Refused with `AlreadyOrphaned` when the pid file names a live process
    /// this handle does not own: some other wrapper instance is supervising
    /// the server, and a second child would corrupt the world files. The
    /// child pid is recorded through the exclusive pid-file create, so of two
    /// racing starts exactly one keeps its child.
    pub fn start(&mut self, ram: &str) -> Result<u32> {
        let pid = self.pid();
        if pid != 0 {
            return Err(WrapperError::AlreadyRunning { pid });
        }
        let read = self.pidfile.read()?;
        if read.repaired {
            mc_event(
                "minecraft",
                format!(
                    "attempt=start outcome=stale_pidfile_repaired pidfile={}",
                    self.pidfile.path().display()
                ),
            );
        }
        if let Some(foreign) = read.pid {
            return Err(WrapperError::AlreadyOrphaned {
                pidfile: self.pidfile.path().to_path_buf(),
                pid: foreign,
            });
        }

        let argv = self.resolve_command(ram)?;

        // Drop sinks from a previous run, then open fresh append-mode logs.
        // A log-open failure aborts before spawning; the wrapper never leaves
        // an unmonitored child behind.
        self.stdout = None;
        self.stderr = None;
        let stdout = open_append(&self.log_path("stdout"))?;
        let stderr = open_append(&self.log_path("stderr"))?;

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(&self.cfg.working_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(stdout.try_clone()?))
            .stderr(Stdio::from(stderr.try_clone()?));
        // Own process group: signals aimed at the wrapper must not reach the
        // server.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        mc_event("minecraft", format!("attempt=start argv={argv:?}"));
        let mut child = cmd.spawn()?;
        let child_pid = child.id();

        if !self.pidfile.create(child_pid as i32)? {
            // Lost the create race to a concurrent start. The winner owns the
            // slot; restore the single-child invariant before reporting.
            mc_event(
                "minecraft",
                format!("attempt=start outcome=pidfile_locked pid={child_pid} decision=kill_own_child"),
            );
            let _ = child.kill();
            let _ = child.wait();
            return Err(WrapperError::PidFileLocked {
                pidfile: self.pidfile.path().to_path_buf(),
            });
        }

        self.stdout = Some(stdout);
        self.stderr = Some(stderr);
        self.process = Some(child);
        mc_event("minecraft", format!("outcome=started pid={child_pid}"));
        Ok(child_pid)
    }

    /// Shut the server down with escalating force: the `stop` console
    /// command, then SIGTERM, then SIGKILL, each stage's timeout expiry
    /// triggering the next. The post-kill wait is unbounded; it is the
    /// backstop. Afterwards the handle and log sinks are cleared and the pid
    /// file deleted, regardless of which stage fired.
    pub fn stop(&mut self) -> Result<StopOutcome> {
        if self.pid() == 0 {
            mc_event("minecraft", "attempt=stop outcome=not_running");
            return Ok(StopOutcome::AlreadyStopped);
        }
        let stage = self.escalate();
        self.clear_handle();
        mc_event("minecraft", format!("outcome=stopped stage={stage:?}"));
        Ok(StopOutcome::Stopped { stage })
    }

    fn escalate(&mut self) -> StopStage {
        let Some(child) = self.process.as_mut() else {
            return StopStage::StopCommand;
        };
        let pid = Pid::from_raw(child.id() as i32);

        // Stage 1: polite console command. Stdin is closed after the write,
        // so servers that exit on EOF get a second way out.
        let polite = Duration::from_secs(self.cfg.stop_command_timeout_secs);
        mc_event(
            "minecraft",
            format!("attempt=stop_command timeout_ms={}", polite.as_millis()),
        );
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(b"stop\n").and_then(|_| stdin.flush());
        }
        if wait_with_deadline(child, polite) {
            return StopStage::StopCommand;
        }

        // Stage 2: graceful signal.
        let term = Duration::from_secs(self.cfg.term_timeout_secs);
        mc_event(
            "minecraft",
            format!("attempt=signal sig=SIGTERM pid={pid} timeout_ms={}", term.as_millis()),
        );
        let _ = kill(pid, Signal::SIGTERM);
        if wait_with_deadline(child, term) {
            return StopStage::Term;
        }

        // Stage 3: SIGKILL, then wait without a deadline. Kill is assumed
        // always eventually effective at the OS level.
        mc_event("minecraft", format!("attempt=signal sig=SIGKILL pid={pid}"));
        let _ = kill(pid, Signal::SIGKILL);
        let _ = child.wait();
        StopStage::Kill
    }

    /// Write a console command to the server's stdin. Fire-and-forget:
    /// at-most-once, unconfirmed delivery; an in-server error is invisible
    /// here.
    pub fn exec(&mut self, command: &str) -> Result<()> {
        if self.pid() == 0 {
            return Err(WrapperError::NotRunning);
        }
        let stdin = self
            .process
            .as_mut()
            .and_then(|c| c.stdin.as_mut())
            .ok_or(WrapperError::NotRunning)?;
        stdin.write_all(format!("{command}\n").as_bytes())?;
        stdin.flush()?;
        Ok(())
    }

    /// Read (and optionally rewrite) `server.properties`. Writes re-read the
    /// file afterwards, so the returned mapping is consistent with disk by
    /// construction.
    pub fn properties(
        &self,
        updates: Option<&BTreeMap<String, String>>,
    ) -> Result<BTreeMap<String, String>> {
        let props = PropertiesFile::new(
            self.cfg.working_directory.join(&self.cfg.properties_file),
        );
        if let Some(u) = updates {
            props.update(u)?;
        }
        Ok(props.read()?)
    }

    /// Script takes precedence over the jar; neither present is a refusal,
    /// not a spawn error.
    fn resolve_command(&self, ram: &str) -> Result<Vec<String>> {
        let workdir = &self.cfg.working_directory;
        if workdir.join(&self.cfg.server_script).is_file() {
            return Ok(vec![
                "bash".to_string(),
                self.cfg.server_script.display().to_string(),
            ]);
        }
        if workdir.join(&self.cfg.server_jar).is_file() {
            return Ok(vec![
                "java".to_string(),
                format!("-Xmx{ram}"),
                format!("-Xms{ram}"),
                "-jar".to_string(),
                self.cfg.server_jar.display().to_string(),
                "nogui".to_string(),
            ]);
        }
        Err(WrapperError::NoExecutableFound {
            script: workdir.join(&self.cfg.server_script),
            jar: workdir.join(&self.cfg.server_jar),
        })
    }

    fn log_path(&self, stream: &str) -> PathBuf {
        self.cfg
            .working_directory
            .join(format!("{}-{stream}.log", self.cfg.log_prefix))
    }

    fn clear_handle(&mut self) {
        self.process = None;
        self.stdout = None;
        self.stderr = None;
        if let Err(e) = self.pidfile.delete() {
            mc_event(
                "minecraft",
                format!("attempt=pidfile_delete outcome=error err={e}"),
            );
        }
    }
}

fn open_append(path: &std::path::Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Poll `try_wait` until the child exits or the deadline passes. Returns
/// whether the child exited in time.
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            Err(_) => return true,
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(200));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// A stand-in server: echoes console commands to `commands.txt`, exits
    /// cleanly on `stop`.
    const POLITE_SERVER: &str = "#!/bin/sh
while read line; do
  echo \"$line\" >> commands.txt
  if [ \"$line\" = stop ]; then exit 0; fi
done
";

    /// A server that ignores both the console command and SIGTERM.
    const DEAF_SERVER: &str = "#!/bin/sh
trap '' TERM
while :; do sleep 1; done
";

    fn write_script(dir: &Path, body: &str) {
        let path = dir.join("minecraft_server-run.sh");
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn test_config(dir: &Path) -> WrapperConfig {
        WrapperConfig {
            working_directory: dir.to_path_buf(),
            stop_command_timeout_secs: 2,
            term_timeout_secs: 1,
            ..WrapperConfig::default()
        }
    }

    fn wait_for<F: FnMut() -> bool>(mut cond: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        false
    }

    #[test]
    fn start_without_executable_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut mc = Minecraft::new(test_config(dir.path()));
        match mc.start("256M") {
            Err(WrapperError::NoExecutableFound { .. }) => {}
            other => panic!("expected NoExecutableFound, got {other:?}"),
        }
        assert_eq!(mc.pid(), 0);
        assert!(!dir.path().join("minecraft.pid").exists());
    }

    #[test]
    fn start_records_pid_and_polite_stop_sends_no_signal() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), POLITE_SERVER);
        let mut mc = Minecraft::new(test_config(dir.path()));
        let pid = mc.start("256M").unwrap();
        assert!(pid > 0);
        assert_eq!(mc.pid(), pid);
        let recorded = fs::read_to_string(dir.path().join("minecraft.pid")).unwrap();
        assert_eq!(recorded.trim().parse::<u32>().unwrap(), pid);

        let outcome = mc.stop().unwrap();
        assert_eq!(
            outcome,
            StopOutcome::Stopped {
                stage: StopStage::StopCommand
            }
        );
        assert_eq!(mc.pid(), 0);
        assert!(!dir.path().join("minecraft.pid").exists());
    }

    #[test]
    fn second_start_is_already_running() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), POLITE_SERVER);
        let mut mc = Minecraft::new(test_config(dir.path()));
        let pid = mc.start("256M").unwrap();
        match mc.start("256M") {
            Err(WrapperError::AlreadyRunning { pid: p }) => assert_eq!(p, pid),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
        mc.stop().unwrap();
    }

    #[test]
    fn foreign_live_pidfile_is_orphaned_and_no_spawn_happens() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), POLITE_SERVER);
        // A live pid we do not own: this test process itself.
        fs::write(
            dir.path().join("minecraft.pid"),
            format!("{}\n", std::process::id()),
        )
        .unwrap();
        let mut mc = Minecraft::new(test_config(dir.path()));
        match mc.start("256M") {
            Err(WrapperError::AlreadyOrphaned { pid, .. }) => {
                assert_eq!(pid, std::process::id() as i32);
            }
            other => panic!("expected AlreadyOrphaned, got {other:?}"),
        }
        assert_eq!(mc.pid(), 0);
        // No spawn attempt: no log sinks were opened.
        assert!(!dir.path().join("minecraft-stdout.log").exists());
    }

    #[test]
    fn signal_deaf_server_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), DEAF_SERVER);
        let mut mc = Minecraft::new(test_config(dir.path()));
        let pid = mc.start("256M").unwrap();
        let outcome = mc.stop().unwrap();
        assert_eq!(
            outcome,
            StopOutcome::Stopped {
                stage: StopStage::Kill
            }
        );
        assert!(!crate::mcsw::pidfile::process_alive(Pid::from_raw(pid as i32)));
        assert_eq!(mc.pid(), 0);
    }

    #[test]
    fn stop_when_not_running_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut mc = Minecraft::new(test_config(dir.path()));
        assert_eq!(mc.stop().unwrap(), StopOutcome::AlreadyStopped);
    }

    #[test]
    fn exec_when_not_running_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut mc = Minecraft::new(test_config(dir.path()));
        match mc.exec("say hi") {
            Err(WrapperError::NotRunning) => {}
            other => panic!("expected NotRunning, got {other:?}"),
        }
    }

    #[test]
    fn exec_injects_commands_into_the_console() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), POLITE_SERVER);
        let mut mc = Minecraft::new(test_config(dir.path()));
        mc.start("256M").unwrap();
        mc.exec("say hello").unwrap();
        let cmds = dir.path().join("commands.txt");
        assert!(wait_for(
            || fs::read_to_string(&cmds)
                .map(|s| s.contains("say hello"))
                .unwrap_or(false),
            Duration::from_secs(2)
        ));
        mc.stop().unwrap();
    }

    #[test]
    fn exited_server_is_lazily_reaped_on_status() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "#!/bin/sh\nexit 0\n");
        let mut mc = Minecraft::new(test_config(dir.path()));
        mc.start("256M").unwrap();
        assert!(wait_for(|| mc.pid() == 0, Duration::from_secs(2)));
        assert!(!dir.path().join("minecraft.pid").exists());
    }

    #[test]
    fn properties_update_via_supervisor_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("server.properties"), "a=0\nb=2\n").unwrap();
        let mc = Minecraft::new(test_config(dir.path()));
        let mut updates = BTreeMap::new();
        updates.insert("a".to_string(), "1".to_string());
        let out = mc.properties(Some(&updates)).unwrap();
        assert_eq!(out.get("a").map(String::as_str), Some("1"));
        assert_eq!(out.get("b").map(String::as_str), Some("2"));
        assert_eq!(
            fs::read_to_string(dir.path().join("server.properties")).unwrap(),
            "a=1\nb=2\n"
        );
    }
}
