use crate::mcsw::config::{self, WrapperConfig};
use crate::mcsw::daemon::{mc_event, systemd_ready, Daemon};
use crate::mcsw::error::WrapperError;
use crate::mcsw::minecraft::Minecraft;
use crate::mcsw::pidfile::PidFile;
use anyhow::Context as _;
use clap::{Parser, Subcommand};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "mcswd", version, about = "minecraft server wrapper daemon")]
pub struct Args {
    /// Path to wrapper config YAML
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Run the wrapper in the foreground (no detach)
    Run {
        /// Start the server immediately with this heap size, e.g. 1024M
        #[arg(long = "ram")]
        ram: Option<String>,
    },
    /// Detach from the terminal and run as a background daemon
    Start {
        /// Start the server immediately with this heap size, e.g. 1024M
        #[arg(long = "ram")]
        ram: Option<String>,
    },
    /// Stop a running daemon (SIGTERM, then SIGKILL after the timeout)
    Stop,
    /// Show daemon and server pids from their pid files
    Status,
}

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = config::load_config(&args.config)?;
    let daemon_pidfile = PidFile::new(cfg.working_directory.join(&cfg.daemon_pidfile));
    let daemon_stop_timeout = cfg.daemon_stop_timeout_secs;

    match args.cmd {
        Cmd::Run { ram } => supervise(cfg, ram),
        Cmd::Start { ram } => {
            let d = Daemon::new(daemon_pidfile, daemon_stop_timeout);
            d.start(move || supervise(cfg, ram))
        }
        Cmd::Stop => Daemon::new(daemon_pidfile, daemon_stop_timeout).stop(),
        Cmd::Status => {
            let server_pidfile = PidFile::new(cfg.working_directory.join(&cfg.server_pidfile));
            print_status("daemon", &daemon_pidfile)?;
            print_status("server", &server_pidfile)?;
            Ok(())
        }
    }
}

/// The wrapper's run loop. The control API drives the supervisor from here;
/// standalone, it only turns SIGINT/SIGTERM into an orderly server stop.
fn supervise(cfg: WrapperConfig, ram: Option<String>) -> anyhow::Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    for sig in [SIGINT, SIGTERM] {
        signal_hook::flag::register(sig, Arc::clone(&shutdown))
            .context("register signal handler")?;
    }

    let mut mc = Minecraft::new(cfg);
    if let Some(ram) = ram.as_deref() {
        match mc.start(ram) {
            Ok(pid) => mc_event("mcsw", format!("attempt=start outcome=started pid={pid}")),
            Err(WrapperError::AlreadyRunning { pid }) => {
                mc_event("mcsw", format!("attempt=start outcome=already_running pid={pid}"));
            }
            Err(e) => return Err(e).context("start minecraft server"),
        }
    }

    systemd_ready();
    mc_event("mcsw", "outcome=ready");
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(500));
    }

    mc_event("mcsw", "attempt=shutdown");
    mc.stop().context("stop minecraft server")?;
    mc_event("mcsw", "outcome=goodbye");
    Ok(())
}

fn print_status(role: &str, pidfile: &PidFile) -> anyhow::Result<()> {
    let read = pidfile
        .read()
        .with_context(|| format!("read {}", pidfile.path().display()))?;
    match read.pid {
        Some(pid) => println!("{role}: running pid={pid}"),
        None if read.repaired => println!("{role}: stopped (stale pid file removed)"),
        None => println!("{role}: stopped"),
    }
    Ok(())
}
