use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WrapperError>;

/// Error kinds surfaced to the control API. Filesystem and spawn failures are
/// wrapped at the supervisor boundary; callers never see raw OS errors.
#[derive(Debug, Error)]
pub enum WrapperError {
    /// Start requested while the server is already running. Benign at most
    /// call sites (start is idempotent).
    #[error("minecraft server already running with pid {pid}")]
    AlreadyRunning { pid: u32 },

    /// The pid file names a live process this wrapper holds no handle for.
    /// Another wrapper instance owns the server; a second child would corrupt
    /// the world files, so start is refused.
    #[error("pid file {pidfile:?} names live process {pid} not owned by this wrapper")]
    AlreadyOrphaned { pidfile: PathBuf, pid: i32 },

    /// Neither the launch script nor the server jar exists.
    #[error("no runnable server: neither {script:?} nor {jar:?} exists")]
    NoExecutableFound { script: PathBuf, jar: PathBuf },

    /// Lost the exclusive pid-file create race to a concurrent start.
    #[error("pid file {pidfile:?} is locked by a concurrent start")]
    PidFileLocked { pidfile: PathBuf },

    /// Command injection against a stopped server.
    #[error("minecraft server is not running")]
    NotRunning,

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}
