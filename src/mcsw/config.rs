use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Wrapper configuration. Every field has a default so a missing config file
/// yields a usable setup rooted in the current directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WrapperConfig {
    #[serde(default = "default_working_directory")]
    pub working_directory: PathBuf,

    /// Runnable server archive, launched as `java -Xmx<ram> -Xms<ram> -jar <jar> nogui`.
    #[serde(default = "default_server_jar")]
    pub server_jar: PathBuf,

    /// Prebuilt launch script; takes precedence over the jar when present.
    #[serde(default = "default_server_script")]
    pub server_script: PathBuf,

    #[serde(default = "default_properties_file")]
    pub properties_file: PathBuf,

    /// Server stdout/stderr are appended to `<prefix>-stdout.log` / `<prefix>-stderr.log`.
    #[serde(default = "default_log_prefix")]
    pub log_prefix: String,

    /// Lock for the managed server process.
    #[serde(default = "default_server_pidfile")]
    pub server_pidfile: PathBuf,

    /// Lock for the wrapper daemon itself.
    #[serde(default = "default_daemon_pidfile")]
    pub daemon_pidfile: PathBuf,

    /// How long to wait after writing `stop` to the server console before
    /// escalating to SIGTERM.
    #[serde(default = "default_stop_command_timeout_secs")]
    pub stop_command_timeout_secs: u64,

    /// How long to wait after SIGTERM before escalating to SIGKILL.
    #[serde(default = "default_term_timeout_secs")]
    pub term_timeout_secs: u64,

    /// Client-side `mcswd stop`: seconds of SIGTERM polling before SIGKILL.
    /// Must exceed `stop_command_timeout_secs + term_timeout_secs`: the
    /// daemon's TERM handler runs the full server escalation, and killing the
    /// daemon mid-escalation would orphan a signal-deaf server with nobody
    /// left to send its SIGKILL backstop.
    #[serde(default = "default_daemon_stop_timeout_secs")]
    pub daemon_stop_timeout_secs: u64,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            working_directory: default_working_directory(),
            server_jar: default_server_jar(),
            server_script: default_server_script(),
            properties_file: default_properties_file(),
            log_prefix: default_log_prefix(),
            server_pidfile: default_server_pidfile(),
            daemon_pidfile: default_daemon_pidfile(),
            stop_command_timeout_secs: default_stop_command_timeout_secs(),
            term_timeout_secs: default_term_timeout_secs(),
            daemon_stop_timeout_secs: default_daemon_stop_timeout_secs(),
        }
    }
}

fn default_working_directory() -> PathBuf {
    PathBuf::from(".")
}
fn default_server_jar() -> PathBuf {
    PathBuf::from("minecraft_server-run.jar")
}
fn default_server_script() -> PathBuf {
    PathBuf::from("minecraft_server-run.sh")
}
fn default_properties_file() -> PathBuf {
    PathBuf::from("server.properties")
}
fn default_log_prefix() -> String {
    "minecraft".to_string()
}
fn default_server_pidfile() -> PathBuf {
    PathBuf::from("minecraft.pid")
}
fn default_daemon_pidfile() -> PathBuf {
    PathBuf::from("mcswd.pid")
}
fn default_stop_command_timeout_secs() -> u64 {
    16
}
fn default_term_timeout_secs() -> u64 {
    4
}
fn default_daemon_stop_timeout_secs() -> u64 {
    // Polite stage (16) + SIGTERM stage (4) + margin for the SIGKILL wait.
    24
}

pub fn load_config(config_path: &Path) -> anyhow::Result<WrapperConfig> {
    let raw = match std::fs::read_to_string(config_path) {
        Ok(s) => s,
        // No file means built-in defaults; mcswd runs unconfigured by design.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(WrapperConfig::default());
        }
        Err(e) => {
            return Err(anyhow::anyhow!(
                "failed to read config {}: {e}",
                config_path.display()
            ));
        }
    };
    serde_yaml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", config_path.display()))
}
