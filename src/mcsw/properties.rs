use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Server property keys the original wrapper accepted for appending new
/// entries. Existing keys can always be rewritten; brand-new keys must pass
/// this list when the store is built with `with_allow_list`.
pub const MINECRAFT_ALLOW_LIST: &[&str] = &[
    "allow-flight",
    "allow-nether",
    "announce-player-achievements",
    "difficulty",
    "enable-command-block",
    "force-gamemode",
    "gamemode",
    "generate-structures",
    "generator-settings",
    "hardcore",
    "level-name",
    "level-seed",
    "level-type",
    "max-build-height",
    "max-players",
    "motd",
    "online-mode",
    "op-permission-level",
    "player-idle-timeout",
    "pvp",
    "resource-pack",
    "server-name",
    "snooper-enabled",
    "spawn-animals",
    "spawn-monsters",
    "spawn-npcs",
    "spawn-protection",
    "view-distance",
    "white-list",
];

/// Ordered `key=value` store over a plain text file. Updates rewrite only the
/// matched lines; comments and malformed lines pass through byte-for-byte,
/// and the rewrite goes through a temp file + atomic rename so concurrent
/// readers never observe a half-written file.
#[derive(Debug, Clone)]
pub struct PropertiesFile {
    path: PathBuf,
    allow_list: Option<BTreeSet<String>>,
}

impl PropertiesFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            allow_list: None,
        }
    }

    /// Restrict which *new* keys may be appended. Keys already present in the
    /// file are always rewritable.
    pub fn with_allow_list(path: impl Into<PathBuf>, keys: &[&str]) -> Self {
        Self {
            path: path.into(),
            allow_list: Some(keys.iter().map(|k| k.to_string()).collect()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse the file into a map. A missing file is an empty map; `#` lines
    /// and lines without `=` are skipped.
    pub fn read(&self) -> io::Result<BTreeMap<String, String>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e),
        };
        let mut props = BTreeMap::new();
        for line in raw.lines() {
            if line.trim_start().starts_with('#') {
                continue;
            }
            if let Some((k, v)) = line.split_once('=') {
                props.insert(k.to_string(), v.trim().to_string());
            }
        }
        Ok(props)
    }

    /// Rewrite matched keys in place, preserving line order and untouched
    /// lines exactly; leftover keys are appended at the end (subject to the
    /// allow-list). A missing source file is treated as empty.
    pub fn update(&self, updates: &BTreeMap<String, String>) -> io::Result<()> {
        let src = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };
        let dir = self.path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut tmp = NamedTempFile::new_in(dir.unwrap_or(Path::new(".")))?;

        let mut pending = updates.clone();
        let mut ends_with_newline = true;
        for line in src.split_inclusive('\n') {
            let content = line.trim_end_matches(['\n', '\r']);
            if !content.trim_start().starts_with('#') {
                if let Some((k, _)) = content.split_once('=') {
                    if let Some(v) = pending.remove(k) {
                        // Rewritten lines keep their original terminator, so
                        // CRLF files stay CRLF.
                        let terminator = &line[content.len()..];
                        write!(tmp, "{}={}{}", k, v.trim(), terminator)?;
                        ends_with_newline = !terminator.is_empty();
                        continue;
                    }
                }
            }
            tmp.write_all(line.as_bytes())?;
            ends_with_newline = line.ends_with('\n');
        }
        if let Some(allowed) = &self.allow_list {
            pending.retain(|k, _| allowed.contains(k));
        }
        if !pending.is_empty() && !ends_with_newline {
            tmp.write_all(b"\n")?;
        }
        for (k, v) in &pending {
            writeln!(tmp, "{}={}", k, v.trim())?;
        }
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}
