//! Repository configuration: `.lfc/config`.
//!
//! The config is line-oriented `key: value` text, the same shape as the
//! sidecar format. Remotes are flattened as `remote.<name>` keys. Writes
//! go through a temp file and an exclusive `config.lock` so concurrent
//! invocations serialize.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::{Error, Result};

/// Default number of concurrent transfer workers.
pub const DEFAULT_JOBS: usize = 4;

/// When a working file is compared against its sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashCheck {
    /// Re-hash the file contents.
    Always,
    /// Compare byte lengths only.
    #[default]
    Size,
    /// Trust file presence.
    Never,
}

impl HashCheck {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "always" => Ok(HashCheck::Always),
            "size" => Ok(HashCheck::Size),
            "never" => Ok(HashCheck::Never),
            other => Err(Error::Parse(format!(
                "hash-check must be always|size|never, got '{other}'"
            ))),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            HashCheck::Always => "always",
            HashCheck::Size => "size",
            HashCheck::Never => "never",
        }
    }
}

/// A named remote cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSpec {
    pub url: String,
    /// Backend-specific hint, e.g. `post` for HTTP servers that take
    /// uploads via POST instead of PUT.
    pub kind: Option<String>,
}

/// Parsed `.lfc/config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub default_remote: Option<String>,
    pub auto_pull: bool,
    pub hash_check: HashCheck,
    pub umask: Option<u32>,
    pub jobs: Option<usize>,
    pub remotes: BTreeMap<String, RemoteSpec>,
    extra: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_remote: None,
            auto_pull: true,
            hash_check: HashCheck::default(),
            umask: None,
            jobs: None,
            remotes: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Parse config text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut config = Config::default();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once(':').ok_or_else(|| {
                Error::Parse(format!("config line {}: expected 'key: value'", lineno + 1))
            })?;
            let key = key.trim();
            let value = value.trim();

            match key {
                "default-remote" => config.default_remote = Some(value.to_string()),
                "auto-pull" => {
                    config.auto_pull = match value {
                        "on" => true,
                        "off" => false,
                        other => {
                            return Err(Error::Parse(format!(
                                "auto-pull must be on|off, got '{other}'"
                            )))
                        }
                    }
                }
                "hash-check" => config.hash_check = HashCheck::parse(value)?,
                "umask" => {
                    config.umask = Some(u32::from_str_radix(value, 8).map_err(|_| {
                        Error::Parse(format!("umask must be octal, got '{value}'"))
                    })?)
                }
                "jobs" => {
                    config.jobs = Some(value.parse().map_err(|_| {
                        Error::Parse(format!("jobs must be a positive integer, got '{value}'"))
                    })?)
                }
                _ => {
                    if let Some(rest) = key.strip_prefix("remote.") {
                        if let Some(name) = rest.strip_suffix(".kind") {
                            config
                                .remotes
                                .entry(name.to_string())
                                .or_insert_with(|| RemoteSpec {
                                    url: String::new(),
                                    kind: None,
                                })
                                .kind = Some(value.to_string());
                        } else {
                            config
                                .remotes
                                .entry(rest.to_string())
                                .or_insert_with(|| RemoteSpec {
                                    url: String::new(),
                                    kind: None,
                                })
                                .url = value.to_string();
                        }
                    } else {
                        // forward compatibility: keep what we don't know
                        config.extra.insert(key.to_string(), value.to_string());
                    }
                }
            }
        }

        for (name, spec) in &config.remotes {
            if spec.url.is_empty() {
                return Err(Error::Parse(format!("remote '{name}' has no url")));
            }
        }

        Ok(config)
    }

    /// Canonical text form: scalars first, remotes next, unknown keys last.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "auto-pull: {}\n",
            if self.auto_pull { "on" } else { "off" }
        ));
        if let Some(remote) = &self.default_remote {
            out.push_str(&format!("default-remote: {remote}\n"));
        }
        out.push_str(&format!("hash-check: {}\n", self.hash_check.as_str()));
        if let Some(jobs) = self.jobs {
            out.push_str(&format!("jobs: {jobs}\n"));
        }
        if let Some(umask) = self.umask {
            out.push_str(&format!("umask: {umask:03o}\n"));
        }
        for (name, spec) in &self.remotes {
            out.push_str(&format!("remote.{name}: {}\n", spec.url));
            if let Some(kind) = &spec.kind {
                out.push_str(&format!("remote.{name}.kind: {kind}\n"));
            }
        }
        for (key, value) in &self.extra {
            out.push_str(&format!("{key}: {value}\n"));
        }
        out
    }

    /// Load from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Config::parse(&text).map_err(|err| match err {
            Error::Parse(reason) => Error::Parse(format!("{}: {reason}", path.display())),
            other => other,
        })
    }

    /// Write to `path` atomically under the config lock.
    pub fn save(&self, path: &Path) -> Result<()> {
        let _lock = ConfigLock::acquire(path)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, self.encode())?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Look up a scalar option by its config-file key.
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "auto-pull" => Some(if self.auto_pull { "on" } else { "off" }.to_string()),
            "default-remote" => self.default_remote.clone(),
            "hash-check" => Some(self.hash_check.as_str().to_string()),
            "jobs" => self.jobs.map(|j| j.to_string()),
            "umask" => self.umask.map(|u| format!("{u:03o}")),
            _ => {
                if let Some(rest) = key.strip_prefix("remote.") {
                    if let Some(name) = rest.strip_suffix(".kind") {
                        self.remotes.get(name).and_then(|s| s.kind.clone())
                    } else {
                        self.remotes.get(rest).map(|s| s.url.clone())
                    }
                } else {
                    self.extra.get(key).cloned()
                }
            }
        }
    }

    /// Set an option by its config-file key.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if let Some(rest) = key.strip_prefix("remote.") {
            if let Some(name) = rest.strip_suffix(".kind") {
                let entry = self
                    .remotes
                    .get_mut(name)
                    .ok_or_else(|| Error::NoSuchRemote(name.to_string()))?;
                entry.kind = Some(value.to_string());
            } else {
                self.remotes
                    .entry(rest.to_string())
                    .and_modify(|spec| spec.url = value.to_string())
                    .or_insert_with(|| RemoteSpec {
                        url: value.to_string(),
                        kind: None,
                    });
            }
            return Ok(());
        }

        // scalar values are validated through the parser
        let parsed = Config::parse(&format!("{key}: {value}\n"))?;
        match key {
            "auto-pull" => self.auto_pull = parsed.auto_pull,
            "default-remote" => self.default_remote = parsed.default_remote,
            "hash-check" => self.hash_check = parsed.hash_check,
            "jobs" => self.jobs = parsed.jobs,
            "umask" => self.umask = parsed.umask,
            _ => {
                self.extra.insert(key.to_string(), value.to_string());
            }
        }
        Ok(())
    }
}

/// Exclusive lock file held for the duration of a config write.
struct ConfigLock {
    path: PathBuf,
}

impl ConfigLock {
    fn acquire(config_path: &Path) -> Result<ConfigLock> {
        let path = config_path.with_extension("lock");
        // the lock is only held across a temp-write + rename, so a short
        // bounded wait is enough; a stale lock means a crashed writer
        for attempt in 0..50 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(ConfigLock { path }),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if attempt == 49 {
                        return Err(Error::Io(io::Error::new(
                            io::ErrorKind::WouldBlock,
                            format!("config lock {} is held", path.display()),
                        )));
                    }
                    thread::sleep(Duration::from_millis(20));
                }
                Err(err) => return Err(err.into()),
            }
        }
        unreachable!("lock loop returns before falling through")
    }
}

impl Drop for ConfigLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
