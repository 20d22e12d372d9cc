//! Repository handle: discovery, initialization, git plumbing, and
//! `.gitignore` upkeep.
//!
//! Git itself is driven as a subprocess; lfc only reads the few pieces of
//! state it needs (file listings, ignore checks, tree contents at a ref)
//! and never re-implements ignore parsing.

use std::collections::BTreeSet;
use std::env;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::config::{Config, RemoteSpec, DEFAULT_JOBS};
use crate::pointer::{self, Pointer};
use crate::{cache, Cache, Error, Result};

/// Name of the lfc state directory at the repository root.
pub const LFC_DIR: &str = ".lfc";

/// An open repository with large-file state.
pub struct Repo {
    root: PathBuf,
    config_path: PathBuf,
    cache: Cache,
}

impl Repo {
    /// Walk up from `start` to the enclosing git work tree.
    ///
    /// Also sweeps orphan cache temps left by crashed writers.
    pub fn discover(start: &Path) -> Result<Repo> {
        let start = if start.is_absolute() {
            start.to_path_buf()
        } else {
            env::current_dir()?.join(start)
        };
        let mut dir = start.clone();
        loop {
            if dir.join(".git").exists() {
                let repo = Repo::open(dir);
                let _ = repo.cache.sweep_temps(cache::TMP_MAX_AGE);
                return Ok(repo);
            }
            if !dir.pop() {
                return Err(Error::NotARepo(start.display().to_string()));
            }
        }
    }

    /// Open a repository whose work-tree root is already known.
    ///
    /// `LFC_CONFIG` and `LFC_CACHE_DIR` override the default locations of
    /// the config file and the blob cache.
    pub fn open(root: impl Into<PathBuf>) -> Repo {
        let root = root.into();
        let config_path = env::var_os("LFC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join(LFC_DIR).join("config"));
        let cache_root = env::var_os("LFC_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join(LFC_DIR).join("cache"));
        Repo {
            root,
            config_path,
            cache: Cache::new(cache_root),
        }
    }

    /// The work-tree root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The local blob cache.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Whether `init` has been run here.
    pub fn is_initialized(&self) -> bool {
        self.config_path.is_file()
    }

    /// Create `.lfc/`, the cache directory, a default config, and the
    /// internal `.gitignore`. Idempotent: existing config is preserved.
    pub fn init(&self) -> Result<()> {
        let lfc_dir = self.root.join(LFC_DIR);
        fs::create_dir_all(&lfc_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&lfc_dir, fs::Permissions::from_mode(0o755))?;
        }
        fs::create_dir_all(self.cache.root())?;

        let ignore = lfc_dir.join(".gitignore");
        if !ignore.is_file() {
            fs::write(&ignore, "cache/\nconfig.lock\nconfig.tmp\ntmp/\n")?;
        }
        if !self.config_path.is_file() {
            if let Some(parent) = self.config_path.parent() {
                fs::create_dir_all(parent)?;
            }
            Config::default().save(&self.config_path)?;
        }
        debug!(root = %self.root.display(), "initialized large-file state");
        Ok(())
    }

    /// Load the repository config.
    pub fn config(&self) -> Result<Config> {
        if !self.config_path.is_file() {
            return Ok(Config::default());
        }
        Config::load(&self.config_path)
    }

    /// Persist the repository config.
    pub fn save_config(&self, config: &Config) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        config.save(&self.config_path)
    }

    /// Number of transfer workers: CLI flag, then `LFC_JOBS`, then the
    /// config, then the default of 4.
    pub fn jobs(&self, cli: Option<usize>) -> usize {
        cli.or_else(|| env::var("LFC_JOBS").ok().and_then(|v| v.parse().ok()))
            .or_else(|| self.config().ok().and_then(|c| c.jobs))
            .unwrap_or(DEFAULT_JOBS)
            .max(1)
    }

    /// Resolve a remote by name, falling back to `default-remote`, then
    /// to the sole configured remote.
    pub fn resolve_remote(&self, name: Option<&str>) -> Result<(String, RemoteSpec)> {
        let config = self.config()?;
        let name = match name {
            Some(name) => name.to_string(),
            None => match &config.default_remote {
                Some(default) => default.clone(),
                None if config.remotes.len() == 1 => {
                    config.remotes.keys().next().cloned().unwrap_or_default()
                }
                None => {
                    return Err(Error::Usage(
                        "no remote given and no default-remote configured".into(),
                    ))
                }
            },
        };
        let spec = config
            .remotes
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::NoSuchRemote(name.clone()))?;
        Ok((name, spec))
    }

    /// Turn a user-supplied path into a repo-relative one.
    pub fn rel(&self, path: &Path) -> Result<PathBuf> {
        let abs = if path.is_absolute() {
            path.to_path_buf()
        } else {
            env::current_dir()?.join(path)
        };
        let abs = normalize(&abs);
        let root = normalize(&self.root);
        abs.strip_prefix(&root).map(Path::to_path_buf).map_err(|_| {
            Error::Usage(format!(
                "'{}' is outside the repository at {}",
                path.display(),
                self.root.display()
            ))
        })
    }

    /// All sidecars under the given repo-relative paths (everywhere when
    /// empty), honoring git's ignore rules via `git ls-files`.
    pub fn find_sidecars(&self, paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut args: Vec<String> = vec![
            "ls-files".into(),
            "-z".into(),
            "--cached".into(),
            "--others".into(),
            "--exclude-standard".into(),
            "--".into(),
        ];
        if paths.is_empty() {
            args.push(format!("*{}", pointer::SIDECAR_SUFFIX));
        } else {
            for path in paths {
                let path_str = path.to_string_lossy();
                if pointer::is_sidecar(path) {
                    args.push(path_str.into_owned());
                } else if self.root.join(path).is_dir() {
                    args.push(format!("{path_str}/*{}", pointer::SIDECAR_SUFFIX));
                } else {
                    args.push(pointer::sidecar_for(path).to_string_lossy().into_owned());
                }
            }
        }

        let stdout = self.git_stdout(&args.iter().map(String::as_str).collect::<Vec<_>>())?;
        let mut found = BTreeSet::new();
        for entry in stdout.split('\0') {
            if entry.is_empty() {
                continue;
            }
            let path = PathBuf::from(entry);
            if pointer::is_sidecar(&path) {
                found.insert(path);
            }
        }
        Ok(found.into_iter().collect())
    }

    /// Ignored-but-present files, for stray detection in `status`.
    pub fn ignored_files(&self) -> Result<Vec<PathBuf>> {
        let stdout = self.git_stdout(&[
            "ls-files",
            "-z",
            "--others",
            "--ignored",
            "--exclude-standard",
        ])?;
        Ok(stdout
            .split('\0')
            .filter(|entry| !entry.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    /// Sidecar records reachable from a git ref, without touching the
    /// working tree. Used by `clone` and `show --ref`.
    pub fn sidecars_at_ref(&self, refname: &str) -> Result<Vec<(PathBuf, Pointer)>> {
        let listing = self.git_stdout(&["ls-tree", "-r", "-z", "--name-only", refname])?;
        let mut records = Vec::new();
        for entry in listing.split('\0') {
            if entry.is_empty() || !entry.ends_with(pointer::SIDECAR_SUFFIX) {
                continue;
            }
            let text = self.git_stdout(&["show", &format!("{refname}:{entry}")])?;
            let record = Pointer::parse(&text).map_err(|err| match err {
                Error::Parse(reason) => Error::Parse(format!("{refname}:{entry}: {reason}")),
                other => other,
            })?;
            records.push((PathBuf::from(entry), record));
        }
        Ok(records)
    }

    /// Whether git already ignores `rel` (committed or local rules).
    pub fn is_ignored(&self, rel: &Path) -> bool {
        Command::new("git")
            .current_dir(&self.root)
            .args(["check-ignore", "-q", "--"])
            .arg(rel)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    /// Make sure git ignores the large file at repo-relative `rel` by
    /// appending an anchored entry to the `.gitignore` next to it.
    pub fn ensure_ignored(&self, rel: &Path) -> Result<()> {
        if self.is_ignored(rel) {
            return Ok(());
        }
        let name = rel
            .file_name()
            .ok_or_else(|| Error::Usage(format!("'{}' has no file name", rel.display())))?
            .to_string_lossy();
        let dir = rel.parent().unwrap_or(Path::new(""));
        let gitignore = self.root.join(dir).join(".gitignore");

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&gitignore)?;
        file.write_all(format!("/{name}\n").as_bytes())?;
        debug!(file = %rel.display(), "added gitignore entry");
        Ok(())
    }

    /// Run git in the repository root and return stdout as UTF-8.
    fn git_stdout(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .current_dir(&self.root)
            .args(args)
            .stdin(Stdio::null())
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Io(io::Error::other(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or(""),
                stderr.trim()
            ))));
        }
        String::from_utf8(output.stdout)
            .map_err(|_| Error::Parse("git output was not UTF-8".into()))
    }
}

/// Run `git clone` and return the directory of the new work tree.
pub fn git_clone(url: &str, dir: Option<&Path>) -> Result<PathBuf> {
    let target = match dir {
        Some(dir) => dir.to_path_buf(),
        None => {
            let tail = url
                .trim_end_matches('/')
                .rsplit(['/', ':'])
                .next()
                .unwrap_or(url);
            PathBuf::from(tail.strip_suffix(".git").unwrap_or(tail))
        }
    };

    let status = Command::new("git")
        .arg("clone")
        .arg(url)
        .arg(&target)
        .status()?;
    if !status.success() {
        return Err(Error::Io(io::Error::other(format!(
            "git clone {url} failed"
        ))));
    }
    Ok(target)
}

/// Lexically resolve `.` and `..` components.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn git_fixture() -> TempDir {
        let td = TempDir::new().unwrap();
        let status = Command::new("git")
            .args(["init", "-q"])
            .current_dir(td.path())
            .status()
            .expect("git must be installed for these tests");
        assert!(status.success());
        td
    }

    #[test]
    fn test_discover_walks_up() {
        let td = git_fixture();
        let nested = td.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();

        let repo = Repo::discover(&nested).unwrap();
        assert_eq!(normalize(repo.root()), normalize(td.path()));
    }

    #[test]
    fn test_discover_outside_repo_fails() {
        let td = TempDir::new().unwrap();
        assert!(matches!(Repo::discover(td.path()), Err(Error::NotARepo(_))));
    }

    #[test]
    fn test_init_layout_and_idempotence() {
        let td = git_fixture();
        let repo = Repo::open(td.path());
        repo.init().unwrap();

        assert!(td.path().join(".lfc").is_dir());
        assert!(td.path().join(".lfc/cache").is_dir());
        assert!(td.path().join(".lfc/config").is_file());
        let ignore = fs::read_to_string(td.path().join(".lfc/.gitignore")).unwrap();
        assert!(ignore.contains("cache/"));

        // re-init keeps an edited config
        let mut config = repo.config().unwrap();
        config.set("remote.hub", "/srv/hub").unwrap();
        repo.save_config(&config).unwrap();
        repo.init().unwrap();
        assert_eq!(
            repo.config().unwrap().get("remote.hub").as_deref(),
            Some("/srv/hub")
        );
    }

    #[test]
    fn test_ensure_ignored_appends_once() {
        let td = git_fixture();
        let repo = Repo::open(td.path());
        repo.init().unwrap();

        fs::write(td.path().join("big.bin"), b"x").unwrap();
        repo.ensure_ignored(Path::new("big.bin")).unwrap();
        let ignore = fs::read_to_string(td.path().join(".gitignore")).unwrap();
        assert_eq!(ignore, "/big.bin\n");

        // second call sees the entry through git check-ignore and
        // leaves the file alone
        repo.ensure_ignored(Path::new("big.bin")).unwrap();
        let again = fs::read_to_string(td.path().join(".gitignore")).unwrap();
        assert_eq!(again, "/big.bin\n");
    }

    #[test]
    fn test_find_sidecars_sees_untracked() {
        let td = git_fixture();
        let repo = Repo::open(td.path());
        repo.init().unwrap();

        fs::create_dir_all(td.path().join("data")).unwrap();
        fs::write(
            td.path().join("data/model.bin.lfc"),
            "sha256: dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f\nsize: 13\n",
        )
        .unwrap();
        fs::write(td.path().join("notes.txt"), b"not a sidecar").unwrap();

        let all = repo.find_sidecars(&[]).unwrap();
        assert_eq!(all, vec![PathBuf::from("data/model.bin.lfc")]);

        let scoped = repo.find_sidecars(&[PathBuf::from("data")]).unwrap();
        assert_eq!(scoped, vec![PathBuf::from("data/model.bin.lfc")]);

        let by_original = repo
            .find_sidecars(&[PathBuf::from("data/model.bin")])
            .unwrap();
        assert_eq!(by_original, vec![PathBuf::from("data/model.bin.lfc")]);
    }

    #[test]
    fn test_resolve_remote_fallbacks() {
        let td = git_fixture();
        let repo = Repo::open(td.path());
        repo.init().unwrap();

        assert!(matches!(repo.resolve_remote(None), Err(Error::Usage(_))));

        let mut config = repo.config().unwrap();
        config.set("remote.hub", "../hub").unwrap();
        repo.save_config(&config).unwrap();
        // a single remote is the implicit default
        let (name, spec) = repo.resolve_remote(None).unwrap();
        assert_eq!(name, "hub");
        assert_eq!(spec.url, "../hub");

        config.set("remote.mirror", "/srv/mirror").unwrap();
        repo.save_config(&config).unwrap();
        assert!(repo.resolve_remote(None).is_err());

        config.set("default-remote", "mirror").unwrap();
        repo.save_config(&config).unwrap();
        assert_eq!(repo.resolve_remote(None).unwrap().0, "mirror");
        assert_eq!(repo.resolve_remote(Some("hub")).unwrap().0, "hub");
        assert!(matches!(
            repo.resolve_remote(Some("gone")),
            Err(Error::NoSuchRemote(_))
        ));
    }
}
