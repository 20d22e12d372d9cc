//! Working-tree reconciliation: `add`, `checkout`, `status`.
//!
//! The reconciler maps sidecars to working-tree files and decides, per
//! file, whether to materialize from cache, re-hash, or re-emit the
//! pointer record. Ordering is load-bearing: a blob always lands in the
//! cache before the sidecar that references it is written.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::cache::LinkMode;
use crate::config::HashCheck;
use crate::pointer::{self, Pointer};
use crate::remote::{Backend, LocalBackend};
use crate::repo::{normalize, Repo};
use crate::{Error, Oid, Result};

/// What remains in the working tree after `add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Only the sidecar: the original file is removed.
    Pointer,
    /// The file becomes a (hard)link to the cache blob.
    #[default]
    Link,
    /// An independent copy of the file stays in place.
    Copy,
}

/// Result of `add` for one file.
#[derive(Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Added(Oid),
    /// Hash unchanged; sidecar and cache untouched.
    Unchanged(Oid),
}

/// Track `path`: hash it, store the blob, write the sidecar, and make
/// sure git ignores the original file.
pub fn add(repo: &Repo, path: &Path, mode: Mode) -> Result<AddOutcome> {
    let rel = repo.rel(path)?;
    let rel = pointer::original_of(&rel).unwrap_or(rel);
    let abs = repo.root().join(&rel);

    let meta = fs::metadata(&abs)?;
    if !meta.is_file() {
        return Err(Error::Usage(format!(
            "'{}' is not a regular file",
            rel.display()
        )));
    }

    // blob first, sidecar second: a reader that sees the sidecar must
    // also see the blob
    let (oid, size) = repo.cache().store_file(&abs)?;

    let name = rel
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let record = Pointer::new(oid.clone(), size).with_path(name);

    let sidecar_rel = pointer::sidecar_for(&rel);
    let sidecar_abs = repo.root().join(&sidecar_rel);

    repo.ensure_ignored(&rel)?;

    if let Ok(existing) = pointer::read_sidecar(&sidecar_abs) {
        if existing.oid() == &oid && existing.encode() == record.encode() {
            debug!(file = %rel.display(), "already up to date");
            return Ok(AddOutcome::Unchanged(oid));
        }
    }

    pointer::write_sidecar(&sidecar_abs, &record)?;
    info!(file = %rel.display(), oid = %oid, size, "tracked large file");

    match mode {
        Mode::Copy => {}
        Mode::Pointer => fs::remove_file(&abs)?,
        Mode::Link => {
            // swap the original for a link to the read-only cache blob
            repo.cache().materialize(&oid, &abs)?;
        }
    }

    Ok(AddOutcome::Added(oid))
}

/// How one sidecar relates to the working tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// File present and matching its record.
    Materialized,
    /// File absent, blob in the local cache.
    CachedOnly,
    /// File absent and blob not cached.
    Missing,
    /// File present but its bytes differ from the record.
    Modified,
}

impl FileState {
    pub fn label(&self) -> &'static str {
        match self {
            FileState::Materialized => "materialized",
            FileState::CachedOnly => "cached-only",
            FileState::Missing => "missing",
            FileState::Modified => "modified",
        }
    }
}

/// Classification of every sidecar plus stray large files.
#[derive(Debug, Default)]
pub struct StatusReport {
    /// Original (not sidecar) repo-relative path and its state.
    pub entries: Vec<(PathBuf, FileState)>,
    /// Ignored files that no sidecar accounts for.
    pub strays: Vec<PathBuf>,
}

/// Classify every sidecar in the working tree.
pub fn status(repo: &Repo) -> Result<StatusReport> {
    let hash_check = repo.config()?.hash_check;
    let mut report = StatusReport::default();

    let sidecars = repo.find_sidecars(&[])?;
    for sidecar_rel in &sidecars {
        let record = pointer::read_sidecar(&repo.root().join(sidecar_rel))?;
        let original_rel = pointer::original_of(sidecar_rel)
            .unwrap_or_else(|| sidecar_rel.clone());
        let abs = repo.root().join(&original_rel);

        let state = if abs.is_file() {
            if matches_record(&abs, &record, hash_check)? {
                FileState::Materialized
            } else {
                FileState::Modified
            }
        } else if repo.cache().has(record.oid()) {
            FileState::CachedOnly
        } else {
            FileState::Missing
        };
        report.entries.push((original_rel, state));
    }

    // ignored files nobody claims
    for ignored in repo.ignored_files()? {
        if ignored.starts_with(crate::repo::LFC_DIR) {
            continue;
        }
        let claimed = sidecars.contains(&pointer::sidecar_for(&ignored));
        if !claimed && !pointer::is_sidecar(&ignored) {
            report.strays.push(ignored);
        }
    }

    Ok(report)
}

/// Result of `checkout`.
#[derive(Debug, Default)]
pub struct CheckoutReport {
    pub materialized: Vec<PathBuf>,
    pub up_to_date: usize,
    /// Sidecars whose blob is in no local cache; `pull` fetches these.
    pub missing: Vec<(PathBuf, Oid)>,
}

/// Materialize the files for the sidecars under `paths` (all of them
/// when empty).
///
/// A working file whose content matches its record is left alone. A
/// modified file is only replaced when its current bytes are themselves
/// recoverable from the cache, or when `force` is given.
pub fn checkout(repo: &Repo, paths: &[PathBuf], force: bool) -> Result<CheckoutReport> {
    let config = repo.config()?;
    let (hash_check, umask) = (config.hash_check, config.umask);
    let mut report = CheckoutReport::default();

    for sidecar_rel in repo.find_sidecars(paths)? {
        let record = pointer::read_sidecar(&repo.root().join(&sidecar_rel))?;
        let original_rel = pointer::original_of(&sidecar_rel)
            .unwrap_or_else(|| sidecar_rel.clone());
        let abs = repo.root().join(&original_rel);

        if abs.is_file() {
            if matches_record(&abs, &record, hash_check)? {
                report.up_to_date += 1;
                continue;
            }
            if !force {
                let (current, _) = Oid::digest_reader(fs::File::open(&abs)?)?;
                if !repo.cache().has(&current) {
                    return Err(Error::Conflict(original_rel.display().to_string()));
                }
            }
        }

        if !repo.cache().has(record.oid()) {
            report.missing.push((original_rel, record.oid().clone()));
            continue;
        }

        let mode = repo.cache().materialize(record.oid(), &abs)?;
        if mode == LinkMode::Copy {
            apply_umask(&abs, umask)?;
        }
        debug!(file = %original_rel.display(), "materialized");
        report.materialized.push(original_rel);
    }

    Ok(report)
}

/// Resolve the pointer record for a working-tree path, from the checked
/// out sidecar or from a git ref.
pub fn resolve_record(repo: &Repo, path: &Path, refname: Option<&str>) -> Result<Pointer> {
    let rel = repo.rel(path)?;
    let rel = pointer::original_of(&rel).unwrap_or(rel);
    let sidecar_rel = pointer::sidecar_for(&rel);

    match refname {
        None => pointer::read_sidecar(&repo.root().join(&sidecar_rel)),
        Some(refname) => {
            let wanted = normalize(&sidecar_rel);
            repo.sidecars_at_ref(refname)?
                .into_iter()
                .find(|(p, _)| normalize(p) == wanted)
                .map(|(_, record)| record)
                .ok_or_else(|| {
                    Error::Usage(format!(
                        "no sidecar for '{}' at {refname}",
                        rel.display()
                    ))
                })
        }
    }
}

/// Open a blob from the local cache, falling back to any filesystem
/// remotes. Used by `show --cat`.
pub fn open_blob(repo: &Repo, oid: &Oid) -> Result<Box<dyn Read + Send>> {
    if let Some(file) = repo.cache().open(oid) {
        return Ok(Box::new(file));
    }
    for (name, spec) in repo.config()?.remotes {
        let is_path_remote = !spec.url.contains("://") && !spec.url.contains('@');
        if !is_path_remote {
            continue;
        }
        let root = if Path::new(&spec.url).is_absolute() {
            PathBuf::from(&spec.url)
        } else {
            normalize(&repo.root().join(&spec.url))
        };
        if let Some(reader) = LocalBackend::new(root).get(oid)? {
            debug!(remote = name, oid = %oid, "reading blob from remote cache");
            return Ok(reader);
        }
    }
    Err(Error::MissingBlob(oid.to_hex()))
}

/// Does the file at `abs` match `record`, per the configured policy?
fn matches_record(abs: &Path, record: &Pointer, policy: HashCheck) -> Result<bool> {
    match policy {
        HashCheck::Never => Ok(true),
        HashCheck::Size => Ok(fs::metadata(abs)?.len() == record.size()),
        HashCheck::Always => {
            let (oid, size) = Oid::digest_reader(fs::File::open(abs)?)?;
            Ok(size == record.size() && &oid == record.oid())
        }
    }
}

#[cfg(unix)]
fn apply_umask(path: &Path, umask: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(umask) = umask {
        // keep the owner read-write guarantee whatever the mask says
        let mode = (0o666 & !umask) | 0o600;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_umask(_path: &Path, _umask: Option<u32>) -> Result<()> {
    Ok(())
}
