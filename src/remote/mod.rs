//! Remote cache backends.
//!
//! Every backend speaks the same four-operation contract over blob
//! hashes; the transfer engine never sees URLs or paths. The concrete
//! transport is picked from the shape of the remote URL: `http(s)://`
//! goes over HTTP, `ssh://` and scp-style `user@host:path` go through
//! the system ssh client, anything else is a filesystem path.

mod http;
mod local;
mod ssh;

pub use http::{Credentials, HttpBackend};
pub use local::LocalBackend;
pub use ssh::SshBackend;

use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::RemoteSpec;
use crate::repo::normalize;
use crate::{Oid, Result};

/// Per-request time limits, classified as transient on expiry.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Existence probes and other small requests.
    pub probe: Duration,
    /// Bulk object transfer.
    pub transfer: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            probe: Duration::from_secs(30),
            transfer: Duration::from_secs(300),
        }
    }
}

/// A content store addressed purely by blob hash.
///
/// After a successful `put(h, ...)`, `has(h)` reports true and `get(h)`
/// streams back exactly the bytes that were put. How a backend lays out
/// its storage is its own business.
pub trait Backend: Send + Sync {
    /// Existence check.
    fn has(&self, oid: &Oid) -> Result<bool>;

    /// Sequential reader over a blob, or `None` if the remote lacks it.
    fn get(&self, oid: &Oid) -> Result<Option<Box<dyn Read + Send>>>;

    /// Upload a blob of known size.
    fn put(&self, oid: &Oid, reader: &mut dyn Read, size: u64) -> Result<()>;

    /// Every hash present at the remote.
    fn list(&self) -> Result<BTreeSet<Oid>>;
}

/// Construct the backend for a remote spec.
///
/// Relative filesystem URLs resolve against the repository root, so a
/// remote like `../hub` means a sibling directory of the repo.
pub fn open_backend(
    repo_root: &Path,
    spec: &RemoteSpec,
    timeouts: Timeouts,
) -> Result<Box<dyn Backend>> {
    let url = spec.url.as_str();
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(Box::new(HttpBackend::from_url(
            url,
            spec.kind.as_deref(),
            timeouts,
        )?));
    }
    if let Some(target) = ssh::SshTarget::parse(url) {
        return Ok(Box::new(SshBackend::new(target, timeouts)));
    }
    let path = if Path::new(url).is_absolute() {
        PathBuf::from(url)
    } else {
        normalize(&repo_root.join(url))
    };
    Ok(Box::new(LocalBackend::new(path)))
}
