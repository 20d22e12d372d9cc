//! Content-addressed local blob store.
//!
//! Blobs live under `<root>/<aa>/<bb...>` where `aabb...` is the SHA-256
//! hex digest of the blob's bytes. Writes stream through a digest
//! accumulator into a temporary file on the same filesystem and are
//! promoted with an atomic rename; the rename is the commit point.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{Error, Oid, Result};

/// Prefix for in-flight temporary files inside the cache root.
const TMP_PREFIX: &str = "tmp.";

/// Orphan temps older than this are removed by [`Cache::sweep_temps`].
pub const TMP_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// How a blob is realized as a working-tree file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// Hardlink into the working tree (same device, no extra space).
    Hard,
    /// Byte copy fallback.
    Copy,
}

/// The local content-addressed blob store.
pub struct Cache {
    root: PathBuf,
    link_mode: OnceLock<LinkMode>,
}

impl Cache {
    /// Open (without creating) a cache rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Cache {
            root: root.into(),
            link_mode: OnceLock::new(),
        }
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic path of the blob for `oid`.
    pub fn blob_path(&self, oid: &Oid) -> PathBuf {
        self.root.join(oid.shard()).join(oid.rest())
    }

    /// Existence check by stat.
    pub fn has(&self, oid: &Oid) -> bool {
        self.blob_path(oid).is_file()
    }

    /// Open a blob for sequential reading, or `None` if absent.
    pub fn open(&self, oid: &Oid) -> Option<File> {
        File::open(self.blob_path(oid)).ok()
    }

    /// Size of the cached blob, or `None` if absent.
    pub fn size_of(&self, oid: &Oid) -> Option<u64> {
        fs::metadata(self.blob_path(oid)).map(|m| m.len()).ok()
    }

    /// Stream `reader` into the cache, returning the hash and byte count.
    ///
    /// The bytes are hashed while they are written to a temporary file in
    /// the cache root; once the digest is known the temp is renamed to its
    /// final two-level path. If the blob already exists the temp is
    /// discarded (blobs are immutable).
    pub fn store(&self, mut reader: impl Read) -> Result<(Oid, u64)> {
        fs::create_dir_all(&self.root)?;
        let tmp = TmpFile::create(&self.root)?;
        let mut file = File::create(tmp.path())?;

        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        let mut size = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n])?;
            size += n as u64;
        }
        file.sync_all()?;
        drop(file);

        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hasher.finalize());
        let oid = Oid::from_bytes(bytes);

        self.promote(tmp, &oid)?;
        Ok((oid, size))
    }

    /// Hash and store a file from the working tree.
    pub fn store_file(&self, path: &Path) -> Result<(Oid, u64)> {
        let file = File::open(path)?;
        self.store(file)
    }

    /// A streaming writer that only promotes the blob if the bytes written
    /// hash to `expected`. Used for pulls: a digest mismatch removes the
    /// temp and reports corruption, and the final path is never touched.
    pub fn writer_for(&self, expected: Oid) -> Result<CacheWriter<'_>> {
        fs::create_dir_all(&self.root)?;
        let tmp = TmpFile::create(&self.root)?;
        let file = File::create(tmp.path())?;
        Ok(CacheWriter {
            cache: self,
            file: Some(file),
            tmp,
            hasher: Sha256::new(),
            expected,
            written: 0,
        })
    }

    /// Re-hash a cached blob and compare against its name.
    pub fn verify(&self, oid: &Oid) -> Result<()> {
        let file = self
            .open(oid)
            .ok_or_else(|| Error::MissingBlob(oid.to_hex()))?;
        let (actual, _) = Oid::digest_reader(file)?;
        if &actual != oid {
            return Err(Error::Corrupt {
                expected: oid.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(())
    }

    /// Remove abandoned temporary files older than `max_age`.
    ///
    /// Crashed writers leave `tmp.*` files in the cache root; anything
    /// still young may belong to a live process and is kept.
    pub fn sweep_temps(&self, max_age: Duration) -> io::Result<usize> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };

        let mut removed = 0;
        let now = SystemTime::now();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(TMP_PREFIX) {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| now.duration_since(t).ok());
            if age.map(|a| a >= max_age).unwrap_or(true) {
                if fs::remove_file(entry.path()).is_ok() {
                    debug!(temp = name, "removed orphan cache temp");
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Realize `oid` as the file at `dest`, by hardlink when the
    /// filesystem allows it and by copy otherwise.
    ///
    /// Any existing file at `dest` is replaced. Copies are made
    /// user-writable; hardlinks share the read-only cache inode, which
    /// protects the blob from accidental edits.
    pub fn materialize(&self, oid: &Oid, dest: &Path) -> Result<LinkMode> {
        let blob = self.blob_path(oid);
        if !blob.is_file() {
            return Err(Error::MissingBlob(oid.to_hex()));
        }
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        if dest.exists() {
            fs::remove_file(dest)?;
        }

        let mode = self.link_mode(dest.parent().unwrap_or(Path::new(".")));
        match mode {
            LinkMode::Hard => {
                if fs::hard_link(&blob, dest).is_ok() {
                    return Ok(LinkMode::Hard);
                }
                // cross-device or exotic fs after a stale probe
                warn!(dest = %dest.display(), "hardlink failed, copying instead");
            }
            LinkMode::Copy => {}
        }

        fs::copy(&blob, dest)?;
        set_writable(dest)?;
        Ok(LinkMode::Copy)
    }

    /// Probe whether hardlinks work between the cache and `target_dir`.
    /// Resolved on first use and memoized for the process lifetime.
    fn link_mode(&self, target_dir: &Path) -> LinkMode {
        *self.link_mode.get_or_init(|| {
            let probe_src = self.root.join(format!("{TMP_PREFIX}probe.{}", std::process::id()));
            let probe_dst = target_dir.join(format!(".lfc-probe.{}", std::process::id()));
            let supported = fs::write(&probe_src, b"probe").is_ok()
                && fs::hard_link(&probe_src, &probe_dst).is_ok();
            let _ = fs::remove_file(&probe_dst);
            let _ = fs::remove_file(&probe_src);
            if supported {
                LinkMode::Hard
            } else {
                LinkMode::Copy
            }
        })
    }

    /// Rename a finished temp to its final blob path.
    fn promote(&self, tmp: TmpFile, oid: &Oid) -> Result<()> {
        let final_path = self.blob_path(oid);
        if final_path.is_file() {
            // immutable: the existing blob wins, the temp is discarded
            return Ok(());
        }
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        set_read_only(tmp.path())?;
        match fs::rename(tmp.path(), &final_path) {
            Ok(()) => {
                tmp.disarm();
                Ok(())
            }
            Err(_) if final_path.is_file() => Ok(()), // lost a benign race
            Err(err) => Err(err.into()),
        }
    }
}

/// Streaming, digest-verifying writer returned by [`Cache::writer_for`].
pub struct CacheWriter<'a> {
    cache: &'a Cache,
    file: Option<File>,
    tmp: TmpFile,
    hasher: Sha256,
    expected: Oid,
    written: u64,
}

impl CacheWriter<'_> {
    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Finish the stream: verify the digest and atomically promote.
    ///
    /// On mismatch the temp is removed and `Error::Corrupt` is returned;
    /// the final cache path is never created.
    pub fn finish(mut self) -> Result<u64> {
        let file = self.file.take().ok_or_else(|| {
            Error::Io(io::Error::new(io::ErrorKind::Other, "writer already finished"))
        })?;
        file.sync_all()?;
        drop(file);

        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&std::mem::take(&mut self.hasher).finalize());
        let actual = Oid::from_bytes(bytes);

        if actual != self.expected {
            // TmpFile's drop removes the temp
            return Err(Error::Corrupt {
                expected: self.expected.to_hex(),
                actual: actual.to_hex(),
            });
        }

        let written = self.written;
        let tmp = std::mem::replace(&mut self.tmp, TmpFile::disarmed());
        self.cache.promote(tmp, &self.expected)?;
        Ok(written)
    }
}

impl Write for CacheWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "writer already finished"))?;
        let n = file.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// A uniquely named temp path that removes itself on drop unless disarmed.
struct TmpFile {
    path: PathBuf,
    armed: bool,
}

impl TmpFile {
    fn create(dir: &Path) -> io::Result<TmpFile> {
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let name = format!("{TMP_PREFIX}{}.{seq}", std::process::id());
        Ok(TmpFile {
            path: dir.join(name),
            armed: true,
        })
    }

    fn disarmed() -> TmpFile {
        TmpFile {
            path: PathBuf::new(),
            armed: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TmpFile {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(unix)]
fn set_read_only(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o400))
}

#[cfg(not(unix))]
fn set_read_only(path: &Path) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)
}

#[cfg(unix)]
fn set_writable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_writable(path: &Path) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(false);
    fs::set_permissions(path, perms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_places_blob_at_hash_path() {
        let td = TempDir::new().unwrap();
        let cache = Cache::new(td.path());

        let content = b"Hello, World!";
        let (oid, size) = cache.store(&content[..]).unwrap();
        assert_eq!(size, content.len() as u64);
        assert_eq!(oid, Oid::digest(content));

        let path = cache.blob_path(&oid);
        assert!(path.is_file());
        assert_eq!(fs::read(&path).unwrap(), content);
        assert!(cache.has(&oid));
        assert_eq!(cache.size_of(&oid), Some(size));
    }

    #[test]
    fn test_store_existing_blob_is_noop() {
        let td = TempDir::new().unwrap();
        let cache = Cache::new(td.path());

        let content = b"same bytes twice";
        let (oid, _) = cache.store(&content[..]).unwrap();
        let before = fs::metadata(cache.blob_path(&oid)).unwrap().modified().unwrap();
        let (oid2, _) = cache.store(&content[..]).unwrap();
        assert_eq!(oid, oid2);
        let after = fs::metadata(cache.blob_path(&oid)).unwrap().modified().unwrap();
        assert_eq!(before, after);

        // no temps left behind
        let temps: Vec<_> = fs::read_dir(td.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(TMP_PREFIX))
            .collect();
        assert!(temps.is_empty());
    }

    #[test]
    fn test_blob_is_read_only() {
        let td = TempDir::new().unwrap();
        let cache = Cache::new(td.path());
        let (oid, _) = cache.store(&b"protect me"[..]).unwrap();
        let perms = fs::metadata(cache.blob_path(&oid)).unwrap().permissions();
        assert!(perms.readonly());
    }

    #[test]
    fn test_verifying_writer_promotes_on_match() {
        let td = TempDir::new().unwrap();
        let cache = Cache::new(td.path());

        let content = b"verified payload";
        let expected = Oid::digest(content);
        let mut writer = cache.writer_for(expected.clone()).unwrap();
        writer.write_all(content).unwrap();
        let written = writer.finish().unwrap();
        assert_eq!(written, content.len() as u64);
        assert!(cache.has(&expected));
        cache.verify(&expected).unwrap();
    }

    #[test]
    fn test_verifying_writer_rejects_mismatch() {
        let td = TempDir::new().unwrap();
        let cache = Cache::new(td.path());

        let expected = Oid::digest(b"what was promised");
        let mut writer = cache.writer_for(expected.clone()).unwrap();
        writer.write_all(b"what actually arrived").unwrap();
        let err = writer.finish().unwrap_err();
        assert!(matches!(err, Error::Corrupt { .. }));

        // no blob, no temp
        assert!(!cache.has(&expected));
        let leftovers: Vec<_> = fs::read_dir(td.path()).unwrap().flatten().collect();
        assert!(leftovers.is_empty(), "cache not clean: {leftovers:?}");
    }

    #[test]
    fn test_sweep_removes_only_old_temps() {
        let td = TempDir::new().unwrap();
        let cache = Cache::new(td.path());
        fs::create_dir_all(td.path()).unwrap();

        let fresh = td.path().join("tmp.1234.0");
        fs::write(&fresh, b"in flight").unwrap();
        let removed = cache.sweep_temps(Duration::from_secs(3600)).unwrap();
        assert_eq!(removed, 0);
        assert!(fresh.is_file());

        let removed = cache.sweep_temps(Duration::ZERO).unwrap();
        assert_eq!(removed, 1);
        assert!(!fresh.exists());
    }

    #[test]
    fn test_materialize_reproduces_bytes() {
        let td = TempDir::new().unwrap();
        let cache = Cache::new(td.path().join("cache"));
        let content = b"bytes to check out";
        let (oid, _) = cache.store(&content[..]).unwrap();

        let dest = td.path().join("work").join("file.bin");
        cache.materialize(&oid, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), content);

        // replacing an existing file works too
        fs::remove_file(&dest).unwrap();
        fs::write(&dest, b"stale").unwrap();
        cache.materialize(&oid, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), content);
    }

    #[test]
    fn test_materialize_missing_blob() {
        let td = TempDir::new().unwrap();
        let cache = Cache::new(td.path());
        let oid = Oid::digest(b"never stored");
        let err = cache.materialize(&oid, &td.path().join("out")).unwrap_err();
        assert!(matches!(err, Error::MissingBlob(_)));
    }

    #[test]
    fn test_verify_detects_tampering() {
        let td = TempDir::new().unwrap();
        let cache = Cache::new(td.path());
        let (oid, _) = cache.store(&b"original"[..]).unwrap();

        let path = cache.blob_path(&oid);
        let mut perms = fs::metadata(&path).unwrap().permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            perms.set_mode(0o600);
        }
        #[cfg(not(unix))]
        perms.set_readonly(false);
        fs::set_permissions(&path, perms).unwrap();
        fs::write(&path, b"tampered").unwrap();

        assert!(matches!(cache.verify(&oid), Err(Error::Corrupt { .. })));
    }
}
