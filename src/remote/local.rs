//! Filesystem backend.
//!
//! Mirrors the local cache layout: one blob per hash under
//! `<root>/<aa>/<bb...>`, writes committed by temp-and-rename. A local
//! remote written by one repository is byte-portable to any other.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use walkdir::WalkDir;

use crate::{Error, Oid, Result};

use super::Backend;

static PUT_SEQ: AtomicU64 = AtomicU64::new(0);

/// A remote cache on a mounted filesystem.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalBackend { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, oid: &Oid) -> PathBuf {
        self.root.join(oid.shard()).join(oid.rest())
    }
}

impl Backend for LocalBackend {
    fn has(&self, oid: &Oid) -> Result<bool> {
        Ok(self.blob_path(oid).is_file())
    }

    fn get(&self, oid: &Oid) -> Result<Option<Box<dyn Read + Send>>> {
        match File::open(self.blob_path(oid)) {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn put(&self, oid: &Oid, reader: &mut dyn Read, _size: u64) -> Result<()> {
        let final_path = self.blob_path(oid);
        if final_path.is_file() {
            // blobs are immutable; nothing to do
            return Ok(());
        }
        let parent = final_path
            .parent()
            .ok_or_else(|| Error::Permanent("remote path has no parent".into()))?;
        fs::create_dir_all(parent)?;

        let seq = PUT_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = parent.join(format!(
            "tmp.{}.{seq}",
            std::process::id()
        ));
        let result = (|| -> Result<()> {
            let mut file = File::create(&tmp)?;
            io::copy(reader, &mut file)?;
            file.sync_all()?;
            drop(file);
            fs::rename(&tmp, &final_path)?;
            Ok(())
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    fn list(&self) -> Result<BTreeSet<Oid>> {
        let mut found = BTreeSet::new();
        if !self.root.is_dir() {
            return Ok(found);
        }
        for entry in WalkDir::new(&self.root).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|err| {
                Error::Io(io::Error::other(format!("walking remote: {err}")))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let shard = entry
                .path()
                .parent()
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let rest = entry.file_name().to_string_lossy();
            if let Ok(oid) = Oid::from_hex(&format!("{shard}{rest}")) {
                found.insert(oid);
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_roundtrip() {
        let td = TempDir::new().unwrap();
        let backend = LocalBackend::new(td.path().join("hub"));

        let content = b"remote payload";
        let oid = Oid::digest(content);

        assert!(!backend.has(&oid).unwrap());
        assert!(backend.get(&oid).unwrap().is_none());

        backend
            .put(&oid, &mut &content[..], content.len() as u64)
            .unwrap();
        assert!(backend.has(&oid).unwrap());

        let mut reader = backend.get(&oid).unwrap().unwrap();
        let mut got = Vec::new();
        reader.read_to_end(&mut got).unwrap();
        assert_eq!(got, content);

        // layout matches the cache convention
        let path = td.path().join("hub").join(oid.shard()).join(oid.rest());
        assert!(path.is_file());
    }

    #[test]
    fn test_put_existing_is_noop() {
        let td = TempDir::new().unwrap();
        let backend = LocalBackend::new(td.path());

        let content = b"idempotent";
        let oid = Oid::digest(content);
        backend
            .put(&oid, &mut &content[..], content.len() as u64)
            .unwrap();
        // a second put with different bytes must not clobber the blob
        backend.put(&oid, &mut &b"other"[..], 5).unwrap();

        let mut got = Vec::new();
        backend
            .get(&oid)
            .unwrap()
            .unwrap()
            .read_to_end(&mut got)
            .unwrap();
        assert_eq!(got, content);
    }

    #[test]
    fn test_list_skips_foreign_files() {
        let td = TempDir::new().unwrap();
        let backend = LocalBackend::new(td.path());

        let a = Oid::digest(b"a");
        let b = Oid::digest(b"b");
        backend.put(&a, &mut &b"a"[..], 1).unwrap();
        backend.put(&b, &mut &b"b"[..], 1).unwrap();

        // junk that must not be reported
        fs::create_dir_all(td.path().join("zz")).unwrap();
        fs::write(td.path().join("zz/readme.txt"), b"hi").unwrap();
        fs::write(td.path().join("stray"), b"hi").unwrap();

        let listed = backend.list().unwrap();
        assert_eq!(listed, BTreeSet::from([a, b]));
    }

    #[test]
    fn test_list_missing_root_is_empty() {
        let backend = LocalBackend::new("/nonexistent/lfc/remote");
        assert!(backend.list().unwrap().is_empty());
    }
}
