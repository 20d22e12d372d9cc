//! Pointer-record (sidecar) codec.
//!
//! A sidecar is a small `key: value` text file at `<path>.lfc` standing in
//! for a large working-tree file. It records the blob hash and size, an
//! optional original file name, and preserves any keys it does not know
//! about so newer writers can round-trip through older readers.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use crate::{Error, Oid, Result};

/// File-name suffix marking a pointer record.
pub const SIDECAR_SUFFIX: &str = ".lfc";

/// A parsed pointer record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pointer {
    sha256: Oid,
    size: u64,
    path: Option<String>,
    extra: BTreeMap<String, String>,
}

impl Pointer {
    /// Create a record for a blob of known hash and size.
    pub fn new(sha256: Oid, size: u64) -> Self {
        Pointer {
            sha256,
            size,
            path: None,
            extra: BTreeMap::new(),
        }
    }

    /// Record the original file name.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// The blob hash this record points at.
    pub fn oid(&self) -> &Oid {
        &self.sha256
    }

    /// Byte length of the blob.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Original file name, if recorded.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Keys this version does not interpret, preserved verbatim.
    pub fn extra(&self) -> &BTreeMap<String, String> {
        &self.extra
    }

    /// Parse a record from its text form.
    ///
    /// Lines are `key: value` with the value trimmed; blank lines and
    /// `#` comments are skipped; on duplicate keys the last one wins.
    pub fn parse(text: &str) -> Result<Self> {
        let mut fields: BTreeMap<String, String> = BTreeMap::new();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once(':').ok_or_else(|| {
                Error::Parse(format!("line {}: expected 'key: value'", lineno + 1))
            })?;
            fields.insert(key.trim().to_string(), value.trim().to_string());
        }

        let sha256 = fields
            .remove("sha256")
            .ok_or_else(|| Error::Parse("missing required key 'sha256'".into()))?;
        let sha256 = Oid::from_hex(&sha256)?;

        let size = fields
            .remove("size")
            .ok_or_else(|| Error::Parse("missing required key 'size'".into()))?;
        let size = size
            .parse::<u64>()
            .map_err(|_| Error::Parse(format!("invalid size '{size}'")))?;

        let path = fields.remove("path");

        Ok(Pointer {
            sha256,
            size,
            path,
            extra: fields,
        })
    }

    /// Encode to canonical text: sha256, size, path, then unknown keys
    /// in sorted order, one trailing newline. Re-encoding a parsed
    /// record reproduces it byte for byte.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("sha256: {}\n", self.sha256));
        out.push_str(&format!("size: {}\n", self.size));
        if let Some(path) = &self.path {
            out.push_str(&format!("path: {path}\n"));
        }
        for (key, value) in &self.extra {
            out.push_str(&format!("{key}: {value}\n"));
        }
        out
    }
}

impl std::fmt::Display for Pointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Whether `path` names a sidecar, by suffix.
pub fn is_sidecar(path: &Path) -> bool {
    path.file_name()
        .and_then(OsStr::to_str)
        .map(|name| name.ends_with(SIDECAR_SUFFIX) && name.len() > SIDECAR_SUFFIX.len())
        .unwrap_or(false)
}

/// The working-tree path a sidecar describes (suffix stripped).
pub fn original_of(sidecar: &Path) -> Option<PathBuf> {
    if !is_sidecar(sidecar) {
        return None;
    }
    let name = sidecar.file_name()?.to_str()?;
    let stripped = &name[..name.len() - SIDECAR_SUFFIX.len()];
    Some(sidecar.with_file_name(stripped))
}

/// The sidecar path for a working-tree file (suffix appended).
///
/// A path that already carries the suffix is returned unchanged.
pub fn sidecar_for(path: &Path) -> PathBuf {
    if is_sidecar(path) {
        return path.to_path_buf();
    }
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(SIDECAR_SUFFIX);
    path.with_file_name(name)
}

/// Read and parse the sidecar at `path`.
pub fn read_sidecar(path: &Path) -> Result<Pointer> {
    let text = fs::read_to_string(path)?;
    Pointer::parse(&text).map_err(|err| match err {
        Error::Parse(reason) => Error::Parse(format!("{}: {reason}", path.display())),
        other => other,
    })
}

/// Write `record` to the sidecar at `path`, atomically.
///
/// An existing sidecar with identical canonical bytes is left untouched.
pub fn write_sidecar(path: &Path, record: &Pointer) -> Result<()> {
    let encoded = record.encode();
    if let Ok(current) = fs::read_to_string(path) {
        if current == encoded {
            return Ok(());
        }
    }
    let tmp = path.with_extension("lfc.tmp");
    fs::write(&tmp, &encoded)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_canonical() {
        let text = "sha256: 9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08\n\
                    size: 1048576\n\
                    path: myfile.dat\n";
        let record = Pointer::parse(text).unwrap();
        assert_eq!(
            record.oid().to_hex(),
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
        assert_eq!(record.size(), 1048576);
        assert_eq!(record.path(), Some("myfile.dat"));
    }

    #[test]
    fn test_parse_comments_blanks_and_duplicates() {
        let text = "# produced by hand\n\
                    \n\
                    size: 1\n\
                    sha256: dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f\n\
                    size: 13\n";
        let record = Pointer::parse(text).unwrap();
        // last duplicate wins
        assert_eq!(record.size(), 13);
    }

    #[test]
    fn test_parse_preserves_unknown_keys() {
        let text = "sha256: dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f\n\
                    size: 13\n\
                    zeta: later\n\
                    alpha: sooner\n";
        let record = Pointer::parse(text).unwrap();
        assert_eq!(record.extra().len(), 2);
        // canonical encode sorts unknown keys after the known ones
        let encoded = record.encode();
        let alpha = encoded.find("alpha:").unwrap();
        let zeta = encoded.find("zeta:").unwrap();
        assert!(alpha < zeta);
        assert!(encoded.starts_with("sha256: "));
    }

    #[test]
    fn test_parse_missing_required() {
        assert!(Pointer::parse("size: 10\n").is_err());
        assert!(Pointer::parse(
            "sha256: dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f\n"
        )
        .is_err());
        assert!(Pointer::parse("nonsense line\n").is_err());
    }

    #[test]
    fn test_roundtrip_is_byte_stable() {
        let text = "sha256: dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f\n\
                    size: 13\n\
                    path: hello.bin\n\
                    origin: import\n";
        let record = Pointer::parse(text).unwrap();
        let encoded = record.encode();
        let reparsed = Pointer::parse(&encoded).unwrap();
        assert_eq!(record, reparsed);
        assert_eq!(encoded, reparsed.encode());
    }

    #[test]
    fn test_suffix_helpers() {
        assert!(is_sidecar(Path::new("data/model.bin.lfc")));
        assert!(!is_sidecar(Path::new("data/model.bin")));
        assert!(!is_sidecar(Path::new(".lfc")));

        assert_eq!(
            original_of(Path::new("data/model.bin.lfc")),
            Some(PathBuf::from("data/model.bin"))
        );
        assert_eq!(original_of(Path::new("data/model.bin")), None);

        assert_eq!(
            sidecar_for(Path::new("data/model.bin")),
            PathBuf::from("data/model.bin.lfc")
        );
        assert_eq!(
            sidecar_for(Path::new("data/model.bin.lfc")),
            PathBuf::from("data/model.bin.lfc")
        );
    }

    #[test]
    fn test_write_sidecar_idempotent() {
        let td = TempDir::new().unwrap();
        let path = td.path().join("big.dat.lfc");
        let record = Pointer::new(Oid::digest(b"payload"), 7).with_path("big.dat");

        write_sidecar(&path, &record).unwrap();
        let first = fs::read(&path).unwrap();
        write_sidecar(&path, &record).unwrap();
        let second = fs::read(&path).unwrap();
        assert_eq!(first, second);

        let read_back = read_sidecar(&path).unwrap();
        assert_eq!(read_back, record);
    }
}
