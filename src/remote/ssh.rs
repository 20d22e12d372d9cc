//! SSH backend.
//!
//! Drives the system ssh client as a subprocess and manipulates the
//! remote store with plain shell commands (`test -e`, `cat`, `mkdir -p`,
//! `mv`). Connection reuse is left to the user's ssh configuration
//! (ControlMaster); the `LFC_SSH` environment variable overrides the
//! client binary.

use std::collections::BTreeSet;
use std::env;
use std::io::{self, Read, Write};
use std::process::{Child, Command, Stdio};

use tracing::debug;

use crate::{Error, Oid, Result};

use super::{Backend, Timeouts};

/// Parsed `ssh://user@host/path` or scp-style `user@host:path` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct SshTarget {
    pub user: Option<String>,
    pub host: String,
    pub path: String,
}

impl SshTarget {
    pub fn parse(url: &str) -> Option<SshTarget> {
        if let Some(rest) = url.strip_prefix("ssh://") {
            let (userhost, path) = rest.split_once('/')?;
            let (user, host) = match userhost.split_once('@') {
                Some((user, host)) => (Some(user.to_string()), host.to_string()),
                None => (None, userhost.to_string()),
            };
            return Some(SshTarget {
                user,
                host,
                path: format!("/{path}"),
            });
        }
        // scp syntax: user@host:path (a "://" anywhere means some other scheme)
        if url.contains("://") {
            return None;
        }
        let (userhost, path) = url.split_once(':')?;
        let (user, host) = userhost.split_once('@')?;
        if user.is_empty() || host.is_empty() || path.is_empty() {
            return None;
        }
        Some(SshTarget {
            user: Some(user.to_string()),
            host: host.to_string(),
            path: path.to_string(),
        })
    }

    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

/// A remote cache behind an ssh login.
pub struct SshBackend {
    target: SshTarget,
    timeouts: Timeouts,
}

impl SshBackend {
    pub(super) fn new(target: SshTarget, timeouts: Timeouts) -> Self {
        SshBackend { target, timeouts }
    }

    fn ssh_program() -> String {
        env::var("LFC_SSH").unwrap_or_else(|_| "ssh".to_string())
    }

    fn blob_path(&self, oid: &Oid) -> String {
        format!("{}/{}/{}", self.target.path, oid.shard(), oid.rest())
    }

    fn command(&self, remote_cmd: &str) -> Command {
        let mut cmd = Command::new(Self::ssh_program());
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.timeouts.probe.as_secs().max(1)
            ))
            .arg(self.target.destination())
            .arg(remote_cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl Backend for SshBackend {
    fn has(&self, oid: &Oid) -> Result<bool> {
        let script = format!("test -e {}", sh_quote(&self.blob_path(oid)));
        let output = self.command(&script).output()?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(classify_ssh_failure(&output.stderr)),
        }
    }

    fn get(&self, oid: &Oid) -> Result<Option<Box<dyn Read + Send>>> {
        if !self.has(oid)? {
            return Ok(None);
        }
        let script = format!("cat {}", sh_quote(&self.blob_path(oid)));
        let child = self.command(&script).spawn()?;
        debug!(oid = %oid, host = %self.target.host, "streaming blob over ssh");
        Ok(Some(Box::new(SshReader { child })))
    }

    fn put(&self, oid: &Oid, reader: &mut dyn Read, _size: u64) -> Result<()> {
        let final_path = self.blob_path(oid);
        let dir = format!("{}/{}", self.target.path, oid.shard());
        let tmp = format!("{final_path}.tmp.{}", std::process::id());
        let script = format!(
            "mkdir -p {dir} && cat > {tmp} && mv {tmp} {dst}",
            dir = sh_quote(&dir),
            tmp = sh_quote(&tmp),
            dst = sh_quote(&final_path),
        );

        let mut cmd = self.command(&script);
        cmd.stdin(Stdio::piped());
        let mut child = cmd.spawn()?;
        {
            let mut stdin = child.stdin.take().ok_or_else(|| {
                Error::Io(io::Error::other("ssh child has no stdin"))
            })?;
            io::copy(reader, &mut stdin)?;
            stdin.flush()?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(classify_ssh_failure(&output.stderr));
        }
        Ok(())
    }

    fn list(&self) -> Result<BTreeSet<Oid>> {
        let script = format!(
            "test -d {path} && find {path} -type f || true",
            path = sh_quote(&self.target.path),
        );
        let output = self.command(&script).output()?;
        if !output.status.success() {
            return Err(classify_ssh_failure(&output.stderr));
        }

        let mut found = BTreeSet::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let mut parts = line.rsplit('/');
            let rest = parts.next().unwrap_or("");
            let shard = parts.next().unwrap_or("");
            if let Ok(oid) = Oid::from_hex(&format!("{shard}{rest}")) {
                found.insert(oid);
            }
        }
        Ok(found)
    }
}

/// Streams a remote `cat` and reaps the child at end of stream.
struct SshReader {
    child: Child,
}

impl Read for SshReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let stdout = self
            .child
            .stdout
            .as_mut()
            .ok_or_else(|| io::Error::other("ssh child has no stdout"))?;
        let n = stdout.read(buf)?;
        if n == 0 {
            let status = self.child.wait()?;
            if !status.success() {
                return Err(io::Error::other("remote cat failed mid-stream"));
            }
        }
        Ok(n)
    }
}

impl Drop for SshReader {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Sort ssh failures into the error taxonomy by exit detail.
fn classify_ssh_failure(stderr: &[u8]) -> Error {
    let text = String::from_utf8_lossy(stderr);
    let line = text.lines().last().unwrap_or("ssh failed").to_string();
    if text.contains("Permission denied") || text.contains("Host key verification failed") {
        Error::Auth(line)
    } else if text.contains("No such file") {
        Error::Permanent(line)
    } else {
        // connection drops, DNS hiccups, timeouts
        Error::Transient(line)
    }
}

/// Single-quote `s` for a POSIX shell.
fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ssh_url() {
        let target = SshTarget::parse("ssh://alice@cache.example.com/srv/lfc").unwrap();
        assert_eq!(target.user.as_deref(), Some("alice"));
        assert_eq!(target.host, "cache.example.com");
        assert_eq!(target.path, "/srv/lfc");
        assert_eq!(target.destination(), "alice@cache.example.com");
    }

    #[test]
    fn test_parse_ssh_url_without_user() {
        let target = SshTarget::parse("ssh://cache.example.com/srv/lfc").unwrap();
        assert_eq!(target.user, None);
        assert_eq!(target.destination(), "cache.example.com");
    }

    #[test]
    fn test_parse_scp_style() {
        let target = SshTarget::parse("alice@cache.example.com:srv/lfc").unwrap();
        assert_eq!(target.user.as_deref(), Some("alice"));
        assert_eq!(target.host, "cache.example.com");
        assert_eq!(target.path, "srv/lfc");
    }

    #[test]
    fn test_parse_rejects_other_shapes() {
        assert!(SshTarget::parse("../hub").is_none());
        assert!(SshTarget::parse("/srv/hub").is_none());
        assert!(SshTarget::parse("https://example.com/hub").is_none());
        // a bare path with a colon but no user is not scp syntax
        assert!(SshTarget::parse("C:tmp").is_none());
    }

    #[test]
    fn test_sh_quote() {
        assert_eq!(sh_quote("/plain/path"), "'/plain/path'");
        assert_eq!(sh_quote("with space"), "'with space'");
        assert_eq!(sh_quote("don't"), r"'don'\''t'");
    }

    #[test]
    fn test_classify_ssh_failure() {
        assert!(matches!(
            classify_ssh_failure(b"alice@host: Permission denied (publickey)."),
            Error::Auth(_)
        ));
        assert!(matches!(
            classify_ssh_failure(b"cat: /srv/lfc/aa/bb: No such file or directory"),
            Error::Permanent(_)
        ));
        assert!(matches!(
            classify_ssh_failure(b"ssh: connect to host example.com port 22: Connection timed out"),
            Error::Transient(_)
        ));
    }
}
