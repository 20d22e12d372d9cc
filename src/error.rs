//! Error types for lfc operations.

use thiserror::Error;

/// Result type for lfc operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during large-file operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Operation run outside an initialized repository
    #[error("not a git repository (searched {0} and parents)")]
    NotARepo(String),

    /// Malformed object id
    #[error("invalid object id: {0}")]
    InvalidOid(String),

    /// Malformed sidecar or config file
    #[error("parse error: {0}")]
    Parse(String),

    /// Referenced blob absent locally and at the consulted remote
    #[error("object {0} not found in cache or remote")]
    MissingBlob(String),

    /// Network timeout or temporary backend failure; retried
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// Backend failure that retrying cannot fix
    #[error("backend failure: {0}")]
    Permanent(String),

    /// Authentication rejected by a remote
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Digest mismatch during transfer or verification
    #[error("corrupt object: expected {expected}, got {actual}")]
    Corrupt { expected: String, actual: String },

    /// Working-tree file differs from its pointer record
    #[error("'{0}' has local modifications not present in cache (use --force to discard)")]
    Conflict(String),

    /// Bad command usage not caught by the argument parser
    #[error("{0}")]
    Usage(String),

    /// No remote with the given name (or no default configured)
    #[error("no remote named '{0}'")]
    NoSuchRemote(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Process exit code for this error when it aborts a command.
    ///
    /// Per-object transfer failures use exit code 3; that is decided from
    /// the transfer report, not from an `Error` value.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Usage(_) => 2,
            Error::Corrupt { .. } => 4,
            _ => 1,
        }
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(401, _) | ureq::Error::Status(403, _) => {
                Error::Auth("server returned 401/403".into())
            }
            ureq::Error::Status(code, response) if code >= 500 => {
                Error::Transient(format!("server returned {code} {}", response.status_text()))
            }
            ureq::Error::Status(code, response) => {
                Error::Permanent(format!("server returned {code} {}", response.status_text()))
            }
            ureq::Error::Transport(transport) => match transport.kind() {
                ureq::ErrorKind::Dns | ureq::ErrorKind::ConnectionFailed => {
                    Error::Permanent(transport.to_string())
                }
                _ => Error::Transient(transport.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::Usage("bad".into()).exit_code(), 2);
        assert_eq!(
            Error::Corrupt {
                expected: "aa".into(),
                actual: "bb".into()
            }
            .exit_code(),
            4
        );
        assert_eq!(Error::NotARepo("/tmp".into()).exit_code(), 1);
        assert_eq!(Error::Transient("timeout".into()).exit_code(), 1);
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Transient("timeout".into()).is_transient());
        assert!(!Error::Permanent("410 gone".into()).is_transient());
        assert!(!Error::Auth("denied".into()).is_transient());
    }
}
