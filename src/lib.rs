//! # lfc
//!
//! Large File Control: a git extension that tracks large or binary files
//! without bloating the object database. A tracked file is replaced in
//! git by a small pointer record (`<path>.lfc`) carrying the SHA-256 of
//! its contents; the bytes live in a content-addressed cache under
//! `.lfc/cache/` and in any number of remote caches (local path, ssh,
//! http) that `push` and `pull` keep in sync.
//!
//! This crate provides:
//! - the pointer-record codec and its path helpers
//! - the content-addressed local cache with atomic, verified writes
//! - working-tree reconciliation (`add`, `checkout`, `status`)
//! - remote backends behind one uniform contract
//! - a concurrent transfer engine with retries and per-object outcomes
//!
//! ## Example
//!
//! ```no_run
//! use lfc::{reconcile, transfer, remote, Repo};
//!
//! let repo = Repo::discover(std::path::Path::new(".")).unwrap();
//! repo.init().unwrap();
//!
//! // track a file
//! reconcile::add(&repo, std::path::Path::new("model.bin"), Default::default()).unwrap();
//!
//! // push every referenced blob to the default remote
//! let (_, spec) = repo.resolve_remote(None).unwrap();
//! let backend = remote::open_backend(repo.root(), &spec, Default::default()).unwrap();
//! let oids = transfer::referenced_oids(&repo, &[]).unwrap();
//! let report = transfer::Engine::new(repo.cache(), backend, 4).push(oids);
//! assert!(report.success());
//! ```

mod cache;
mod error;
mod oid;

pub mod config;
pub mod pointer;
pub mod reconcile;
pub mod remote;
pub mod repo;
pub mod transfer;

pub use cache::{Cache, CacheWriter, LinkMode};
pub use config::Config;
pub use error::{Error, Result};
pub use oid::Oid;
pub use pointer::Pointer;
pub use repo::Repo;
