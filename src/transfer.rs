//! Transfer engine: moves blobs between the local cache and a remote
//! backend with bounded concurrency.
//!
//! Per-object failures never abort the batch; every hash gets an outcome
//! and the summary reports them in hash order. Pulled bytes stream
//! through a digest-verifying cache writer, so a corrupt remote blob is
//! rejected before it can reach a final cache path.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::pointer;
use crate::remote::Backend;
use crate::repo::Repo;
use crate::{Cache, Error, Oid, Result};

/// Which way blobs move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Push,
    Pull,
}

/// What happened to one hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    Received,
    SkippedPresent,
    SkippedMissingAtSource,
    Failed(String),
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    /// Short token for summaries.
    pub fn label(&self) -> &str {
        match self {
            Outcome::Sent => "sent",
            Outcome::Received => "received",
            Outcome::SkippedPresent => "skipped-present",
            Outcome::SkippedMissingAtSource => "skipped-missing-at-source",
            Outcome::Failed(_) => "failed",
        }
    }
}

/// Per-hash outcomes of one batch, iterated in hash order.
#[derive(Debug, Default)]
pub struct TransferReport {
    outcomes: BTreeMap<Oid, Outcome>,
}

impl TransferReport {
    pub fn success(&self) -> bool {
        self.failures() == 0
    }

    pub fn failures(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_failure()).count()
    }

    pub fn transferred(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, Outcome::Sent | Outcome::Received))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Oid, &Outcome)> {
        self.outcomes.iter()
    }
}

/// Drives one batch of transfers against one backend.
pub struct Engine<'a> {
    cache: &'a Cache,
    backend: Box<dyn Backend>,
    jobs: usize,
    retries: u32,
    backoff: Duration,
    cancel: Arc<AtomicBool>,
}

impl<'a> Engine<'a> {
    pub fn new(cache: &'a Cache, backend: Box<dyn Backend>, jobs: usize) -> Self {
        Engine {
            cache,
            backend,
            jobs: jobs.max(1),
            retries: 3,
            backoff: Duration::from_secs(1),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the retry policy (bound and first backoff step).
    pub fn with_retry(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    /// Cooperative cancellation flag, checked between I/O operations.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Upload every hash the destination is missing.
    pub fn push(&self, oids: BTreeSet<Oid>) -> TransferReport {
        self.run(Direction::Push, oids)
    }

    /// Download every hash the local cache is missing.
    pub fn pull(&self, oids: BTreeSet<Oid>) -> TransferReport {
        self.run(Direction::Pull, oids)
    }

    fn run(&self, direction: Direction, oids: BTreeSet<Oid>) -> TransferReport {
        let queue: Mutex<VecDeque<Oid>> = Mutex::new(oids.into_iter().collect());
        let results: Mutex<BTreeMap<Oid, Outcome>> = Mutex::new(BTreeMap::new());

        thread::scope(|scope| {
            for _ in 0..self.jobs {
                scope.spawn(|| loop {
                    if self.cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    let next = lock(&queue).pop_front();
                    let Some(oid) = next else { break };

                    let outcome = match direction {
                        Direction::Push => self.push_one(&oid),
                        Direction::Pull => self.pull_one(&oid),
                    };
                    debug!(oid = %oid, outcome = outcome.label(), "transfer outcome");
                    lock(&results).insert(oid, outcome);
                });
            }
        });

        let mut outcomes = results.into_inner().unwrap_or_else(|e| e.into_inner());
        // anything still queued after a cancel gets an explicit outcome
        for oid in lock(&queue).drain(..) {
            outcomes.insert(oid, Outcome::Failed("cancelled".into()));
        }
        TransferReport { outcomes }
    }

    fn push_one(&self, oid: &Oid) -> Outcome {
        if !self.cache.has(oid) {
            return Outcome::SkippedMissingAtSource;
        }
        match self.with_retries(|| self.backend.has(oid)) {
            Ok(true) => return Outcome::SkippedPresent,
            Ok(false) => {}
            Err(err) => return Outcome::Failed(err.to_string()),
        }

        let result = self.with_retries(|| {
            let mut reader = self
                .cache
                .open(oid)
                .ok_or_else(|| Error::MissingBlob(oid.to_hex()))?;
            let size = self.cache.size_of(oid).unwrap_or(0);
            self.backend.put(oid, &mut reader, size)
        });
        match result {
            Ok(()) => Outcome::Sent,
            Err(err) => Outcome::Failed(err.to_string()),
        }
    }

    fn pull_one(&self, oid: &Oid) -> Outcome {
        if self.cache.has(oid) {
            return Outcome::SkippedPresent;
        }

        let result = self.with_retries(|| {
            let Some(mut reader) = self.backend.get(oid)? else {
                return Ok(false);
            };
            let mut writer = self.cache.writer_for(oid.clone())?;
            // a broken stream is worth another attempt
            io::copy(&mut reader, &mut writer)
                .map_err(|err| Error::Transient(format!("stream interrupted: {err}")))?;
            writer.finish()?;
            Ok(true)
        });
        match result {
            Ok(true) => Outcome::Received,
            Ok(false) => Outcome::SkippedMissingAtSource,
            Err(err) => Outcome::Failed(err.to_string()),
        }
    }

    /// Retry transient failures with exponential backoff; everything
    /// else (permanent, auth, corrupt, io) surfaces immediately.
    fn with_retries<T>(&self, op: impl Fn() -> Result<T>) -> Result<T> {
        let mut delay = self.backoff;
        let mut attempt = 0;
        loop {
            match op() {
                Err(err)
                    if err.is_transient()
                        && attempt < self.retries
                        && !self.cancel.load(Ordering::Relaxed) =>
                {
                    attempt += 1;
                    warn!(
                        attempt,
                        max = self.retries,
                        "transient failure, backing off: {err}"
                    );
                    thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                }
                other => return other,
            }
        }
    }
}

/// Every hash referenced by sidecars under `paths` (everywhere when
/// empty). This is the deterministic input set for push and pull.
pub fn referenced_oids(repo: &Repo, paths: &[PathBuf]) -> Result<BTreeSet<Oid>> {
    let mut oids = BTreeSet::new();
    for sidecar in repo.find_sidecars(paths)? {
        let record = pointer::read_sidecar(&repo.root().join(&sidecar))?;
        oids.insert(record.oid().clone());
    }
    Ok(oids)
}

/// Every hash referenced by sidecars reachable from a git ref.
pub fn referenced_oids_at_ref(repo: &Repo, refname: &str) -> Result<BTreeSet<Oid>> {
    Ok(repo
        .sidecars_at_ref(refname)?
        .into_iter()
        .map(|(_, record)| record.oid().clone())
        .collect())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
