//! The `lfc` command-line interface.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};

use lfc::reconcile::{self, AddOutcome, Mode};
use lfc::remote::{self, Timeouts};
use lfc::transfer::{self, Engine, Outcome, TransferReport};
use lfc::{repo, Error, Oid, Repo};

#[derive(Parser)]
#[command(
    name = "lfc",
    version,
    about = "Track large files in git through content-addressed pointer records",
    long_about = "Large File Control keeps big or binary files out of the git object \
    database. A tracked file is committed as a small pointer record (<path>.lfc); the \
    bytes live in .lfc/cache/ and in remote caches reachable over a local path, ssh, \
    or http(s)."
)]
struct Cli {
    /// Remote to talk to instead of the configured default
    #[arg(short = 'r', long, global = true)]
    remote: Option<String>,

    /// Number of concurrent transfer workers
    #[arg(short = 'j', long, global = true)]
    jobs: Option<usize>,

    /// What remains in the working tree after add
    #[arg(long, global = true, value_enum)]
    mode: Option<ModeArg>,

    /// Discard local modifications when checking out
    #[arg(long, global = true)]
    force: bool,

    /// Only report failures
    #[arg(short, long, global = true)]
    quiet: bool,

    /// More diagnostics (repeatable)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    /// Remove the original; only the sidecar remains
    Pointer,
    /// Replace the original with a link to the cache blob
    Link,
    /// Keep an independent copy of the original
    Copy,
}

impl From<ModeArg> for Mode {
    fn from(arg: ModeArg) -> Mode {
        match arg {
            ModeArg::Pointer => Mode::Pointer,
            ModeArg::Link => Mode::Link,
            ModeArg::Copy => Mode::Copy,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize large-file state in the current git repository
    Init,
    /// Track one or more files
    Add {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Fetch referenced blobs from a remote and materialize files
    Pull { paths: Vec<PathBuf> },
    /// Upload referenced blobs to a remote
    Push { paths: Vec<PathBuf> },
    /// git-clone a repository and pull its large files
    Clone {
        url: String,
        dir: Option<PathBuf>,
    },
    /// Materialize files from the local cache
    Checkout { paths: Vec<PathBuf> },
    /// Classify every tracked file
    Status,
    /// Manage remote caches
    Remote {
        #[command(subcommand)]
        command: RemoteCommands,
    },
    /// Read or write configuration options
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Print the resolved hash for a tracked file
    Show {
        path: PathBuf,
        /// Resolve the sidecar at a git ref instead of the working tree
        #[arg(long)]
        r#ref: Option<String>,
        /// Stream the blob bytes instead of the hash
        #[arg(long)]
        cat: bool,
    },
    /// List every hash present at a remote
    LsRemote { name: Option<String> },
    /// List tracked sidecar paths
    LsFiles { paths: Vec<PathBuf> },
}

#[derive(Subcommand)]
enum RemoteCommands {
    /// Add a named remote
    Add {
        name: String,
        url: String,
        /// Also make it the default remote
        #[arg(short, long)]
        default: bool,
    },
    /// Remove a remote
    Remove { name: String },
    /// Change a remote's URL
    SetUrl { name: String, url: String },
    /// Show configured remotes
    List,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print one option
    Get { key: String },
    /// Set one option
    Set { key: String, value: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("lfc: {err:#}");
            let code = err
                .downcast_ref::<Error>()
                .map(Error::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<u8> {
    match &cli.command {
        Commands::Init => {
            let repo = open_repo()?;
            repo.init()?;
            if !cli.quiet {
                println!(
                    "initialized large-file state in {}",
                    repo.root().join(repo::LFC_DIR).display()
                );
            }
            Ok(0)
        }

        Commands::Add { paths } => {
            let repo = open_repo()?;
            let mode = cli.mode.map(Mode::from).unwrap_or_default();
            for path in paths {
                let outcome = reconcile::add(&repo, path, mode)
                    .with_context(|| format!("adding '{}'", path.display()))?;
                if !cli.quiet {
                    match outcome {
                        AddOutcome::Added(oid) => println!("added {} ({oid})", path.display()),
                        AddOutcome::Unchanged(_) => {
                            println!("up to date {}", path.display())
                        }
                    }
                }
            }
            Ok(0)
        }

        Commands::Push { paths } => {
            let repo = open_repo()?;
            let rels = rel_paths(&repo, paths)?;
            let oids = transfer::referenced_oids(&repo, &rels)?;
            let engine = engine_for(&repo, cli)?;
            let report = engine.push(oids);
            print_report(&report, cli.quiet);
            Ok(if report.success() { 0 } else { 3 })
        }

        Commands::Pull { paths } => {
            let repo = open_repo()?;
            let rels = rel_paths(&repo, paths)?;
            let oids = transfer::referenced_oids(&repo, &rels)?;
            pull_and_checkout(&repo, cli, &rels, oids)
        }

        Commands::Clone { url, dir } => {
            let target = repo::git_clone(url, dir.as_deref())?;
            let repo = Repo::open(&target);
            if !repo.root().join(repo::LFC_DIR).exists()
                && repo.find_sidecars(&[])?.is_empty()
            {
                // not an lfc repository; plain clone is all there is to do
                return Ok(0);
            }
            repo.init()?;
            if !repo.config()?.auto_pull {
                return Ok(0);
            }
            match repo.resolve_remote(cli.remote.as_deref()) {
                Ok(_) => {
                    // the hash set for a clone comes from the sidecars at
                    // the cloned ref, not from whatever is on disk
                    let oids = transfer::referenced_oids_at_ref(&repo, "HEAD")?;
                    pull_and_checkout(&repo, cli, &[], oids)
                }
                Err(err) => {
                    eprintln!("lfc: not pulling large files: {err}");
                    Ok(0)
                }
            }
        }

        Commands::Checkout { paths } => {
            let repo = open_repo()?;
            let rels = rel_paths(&repo, paths)?;
            let report = reconcile::checkout(&repo, &rels, cli.force)?;
            print_checkout(&report, cli.quiet);
            Ok(if report.missing.is_empty() { 0 } else { 1 })
        }

        Commands::Status => {
            let repo = open_repo()?;
            let report = reconcile::status(&repo)?;
            for (path, state) in &report.entries {
                println!("{:<12} {}", state.label(), path.display());
            }
            for path in &report.strays {
                println!("{:<12} {}", "stray", path.display());
            }
            Ok(0)
        }

        Commands::Remote { command } => {
            let repo = open_repo()?;
            run_remote(&repo, command, cli.quiet)
        }

        Commands::Config { command } => {
            let repo = open_repo()?;
            match command {
                ConfigCommands::Get { key } => {
                    let value = repo.config()?.get(key).ok_or_else(|| {
                        Error::Usage(format!("no config option '{key}'"))
                    })?;
                    println!("{value}");
                }
                ConfigCommands::Set { key, value } => {
                    let mut config = repo.config()?;
                    config.set(key, value)?;
                    repo.save_config(&config)?;
                }
            }
            Ok(0)
        }

        Commands::Show { path, r#ref, cat } => {
            let repo = open_repo()?;
            let record = reconcile::resolve_record(&repo, path, r#ref.as_deref())?;
            if *cat {
                let mut reader = reconcile::open_blob(&repo, record.oid())?;
                let stdout = io::stdout();
                let mut out = stdout.lock();
                io::copy(&mut reader, &mut out)?;
            } else {
                println!("{}", record.oid());
            }
            Ok(0)
        }

        Commands::LsRemote { name } => {
            let repo = open_repo()?;
            let wanted = name.as_deref().or(cli.remote.as_deref());
            let (_, spec) = repo.resolve_remote(wanted)?;
            let backend = remote::open_backend(repo.root(), &spec, Timeouts::default())?;
            for oid in backend.list()? {
                println!("{oid}");
            }
            Ok(0)
        }

        Commands::LsFiles { paths } => {
            let repo = open_repo()?;
            let rels = rel_paths(&repo, paths)?;
            for sidecar in repo.find_sidecars(&rels)? {
                println!("{}", sidecar.display());
            }
            Ok(0)
        }
    }
}

fn open_repo() -> anyhow::Result<Repo> {
    Ok(Repo::discover(Path::new("."))?)
}

fn rel_paths(repo: &Repo, paths: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    paths
        .iter()
        .map(|p| Ok(repo.rel(p)?))
        .collect::<anyhow::Result<Vec<_>>>()
}

fn engine_for<'a>(repo: &'a Repo, cli: &Cli) -> anyhow::Result<Engine<'a>> {
    let (name, spec) = repo.resolve_remote(cli.remote.as_deref())?;
    let backend = remote::open_backend(repo.root(), &spec, Timeouts::default())
        .with_context(|| format!("opening remote '{name}'"))?;
    Ok(Engine::new(repo.cache(), backend, repo.jobs(cli.jobs)))
}

/// Fetch the given blobs, then materialize the working tree.
fn pull_and_checkout(
    repo: &Repo,
    cli: &Cli,
    rels: &[PathBuf],
    oids: BTreeSet<Oid>,
) -> anyhow::Result<u8> {
    let engine = engine_for(repo, cli)?;
    let report = engine.pull(oids);
    print_report(&report, cli.quiet);

    let checkout = reconcile::checkout(repo, rels, cli.force)?;
    print_checkout(&checkout, cli.quiet);

    if !report.success() {
        return Ok(3);
    }
    Ok(if checkout.missing.is_empty() { 0 } else { 1 })
}

fn print_report(report: &TransferReport, quiet: bool) {
    for (oid, outcome) in report.iter() {
        match outcome {
            Outcome::Failed(reason) => eprintln!("failed {oid}: {reason}"),
            other if !quiet => println!("{} {oid}", other.label()),
            _ => {}
        }
    }
}

fn print_checkout(report: &reconcile::CheckoutReport, quiet: bool) {
    if !quiet {
        for path in &report.materialized {
            println!("materialized {}", path.display());
        }
    }
    for (path, oid) in &report.missing {
        eprintln!("missing {} ({oid})", path.display());
    }
}

fn run_remote(repo: &Repo, command: &RemoteCommands, quiet: bool) -> anyhow::Result<u8> {
    let mut config = repo.config()?;
    match command {
        RemoteCommands::Add { name, url, default } => {
            config.set(&format!("remote.{name}"), url)?;
            if *default {
                config.default_remote = Some(name.clone());
            }
            repo.save_config(&config)?;
        }
        RemoteCommands::Remove { name } => {
            if config.remotes.remove(name).is_none() {
                return Err(Error::NoSuchRemote(name.clone()).into());
            }
            if config.default_remote.as_deref() == Some(name.as_str()) {
                config.default_remote = None;
            }
            repo.save_config(&config)?;
        }
        RemoteCommands::SetUrl { name, url } => {
            let spec = config
                .remotes
                .get_mut(name)
                .ok_or_else(|| Error::NoSuchRemote(name.clone()))?;
            spec.url = url.clone();
            repo.save_config(&config)?;
        }
        RemoteCommands::List => {
            for (name, spec) in &config.remotes {
                let marker = if config.default_remote.as_deref() == Some(name.as_str()) {
                    " (default)"
                } else {
                    ""
                };
                if quiet {
                    println!("{name}");
                } else {
                    println!("{name}\t{}{marker}", spec.url);
                }
            }
        }
    }
    Ok(0)
}

fn init_tracing(verbose: u8, quiet: bool) {
    let level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(format!("lfc={level}"))
        .with_target(false)
        .with_writer(io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
