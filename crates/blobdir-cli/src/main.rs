//! blobdir operator CLI.
//!
//! Inspect and manipulate a remote-backed index directory.
//!
//! Usage:
//!   blobdir --config dir.ron ls
//!   blobdir --config dir.ron cat segments_1 > segments_1
//!   blobdir --config dir.ron put _0.cfs ./_0.cfs
//!   blobdir --config dir.ron --read-only status
//!   blobdir --config dir.ron lock write.lock --hold-secs 30

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use blobdir_core::{BlobDirectory, DirectoryConfig, obtain_with_timeout};

/// Operator CLI for remote-backed index directories.
#[derive(Parser, Debug)]
#[command(name = "blobdir")]
#[command(about = "Inspect and manage a blob-backed index directory")]
struct Args {
    /// RON config file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Open without mutating anything
    #[arg(long)]
    read_only: bool,

    /// Override the root folder from the config
    #[arg(long)]
    root_folder: Option<String>,

    /// Override the local cache directory from the config
    #[arg(long)]
    cache_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List files with their lengths
    Ls,
    /// Write a file's content to stdout
    Cat { name: String },
    /// Upload a local file into the directory
    Put { name: String, path: PathBuf },
    /// Delete a file
    Rm { name: String },
    /// Show sync state and generations
    Status,
    /// Take a write lock, hold it, then release it
    Lock {
        name: String,
        /// How long to hold the lock
        #[arg(long, default_value_t = 0)]
        hold_secs: u64,
        /// How long to wait for a busy lock
        #[arg(long, default_value_t = 0)]
        wait_secs: u64,
    },
    /// Record the current file set as a manifest
    Snapshot,
    /// Delete manifests past their retention
    Gc,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let dir = BlobDirectory::open(&config)
        .await
        .with_context(|| format!("opening {}", config.connection))?;

    match args.command {
        Command::Ls => {
            for name in dir.list().await? {
                let len = dir.length(&name).await?;
                println!("{len:>12}  {name}");
            }
        }
        Command::Cat { name } => {
            let input = dir.open_input(&name).await?;
            let data = input.read_all().await?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&data).await?;
            stdout.flush().await?;
        }
        Command::Put { name, path } => {
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let mut out = dir.create_output(&name).await?;
            out.write(&data).await?;
            let len = out.close().await?;
            tracing::info!(name = %name, bytes = len, "uploaded");
        }
        Command::Rm { name } => {
            dir.delete(&name).await?;
        }
        Command::Status => {
            let in_sync = dir.refresh().await;
            let (local, remote) = dir.generations();
            println!("location:    {}", dir.lock_id());
            println!("read-only:   {}", dir.is_read_only());
            println!("in sync:     {in_sync}");
            println!("generations: local {local}, remote {remote}");
        }
        Command::Lock {
            name,
            hold_secs,
            wait_secs,
        } => {
            let lock = dir.make_lock(&name);
            if wait_secs > 0 {
                obtain_with_timeout(
                    lock.as_ref(),
                    Duration::from_secs(wait_secs),
                    Duration::from_secs(1),
                )
                .await?;
            } else if !lock.obtain().await? {
                bail!("{} is held elsewhere", lock.name());
            }
            println!("obtained {}", lock.name());
            if hold_secs > 0 {
                tokio::time::sleep(Duration::from_secs(hold_secs)).await;
            }
            lock.release().await?;
            println!("released {}", lock.name());
        }
        Command::Snapshot => {
            let manifest = dir.commit_manifest().await?;
            println!("{} ({} files)", manifest.id, manifest.entries.len());
        }
        Command::Gc => {
            let removed = dir.collect_manifests().await?;
            for id in &removed {
                println!("removed {id}");
            }
            tracing::info!(count = removed.len(), "manifest gc done");
        }
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<DirectoryConfig> {
    let mut config = match &args.config {
        Some(path) => DirectoryConfig::load(path)?,
        None => DirectoryConfig::default(),
    };
    if args.read_only {
        config.read_only = true;
    }
    if let Some(root) = &args.root_folder {
        config.root_folder = root.clone();
    }
    if let Some(cache) = &args.cache_root {
        config.cache_root = Some(cache.clone());
    }
    config.validate()?;
    Ok(config)
}
