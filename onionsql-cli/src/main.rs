//! `onionsql` CLI tool for key management and metadata inspection.

#![warn(clippy::pedantic, clippy::nursery)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use onionsql::schema::mirror::MetaMirror;
use onionsql_key_file::FileKeyProvider;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "onionsql")]
#[command(about = "onionsql key and metadata CLI", long_about = None)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new master key
    Keygen {
        /// Output directory for the key
        #[arg(short, long, default_value = "./keys")]
        output: PathBuf,
    },
    /// Print the tables, fields and onion levels recorded in a metadata mirror
    Inspect {
        /// Metadata mirror file
        #[arg(short, long)]
        metadata: PathBuf,
    },
    /// List onion adjustments that were started but never completed
    Pending {
        /// Metadata mirror file
        #[arg(short, long)]
        metadata: PathBuf,
    },
    /// Settle an interrupted adjustment after checking the live store
    Resolve {
        /// Metadata mirror file
        #[arg(short, long)]
        metadata: PathBuf,
        /// Intent id, as listed by `pending`
        id: i64,
        /// The peel reached the store: record the lower level
        #[arg(long)]
        applied: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose { "onionsql=debug" } else { "onionsql=info" })
    });
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    match cli.command {
        Commands::Keygen { output } => {
            let provider = FileKeyProvider::init(&output)
                .with_context(|| format!("creating master key in {}", output.display()))?;
            info!(path = %provider.key_path().display(), "generated master key");
            println!("{}", provider.key_path().display());
        }
        Commands::Inspect { metadata } => {
            let schema = open_mirror(&metadata)?.load().context("loading metadata")?;
            for (database, db) in schema.databases() {
                for table in db.tables() {
                    println!("{database}.{} ({})", table.name(), table.anon_name());
                    for field in table.fields() {
                        let salt = field.salt_name().unwrap_or("-");
                        println!("  {} {} {} salt={salt}", field.name(), field.sql_type().tag(), field.layout().tag());
                        for (onion, om) in field.onions() {
                            println!("    {:<6} {:<8} {}", onion.tag(), om.level().tag(), om.anon_name());
                        }
                    }
                }
            }
        }
        Commands::Pending { metadata } => {
            let pending = open_mirror(&metadata)?.pending_adjustments().context("reading adjustment log")?;
            if pending.is_empty() {
                println!("no interrupted adjustments");
            }
            for p in pending {
                println!("#{} {} {} -> {}", p.id, p.onion, p.from, p.to);
            }
        }
        Commands::Resolve { metadata, id, applied } => {
            let mut mirror = open_mirror(&metadata)?;
            let pending = mirror.pending_adjustments().context("reading adjustment log")?;
            let p = pending
                .into_iter()
                .find(|p| p.id == id)
                .with_context(|| format!("no pending adjustment #{id}"))?;
            if applied {
                mirror.finish_peel(p.id, &p.onion, p.from, p.to).context("recording peel")?;
                info!(onion = %p.onion, from = %p.from, to = %p.to, "adjustment recorded");
            } else {
                mirror.abort_adjustment(p.id).context("discarding intent")?;
                info!(onion = %p.onion, level = %p.from, "adjustment discarded");
            }
        }
    }
    Ok(())
}

fn open_mirror(path: &std::path::Path) -> Result<MetaMirror> {
    anyhow::ensure!(path.exists(), "metadata mirror {} does not exist", path.display());
    MetaMirror::open(Some(path)).with_context(|| format!("opening {}", path.display()))
}
