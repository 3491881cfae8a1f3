//! shardlog Inspector
//!
//! Prints what an existing sharded log DB holds. Shards are opened the way
//! a writer opens them, so the data directories must not be in use.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use shardlog::sharded::check_existing_dirs;
use shardlog::{Config, EntryFormat, ShardedDb};
use tracing_subscriber::{fmt, EnvFilter};

/// shardlog inspector
#[derive(Parser, Debug)]
#[command(name = "shardlog-inspect")]
#[command(about = "Inspect a shardlog data directory")]
#[command(version)]
struct Args {
    /// Existing data directories (one shared by all shards, or one per shard)
    #[arg(short, long, required = true, num_args = 1..)]
    dir: Vec<PathBuf>,

    /// Number of shards the directory was created with
    #[arg(short, long, default_value = "16")]
    shards: u64,

    /// Entry format to assume for shards without entries
    #[arg(long)]
    batched: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List every bootstrap record
    Bootstrap,

    /// Show the persistent state and entry span of a replica
    State {
        group: u64,
        member: u64,

        /// Snapshot index the entry span starts after
        #[arg(long, default_value = "0")]
        snapshot_index: u64,
    },

    /// Print entries of a replica in [low, high)
    Entries {
        group: u64,
        member: u64,
        low: u64,
        high: u64,

        /// Maximum total entry size in bytes
        #[arg(long, default_value_t = u64::MAX)]
        max_size: u64,
    },

    /// Show the retained snapshot of a replica
    Snapshot { group: u64, member: u64 },
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,shardlog=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let format = if args.batched {
        EntryFormat::Batched
    } else {
        EntryFormat::Plain
    };
    let config = Config::builder()
        .shards(args.shards)
        .entry_format(format)
        .build();

    if let Err(e) = check_existing_dirs(args.shards, &args.dir) {
        tracing::error!("{}", e);
        process::exit(1);
    }

    let db = match ShardedDb::open(config, &args.dir[..]) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!("Failed to open log DB: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run(&db, args.command) {
        tracing::error!("{}", e);
        process::exit(1);
    }

    if let Err(e) = db.close() {
        tracing::error!("Failed to close log DB: {}", e);
        process::exit(1);
    }
}

fn run(db: &ShardedDb, command: Commands) -> shardlog::Result<()> {
    match command {
        Commands::Bootstrap => {
            let records = db.list_all_bootstrap_info()?;
            for (replica, bootstrap) in &records {
                println!(
                    "{} join={} type={:?} members={}",
                    replica,
                    bootstrap.join,
                    bootstrap.state_machine_type,
                    bootstrap.addresses.len()
                );
            }
            println!("{} replica(s)", records.len());
        }
        Commands::State {
            group,
            member,
            snapshot_index,
        } => {
            let rs = db.read_raft_state(group, member, snapshot_index)?;
            println!(
                "term={} vote={} commit={} first_index={} entries={}",
                rs.state.term, rs.state.vote, rs.state.commit, rs.first_index, rs.entry_count
            );
        }
        Commands::Entries {
            group,
            member,
            low,
            high,
            max_size,
        } => {
            let (entries, size) = db.iterate_entries(group, member, low, high, max_size)?;
            for entry in &entries {
                println!(
                    "{:>10} term={} type={:?} cmd={}B",
                    entry.index,
                    entry.term,
                    entry.entry_type,
                    entry.cmd.len()
                );
            }
            println!("{} entries, {} bytes", entries.len(), size);
        }
        Commands::Snapshot { group, member } => {
            let ss = db.get_snapshot(group, member)?;
            println!(
                "index={} term={} type={:?} file={} size={} imported={}",
                ss.index, ss.term, ss.state_machine_type, ss.filepath, ss.file_size, ss.imported
            );
        }
    }
    Ok(())
}
