//! MarketSync CLI — replay blocks and manage database files.
//!
//! # Commands
//! ```bash
//! marketsync replay     --blocks blocks.json --network 1 --upload-block 5926223 --universe 0x…
//! marketsync export     --network 1 --out ./snapshots
//! marketsync import     --file <hash>-1-1.warp
//! marketsync db-version --network 1
//! marketsync reset      --network 1
//! marketsync info
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use marketsync_core::NodeConfig;
use marketsync_storage::snapshot::{
    database_path, highest_db_version, import_snapshot, retire_database, WarpFileName,
};
use marketsync_storage::{export_snapshot, Store, SCHEMA_VERSION};

mod cmd_replay;
mod logging;

use logging::{init_tracing, LogConfig};

#[derive(Parser)]
#[command(
    name = "marketsync",
    about = "MarketSync: materialize market state from chain logs into SQLite",
    long_about = "
MarketSync CLI: replay decoded blocks into a SQLite store, move warp snapshots
between nodes, and manage database files.

ENVIRONMENT VARIABLES:
  MARKETSYNC_DATABASE_DIR   Directory for database files and warp snapshots
  IS_WARP_SYNC              \"true\" to export a snapshot every WARP_EXPORT_INTERVAL blocks
  BLOCKS_PER_CHUNK          Blocks per bulk-sync chunk (default 720)
  MAX_REQUEST_RETRIES       Chain request retries after the first attempt
  MAX_SYSTEM_RETRIES        Node restarts allowed after fatal errors
  RESTART_DELAY_MS          Delay between restarts
  RUST_LOG                  Overrides --log-level
",
    version
)]
struct Cli {
    /// Database directory (overrides MARKETSYNC_DATABASE_DIR)
    #[arg(long, global = true)]
    database_dir: Option<PathBuf>,

    /// Log level: trace | debug | info | warn | error
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit JSON logs
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bulk-sync a JSON file of decoded blocks, then report progress
    Replay {
        /// JSON array of `{ block, logs }` objects
        #[arg(long)]
        blocks: PathBuf,
        /// Network id the blocks belong to
        #[arg(long, default_value = "1")]
        network: String,
        /// Contract upload block (sync starts here on an empty database)
        #[arg(long)]
        upload_block: u64,
        /// Genesis universe address
        #[arg(long, default_value = "0x0000000000000000000000000000000000000000")]
        universe: String,
        /// Keep running under the supervisor until Ctrl-C
        #[arg(long)]
        follow: bool,
    },

    /// Export the network's database as a warp snapshot
    Export {
        #[arg(long, default_value = "1")]
        network: String,
        /// Destination directory (default: the database directory)
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Replace the database with a warp snapshot (the node must be stopped)
    Import {
        /// `<sha256>-<network>-<version>.warp`
        #[arg(long)]
        file: PathBuf,
    },

    /// Show the schema version of this build and of the files on disk
    #[command(name = "db-version")]
    DbVersion {
        #[arg(long, default_value = "1")]
        network: String,
    },

    /// Move the network's database aside so the next run starts empty
    Reset {
        #[arg(long, default_value = "1")]
        network: String,
    },

    /// Show build and configuration info
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&LogConfig {
        level: cli.log_level.clone(),
        json: cli.log_json,
        ..Default::default()
    });

    let mut config = NodeConfig::from_env().context("invalid environment configuration")?;
    if let Some(dir) = cli.database_dir {
        config.database_dir = dir;
    }

    match cli.command {
        Commands::Replay {
            blocks,
            network,
            upload_block,
            universe,
            follow,
        } => {
            cmd_replay::run(
                config,
                &blocks,
                cmd_replay::Deployment {
                    network,
                    upload_block,
                    universe,
                },
                follow,
            )
            .await
        }
        Commands::Export { network, out } => cmd_export(&config, &network, out).await,
        Commands::Import { file } => cmd_import(&config, &file).await,
        Commands::DbVersion { network } => cmd_db_version(&config, &network).await,
        Commands::Reset { network } => cmd_reset(&config, &network).await,
        Commands::Info => cmd_info(&config),
    }
}

// ─── Command implementations ─────────────────────────────────────────────────

async fn cmd_export(config: &NodeConfig, network: &str, out: Option<PathBuf>) -> Result<()> {
    let db = database_path(&config.database_dir, network, SCHEMA_VERSION);
    if !db.exists() {
        anyhow::bail!("no database at {}", db.display());
    }
    let store = Store::open(&db, network)
        .await
        .with_context(|| format!("opening {}", db.display()))?;
    let dest = out.unwrap_or_else(|| config.database_dir.clone());
    let path = export_snapshot(&store, SCHEMA_VERSION, &dest)
        .await
        .context("warp export failed")?;
    store.close().await;
    println!("{}", path.display());
    Ok(())
}

async fn cmd_import(config: &NodeConfig, file: &std::path::Path) -> Result<()> {
    let name = WarpFileName::parse(file).context("not a warp snapshot file name")?;
    let db = database_path(&config.database_dir, &name.network_id, SCHEMA_VERSION);
    std::fs::create_dir_all(&config.database_dir)
        .with_context(|| format!("creating {}", config.database_dir.display()))?;
    let retired = import_snapshot(&db, &name.network_id, SCHEMA_VERSION, file)
        .await
        .with_context(|| format!("importing {}", file.display()))?;

    println!("Imported {} → {}", file.display(), db.display());
    if let Some(old) = retired {
        println!("Previous database kept at {}", old.display());
    }
    Ok(())
}

async fn cmd_db_version(config: &NodeConfig, network: &str) -> Result<()> {
    let on_disk = highest_db_version(&config.database_dir, network).await?;
    println!("System DB version: {SCHEMA_VERSION}");
    match on_disk {
        Some(v) => println!("Highest DB version on disk: {v}"),
        None => println!("Highest DB version on disk: none"),
    }
    Ok(())
}

async fn cmd_reset(config: &NodeConfig, network: &str) -> Result<()> {
    let db = database_path(&config.database_dir, network, SCHEMA_VERSION);
    match retire_database(&db).await? {
        Some(old) => println!("Database moved to {}", old.display()),
        None => println!("No database at {}", db.display()),
    }
    Ok(())
}

fn cmd_info(config: &NodeConfig) -> Result<()> {
    println!("MarketSync v{}", env!("CARGO_PKG_VERSION"));
    println!("  Schema version:            {SCHEMA_VERSION}");
    println!("  Database directory:        {}", config.database_dir.display());
    println!("  Blocks per chunk:          {}", config.blocks_per_chunk);
    println!("  Request retries:           {}", config.max_request_retries);
    println!("  System restarts:           {}", config.max_system_retries);
    println!(
        "  Warp export:               {}",
        if config.warp_sync {
            format!("every {} blocks", config.warp_export_interval)
        } else {
            "off".to_string()
        }
    );
    println!(
        "  Designated reporting:      {} s",
        config.designated_reporting_duration_secs
    );
    Ok(())
}
