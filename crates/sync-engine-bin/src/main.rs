//! realtime-sync - Watch server-owned collections and inspect the local cache.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sync_config_and_utils::{init_logging, init_logging_for_service, Config, Paths};

/// realtime-sync command-line interface.
#[derive(Parser)]
#[command(name = "realtime-sync")]
#[command(about = "Keep a local cache of server-owned collections in sync with a change feed")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for runtime files (config, cache, logs). Defaults to ~/.realtime-sync
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to a resource and print every snapshot
    Watch {
        /// Resource key (e.g., orders)
        resource: String,
        /// Initial records as a JSON array, used when nothing is cached
        #[arg(long)]
        seed: Option<String>,
        /// Change-feed URL (overrides config)
        #[arg(long, env = "REALTIME_SYNC_FEED_URL")]
        url: Option<String>,
    },
    /// Inspect or clear the local cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// List cached keys
    List,
    /// Print a cached value
    Get {
        /// Cache key
        key: String,
    },
    /// Remove one key, or everything when no key is given
    Clear {
        /// Cache key
        key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let mut config = Config::load(&paths)?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    // Long-running watches also log to <base>/logs/realtime-sync.jsonl
    match &cli.command {
        Commands::Watch { .. } => {
            init_logging_for_service("realtime-sync", &config.log_level, Some(paths.log_file()))
        }
        Commands::Cache { .. } => init_logging(&config.log_level),
    }

    match cli.command {
        Commands::Watch {
            resource,
            seed,
            url,
        } => {
            if let Some(url) = url {
                config.feed_url = url;
            }
            commands::watch(&config, &paths, &resource, seed.as_deref()).await?;
        }
        Commands::Cache { command } => {
            let cache = commands::open_cache(&config, &paths)?;
            match command {
                CacheCommands::List => commands::cache_list(&cache),
                CacheCommands::Get { key } => commands::cache_get(&cache, &key)?,
                CacheCommands::Clear { key } => commands::cache_clear(&cache, key.as_deref()),
            }
        }
    }

    Ok(())
}
