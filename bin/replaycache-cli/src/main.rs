//! ReplayCache CLI - operator command line interface
//!
//! Inspects and edits a cache directory directly. The store must not be open
//! in another process at the same time.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use replaycache_common::{CachedResponse, Config, EngineType, KeyAlgorithm, Layout};
use replaycache_meta_store::{MetaStore, ResponseStore};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "replaycache-cli")]
#[command(about = "ReplayCache operator CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "replaycache.toml", env = "REPLAYCACHE_CONFIG")]
    config: PathBuf,

    /// Cache directory (overrides the config file)
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Storage engine: embedded-ordered, embedded-lsm or in-memory
    #[arg(long)]
    engine: Option<EngineType>,

    /// Shard layout: per-identifier or shared
    #[arg(long)]
    layout: Option<Layout>,

    /// Secondary key digest: sha256 or sha512
    #[arg(long)]
    key_algorithm: Option<KeyAlgorithm>,

    /// Log level (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record a value for a request
    Put {
        /// Cache identifier (request URL)
        identifier: String,
        /// Request body
        body: String,
        /// Value to record
        value: String,
        /// Wrap the value in a cached response with this status code
        #[arg(long)]
        status: Option<u16>,
    },
    /// Look up the value recorded for a request
    Get {
        /// Cache identifier (request URL)
        identifier: String,
        /// Request body
        body: String,
        /// Print the value as hex
        #[arg(long)]
        hex: bool,
        /// Decode the value as a cached response
        #[arg(long, conflicts_with = "hex")]
        response: bool,
    },
    /// Count the entries recorded for an identifier
    Len {
        /// Cache identifier (request URL)
        identifier: String,
    },
    /// Remove the value recorded for a request
    Delete {
        /// Cache identifier (request URL)
        identifier: String,
        /// Request body
        body: String,
    },
    /// List identifiers that have a shard
    List,
    /// Show store statistics as JSON
    Stats,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if let Some(dir) = args.dir {
        config.cache.dir = dir;
    }
    if let Some(engine) = args.engine {
        config.cache.engine = engine;
    }
    if let Some(layout) = args.layout {
        config.cache.layout = layout;
    }
    if let Some(key_algorithm) = args.key_algorithm {
        config.cache.key_algorithm = key_algorithm;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());
    if config.logging.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let store = MetaStore::open(config.cache)?;
    let result = run(&store, args.command);

    if let Err(e) = store.close() {
        error!("{}", e);
        if result.is_ok() {
            return Err(e.into());
        }
    }
    result
}

fn run(store: &MetaStore, command: Commands) -> Result<()> {
    match command {
        Commands::Put {
            identifier,
            body,
            value,
            status,
        } => {
            if let Some(status) = status {
                let response = CachedResponse::new(status, value);
                store.store_response(&identifier, body.as_bytes(), &response)?;
            } else {
                store.put(&identifier, body.as_bytes(), value.as_bytes())?;
            }
            info!("Recorded value for {}", identifier);
        }
        Commands::Get {
            identifier,
            body,
            hex,
            response,
        } => {
            if response {
                match store.lookup_response(&identifier, body.as_bytes())? {
                    Some(response) => {
                        println!("Status: {}", response.status);
                        for (name, value) in &response.headers {
                            println!("{name}: {value}");
                        }
                        println!();
                        println!("{}", String::from_utf8_lossy(&response.body));
                    }
                    None => println!("(miss)"),
                }
                return Ok(());
            }
            match store.get(&identifier, body.as_bytes())? {
                Some(value) if hex => println!("{}", hex::encode(value)),
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("(miss)"),
            }
        }
        Commands::Len { identifier } => {
            println!("{}", store.len(&identifier)?);
        }
        Commands::Delete { identifier, body } => {
            store.delete(&identifier, body.as_bytes())?;
            info!("Deleted value for {}", identifier);
        }
        Commands::List => {
            let mut identifiers = store.identifiers()?;
            identifiers.sort();
            if identifiers.is_empty() {
                println!("No identifiers found");
            }
            for identifier in identifiers {
                println!("{identifier}");
            }
        }
        Commands::Stats => {
            let stats = store.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}
