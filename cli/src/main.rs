//! Stowage CLI - inspect and edit a state store from the shell

use anyhow::bail;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::time::Duration;
use stowage_cli::{render_ttl, render_value, resolve_config, value_json, Overrides};
use stowage_core::{BackendKind, StoreConfig};
use stowage_state::{remove_database_files, StateManager};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stowage")]
#[command(about = "Stowage - persistent multi-shape state store")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to <config dir>/stowage/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Backend to use, overriding the configuration file
    #[arg(short, long, global = true)]
    backend: Option<BackendKind>,

    /// Embedded data file, overriding the configuration file
    #[arg(short, long, global = true)]
    path: Option<PathBuf>,

    /// Print collection results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log store activity to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a plain value
    Get { key: String },

    /// Store a plain value
    Set {
        key: String,
        value: String,

        /// Expire after this many seconds
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Delete a key of any shape
    Del { key: String },

    /// Check whether a key exists
    Exists { key: String },

    /// Set a hash field
    Hset {
        key: String,
        field: String,
        value: String,
    },

    /// Read a hash field
    Hget { key: String, field: String },

    /// Read every field of a hash
    Hgetall { key: String },

    /// Prepend values to a list
    Lpush {
        key: String,
        #[arg(required = true)]
        values: Vec<String>,
    },

    /// Append values to a list
    Rpush {
        key: String,
        #[arg(required = true)]
        values: Vec<String>,
    },

    /// Read a list range; negative indices count from the tail
    Lrange {
        key: String,
        #[arg(default_value_t = 0, allow_negative_numbers = true)]
        start: i64,
        #[arg(default_value_t = -1, allow_negative_numbers = true)]
        stop: i64,
    },

    /// Add members to a set
    Sadd {
        key: String,
        #[arg(required = true)]
        members: Vec<String>,
    },

    /// List the members of a set
    Smembers { key: String },

    /// Set a TTL in seconds; 0 deletes the key
    Expire { key: String, seconds: i64 },

    /// Show the remaining TTL
    Ttl { key: String },

    /// Remove a TTL
    Persist { key: String },

    /// Delete every key this store owns
    Flush {
        /// Skip the confirmation guard
        #[arg(long)]
        yes: bool,
    },

    /// Delete expired keys now
    Purge,

    /// Remove the embedded data files entirely
    Reset {
        /// Skip the confirmation guard
        #[arg(long)]
        yes: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let overrides = Overrides {
        backend: cli.backend,
        path: cli.path.clone(),
    };
    let mut config = resolve_config(cli.config.as_deref(), &overrides)?;

    match cli.command {
        Commands::Config => {
            let mut shown = config.clone();
            if shown.external.password.is_some() {
                shown.external.password = Some("***".to_string());
            }
            println!("{}", shown.to_json()?);
            return Ok(());
        }
        Commands::Reset { yes } => return reset(&config, yes),
        _ => {}
    }

    // One-shot process: `purge` sweeps explicitly instead.
    config.embedded.auto_cleanup_enabled = false;

    let manager = StateManager::open(config).await?;
    let result = execute(&manager, cli.command, cli.json).await;
    manager.close().await?;
    result
}

async fn execute(manager: &StateManager, command: Commands, json: bool) -> anyhow::Result<()> {
    match command {
        Commands::Get { key } => print_optional(manager.get(&key).await?),

        Commands::Set { key, value, ttl } => {
            manager
                .set(&key, value.as_bytes(), ttl.map(Duration::from_secs))
                .await?;
            println!("{}", "OK".green());
        }

        Commands::Del { key } => println!("{}", manager.delete(&key).await?),

        Commands::Exists { key } => println!("{}", manager.exists(&key).await?),

        Commands::Hset { key, field, value } => {
            let added = manager.hset(&key, &field, value.as_bytes()).await?;
            println!("{}", if added { "added" } else { "updated" });
        }

        Commands::Hget { key, field } => print_optional(manager.hget(&key, &field).await?),

        Commands::Hgetall { key } => {
            let mut fields: Vec<_> = manager.hgetall(&key).await?.into_iter().collect();
            fields.sort();
            if json {
                let map: serde_json::Map<_, _> = fields
                    .iter()
                    .map(|(field, value)| (field.clone(), value_json(value)))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&map)?);
            } else if fields.is_empty() {
                println!("{}", "(empty hash)".dimmed());
            } else {
                for (field, value) in fields {
                    println!("{} {}", field.cyan(), render_value(&value));
                }
            }
        }

        Commands::Lpush { key, values } => {
            let mut len = 0;
            for value in values {
                len = manager.lpush(&key, value.as_bytes()).await?;
            }
            println!("{}", len);
        }

        Commands::Rpush { key, values } => {
            let mut len = 0;
            for value in values {
                len = manager.rpush(&key, value.as_bytes()).await?;
            }
            println!("{}", len);
        }

        Commands::Lrange { key, start, stop } => {
            let items = manager.lrange(&key, start, stop).await?;
            if json {
                let list: Vec<_> = items.iter().map(|item| value_json(item)).collect();
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else if items.is_empty() {
                println!("{}", "(empty list)".dimmed());
            } else {
                for (i, item) in items.iter().enumerate() {
                    println!("{} {}", format!("{})", i).dimmed(), render_value(item));
                }
            }
        }

        Commands::Sadd { key, members } => println!("{}", manager.sadd(&key, &members).await?),

        Commands::Smembers { key } => {
            let mut members: Vec<_> = manager.smembers(&key).await?.into_iter().collect();
            members.sort();
            if json {
                println!("{}", serde_json::to_string_pretty(&members)?);
            } else if members.is_empty() {
                println!("{}", "(empty set)".dimmed());
            } else {
                for member in members {
                    println!("{}", member);
                }
            }
        }

        Commands::Expire { key, seconds } => println!("{}", manager.expire(&key, seconds).await?),

        Commands::Ttl { key } => println!("{}", render_ttl(manager.ttl(&key).await?)),

        Commands::Persist { key } => println!("{}", manager.persist(&key).await?),

        Commands::Flush { yes } => {
            if !yes {
                bail!("flush deletes every key in the store; pass --yes to confirm");
            }
            manager.flushdb().await?;
            println!("{}", "flushed".green());
        }

        Commands::Purge => {
            let removed = manager.purge_expired().await?;
            println!("purged {} expired keys", removed);
        }

        Commands::Config | Commands::Reset { .. } => {
            bail!("this command runs without an open store")
        }
    }

    Ok(())
}

fn print_optional(value: Option<Vec<u8>>) {
    match value {
        Some(bytes) => println!("{}", render_value(&bytes)),
        None => println!("{}", "(nil)".dimmed()),
    }
}

/// Delete the embedded data file and its journal siblings
fn reset(config: &StoreConfig, yes: bool) -> anyhow::Result<()> {
    if config.backend != BackendKind::Embedded {
        bail!("reset only applies to the embedded backend; use `flush --yes` instead");
    }
    if !yes {
        bail!(
            "reset removes {} permanently; pass --yes to confirm",
            config.embedded.path.display()
        );
    }
    remove_database_files(&config.embedded.path)?;
    info!(path = %config.embedded.path.display(), "embedded store reset");
    println!("{} {}", "removed".yellow(), config.embedded.path.display());
    Ok(())
}
