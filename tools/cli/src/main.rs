//! Ferry CLI - inspect and drive an offline-first sync store.
//!
//! This tool opens the same durable store an application uses, so queued
//! writes, dead letters and cached snapshots can be inspected, repaired and
//! flushed from the command line.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ferry_common::{Method, OperationId, Priority};
use ferry_storage::{create_default_registry, DurableStore};
use ferry_sync::{
    ConnectivityMonitor, ConnectivityState, EngineConfig, HttpTransport, MutationQueue, OperationDraft,
    QueueOptions, QueuedOperation, ReadThroughCache, SyncEngine,
};

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "Ferry - offline-first sync queue and cache")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Engine configuration file (JSON).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Durable store backend.
    #[arg(long, value_enum, default_value_t = StoreKind::Sqlite, global = true)]
    store: StoreKind,

    /// Directory holding the store (default: platform data dir).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Memory,
    Local,
    Sqlite,
}

impl StoreKind {
    fn name(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Local => "local",
            Self::Sqlite => "sqlite",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List queued operations in drain order.
    Pending {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// List terminally failed operations.
    DeadLetters {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Queue a write for the next sync.
    Enqueue {
        /// HTTP method.
        #[arg(short, long)]
        method: Method,

        /// Target path or URL.
        #[arg(short, long)]
        target: String,

        /// Request body.
        #[arg(short, long)]
        body: Option<String>,

        /// Header as NAME:VALUE; repeatable.
        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Drain priority: high, medium or low.
        #[arg(short, long, default_value = "medium")]
        priority: Priority,

        /// Cache key to invalidate once delivered; repeatable.
        #[arg(short, long)]
        invalidates: Vec<String>,
    },

    /// Move a dead letter back to the queue.
    Requeue {
        /// Operation id.
        id: String,
    },

    /// Delete a dead letter.
    Discard {
        /// Operation id.
        id: String,
    },

    /// Drain the queue once against a backend.
    Sync {
        /// Backend base URL.
        #[arg(short, long)]
        base_url: String,
    },

    /// Inspect or drop cached snapshots.
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Print a shell completion script.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Show the snapshot stored for a key.
    Show {
        key: String,
    },

    /// Drop the snapshot stored for a key.
    Invalidate {
        key: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let level = if cli.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        };
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "ferry", &mut std::io::stdout());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let store = open_store(cli.store, cli.data_dir.as_deref())?;

    match cli.command {
        Commands::Pending { json } => cmd_pending(store, &config, json).await,

        Commands::DeadLetters { json } => cmd_dead_letters(store, &config, json).await,

        Commands::Enqueue {
            method,
            target,
            body,
            headers,
            priority,
            invalidates,
        } => {
            let mut draft = OperationDraft::new(method, target).with_priority(priority);
            if let Some(body) = body {
                draft = draft.with_body(body);
            }
            for (name, value) in headers {
                draft = draft.with_header(name, value);
            }
            for key in invalidates {
                draft = draft.invalidates(key);
            }
            cmd_enqueue(store, &config, draft).await
        }

        Commands::Requeue { id } => cmd_requeue(store, &config, &id).await,

        Commands::Discard { id } => cmd_discard(store, &config, &id).await,

        Commands::Sync { base_url } => cmd_sync(store, config, &base_url).await,

        Commands::Cache { command } => match command {
            CacheCommands::Show { key } => cmd_cache_show(store, &key).await,
            CacheCommands::Invalidate { key } => cmd_cache_invalidate(store, &key).await,
        },

        Commands::Completions { .. } => Ok(()),
    }
}

/// Resolve the store backend under the data directory.
fn open_store(kind: StoreKind, data_dir: Option<&Path>) -> Result<Arc<dyn DurableStore>> {
    let data_dir = match data_dir {
        Some(dir) => dir.to_path_buf(),
        None => default_data_dir(),
    };

    let store_config = match kind {
        StoreKind::Memory => serde_json::json!({}),
        StoreKind::Local => {
            let root = data_dir.join("store");
            std::fs::create_dir_all(&root)
                .with_context(|| format!("Failed to create {}", root.display()))?;
            serde_json::json!({ "root": root.to_string_lossy() })
        }
        StoreKind::Sqlite => {
            std::fs::create_dir_all(&data_dir)
                .with_context(|| format!("Failed to create {}", data_dir.display()))?;
            serde_json::json!({ "path": data_dir.join("ferry.db").to_string_lossy() })
        }
    };

    debug!("Opening {} store in {}", kind.name(), data_dir.display());
    create_default_registry()
        .resolve(kind.name(), store_config)
        .with_context(|| format!("Failed to open {} store", kind.name()))
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("ferry"))
        .unwrap_or_else(|| PathBuf::from(".ferry"))
}

fn queue_options(config: &EngineConfig) -> QueueOptions {
    QueueOptions {
        default_max_retries: config.max_retries,
        retain_dead_letters: config.retain_dead_letters,
    }
}

async fn open_queue(store: Arc<dyn DurableStore>, config: &EngineConfig) -> Result<MutationQueue> {
    MutationQueue::open(store, queue_options(config))
        .await
        .context("Failed to open mutation queue")
}

fn parse_id(id: &str) -> Result<OperationId> {
    OperationId::parse(id).with_context(|| format!("Invalid operation id: {}", id))
}

fn parse_header(s: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = s
        .split_once(':')
        .ok_or_else(|| format!("expected NAME:VALUE, got '{}'", s))?;
    let name = name.trim();
    if name.is_empty() {
        return Err("header name cannot be empty".to_string());
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn print_operations(ops: &[QueuedOperation], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(ops)?);
        return Ok(());
    }
    if ops.is_empty() {
        println!("(none)");
        return Ok(());
    }

    for op in ops {
        println!(
            "{}  {:<6} {:<6} {}  attempt {}/{}  {}",
            op.id,
            op.priority,
            op.method,
            op.target,
            op.attempt,
            op.max_retries,
            op.created_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(error) = &op.last_error {
            println!("    last error: {}", error);
        }
    }
    Ok(())
}

/// List queued operations.
async fn cmd_pending(store: Arc<dyn DurableStore>, config: &EngineConfig, json: bool) -> Result<()> {
    let queue = open_queue(store, config).await?;
    print_operations(&queue.list_pending().await, json)
}

/// List dead letters.
async fn cmd_dead_letters(store: Arc<dyn DurableStore>, config: &EngineConfig, json: bool) -> Result<()> {
    let queue = open_queue(store, config).await?;
    print_operations(&queue.dead_letters().await, json)
}

/// Queue a write.
async fn cmd_enqueue(store: Arc<dyn DurableStore>, config: &EngineConfig, draft: OperationDraft) -> Result<()> {
    let queue = open_queue(store, config).await?;
    let op = queue.enqueue(draft).await.context("Failed to queue operation")?;

    println!("Queued {}", op.id);
    println!("  {} {} ({})", op.method, op.target, op.priority);
    Ok(())
}

/// Requeue a dead letter.
async fn cmd_requeue(store: Arc<dyn DurableStore>, config: &EngineConfig, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let queue = open_queue(store, config).await?;
    queue
        .requeue_dead_letter(&id)
        .await
        .context("Failed to requeue dead letter")?;

    println!("Requeued {}", id);
    Ok(())
}

/// Discard a dead letter.
async fn cmd_discard(store: Arc<dyn DurableStore>, config: &EngineConfig, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let queue = open_queue(store, config).await?;
    queue
        .discard_dead_letter(&id)
        .await
        .context("Failed to discard dead letter")?;

    println!("Discarded {}", id);
    Ok(())
}

/// Drain the queue once over HTTP.
async fn cmd_sync(store: Arc<dyn DurableStore>, config: EngineConfig, base_url: &str) -> Result<()> {
    let transport = HttpTransport::new(base_url, config.request_timeout()).context("Invalid backend")?;
    info!("Syncing against {}", transport.base_url());

    let engine = SyncEngine::builder(store, Arc::new(transport))
        .config(config)
        .initial_state(ConnectivityState::Online)
        .build()
        .await
        .context("Failed to start sync engine")?;

    let result = engine.sync_now().await;
    engine.shutdown().await;
    let result = result.context("Sync failed")?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Show a cached snapshot.
async fn cmd_cache_show(store: Arc<dyn DurableStore>, key: &str) -> Result<()> {
    let cache = offline_cache(store);
    let entry = cache
        .peek(key)
        .await
        .context("Failed to read cache")?
        .with_context(|| format!("No cached data for {}", key))?;

    println!("Key: {}", entry.key);
    println!("Stored: {}", entry.stored_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("Size: {} bytes", entry.payload.len());
    match std::str::from_utf8(&entry.payload) {
        Ok(text) => println!("\n{}", text),
        Err(_) => println!("\n(binary payload)"),
    }
    Ok(())
}

/// Drop a cached snapshot.
async fn cmd_cache_invalidate(store: Arc<dyn DurableStore>, key: &str) -> Result<()> {
    let cache = offline_cache(store);
    cache.invalidate(key).await.context("Failed to invalidate cache entry")?;

    println!("Invalidated {}", key);
    Ok(())
}

fn offline_cache(store: Arc<dyn DurableStore>) -> ReadThroughCache {
    let monitor = ConnectivityMonitor::new(ConnectivityState::Offline, std::time::Duration::ZERO);
    ReadThroughCache::new(store, monitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("X-Org: clinic-7").unwrap(),
            ("X-Org".to_string(), "clinic-7".to_string())
        );
        assert!(parse_header("missing-colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn test_enqueue_args() {
        let cli = Cli::try_parse_from([
            "ferry",
            "--store",
            "memory",
            "enqueue",
            "--method",
            "PATCH",
            "--target",
            "/patients/42",
            "-H",
            "X-Org:clinic-7",
            "--priority",
            "high",
            "--invalidates",
            "patient:42",
        ])
        .unwrap();

        match cli.command {
            Commands::Enqueue {
                method,
                priority,
                headers,
                invalidates,
                ..
            } => {
                assert_eq!(method, Method::Patch);
                assert_eq!(priority, Priority::High);
                assert_eq!(headers, vec![("X-Org".to_string(), "clinic-7".to_string())]);
                assert_eq!(invalidates, vec!["patient:42"]);
            }
            _ => panic!("expected enqueue"),
        }
    }

    #[tokio::test]
    async fn test_enqueue_then_list_on_local_store() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = EngineConfig::default();

        let store = open_store(StoreKind::Local, Some(temp.path())).unwrap();
        cmd_enqueue(store, &config, OperationDraft::post("/visits")).await.unwrap();

        let store = open_store(StoreKind::Local, Some(temp.path())).unwrap();
        let queue = open_queue(store, &config).await.unwrap();
        assert_eq!(queue.pending_count().await, 1);
    }
}
