//! annex-db CLI
//!
//! A mutable key/vector store over an HNSW index.
//!
//! # Usage
//!
//! ```bash
//! # Import a tree file into a new database and serve every database found
//! annex-db import --from vectors.tree --dim 128 --to songs --map ids.csv
//! annex-db serve --data-dir . --port 1323 --apply-interval 30
//!
//! # Offline maintenance
//! annex-db apply --data-dir . --database songs
//! annex-db stats --data-dir . --database songs
//!
//! # Ask a running server
//! annex-db search --database songs --key 42
//! ```

use std::fs::{self, OpenOptions};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

use annex_db::config::{default_threads, StoreConfig};
use annex_db::importer::{importer_for, ByteOrder, Element, ImportOptions};
use annex_db::registry::{apply_loop, Databases};
use annex_db::server::{serve, AppState};
use annex_db::store::{Neighbor, Store};

#[derive(Parser)]
#[command(name = "annex-db")]
#[command(about = "A mutable key/vector store over an approximate nearest neighbour index")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve every database under a data directory over HTTP
    Serve {
        /// Directory holding one subdirectory per database
        #[arg(short, long, default_value = ".")]
        data_dir: PathBuf,

        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Server port
        #[arg(short, long, default_value = "1323")]
        port: u16,

        /// Write logs to <log-dir>/annex-db.log instead of stdout
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Seconds to wait for in-flight work on shutdown
        #[arg(long, default_value = "10")]
        timeout: u64,

        /// Maximum requests in flight
        #[arg(long, default_value = "100")]
        max_connections: usize,

        /// Apply pending journal entries every N seconds (off when unset)
        #[arg(long)]
        apply_interval: Option<u64>,

        /// Query threads per database
        #[arg(long)]
        threads: Option<usize>,
    },

    /// Create a database from a tree file or CSV
    Import {
        /// Source file; `.csv` is read as CSV, anything else as a tree file
        #[arg(long)]
        from: PathBuf,

        /// Vector dimension
        #[arg(long)]
        dim: usize,

        /// Name of the database to create
        #[arg(long)]
        to: String,

        #[arg(short, long, default_value = ".")]
        data_dir: PathBuf,

        /// CSV of `positional_index,external_key` rows (tree files only)
        #[arg(long)]
        map: Option<PathBuf>,

        /// Tree file byte order: little or big
        #[arg(long, default_value = "little")]
        byte_order: ByteOrder,

        /// Tree file component type: f64 or f32
        #[arg(long, default_value = "f64")]
        element: Element,

        #[arg(long)]
        threads: Option<usize>,

        /// HNSW M parameter (max neighbors per layer)
        #[arg(long, default_value = "16")]
        m: usize,

        /// HNSW ef_construction parameter (search depth during build)
        #[arg(long, default_value = "100")]
        ef_construction: usize,
    },

    /// Apply a database's pending journal entries
    Apply {
        #[arg(short, long, default_value = ".")]
        data_dir: PathBuf,

        #[arg(long)]
        database: String,
    },

    /// Show database counters
    Stats {
        #[arg(short, long, default_value = ".")]
        data_dir: PathBuf,

        #[arg(long)]
        database: String,
    },

    /// Query a running server by key
    Search {
        /// Server URL
        #[arg(short, long, default_value = "http://localhost:1323")]
        server: String,

        #[arg(long)]
        database: String,

        #[arg(long)]
        key: u64,

        /// Number of results
        #[arg(short = 'k', long, default_value = "10")]
        limit: usize,
    },
}

fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("annex-db.log"))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_dir = match &cli.command {
        Commands::Serve { log_dir, .. } => log_dir.clone(),
        _ => None,
    };
    init_tracing(log_dir.as_deref())?;

    match cli.command {
        Commands::Serve {
            data_dir,
            host,
            port,
            log_dir: _,
            timeout,
            max_connections,
            apply_interval,
            threads,
        } => {
            let threads = threads.unwrap_or_else(default_threads);
            let scan_dir = data_dir.clone();
            let databases = Arc::new(
                tokio::task::spawn_blocking(move || Databases::scan(&scan_dir, threads))
                    .await??,
            );

            let cancel = Arc::new(AtomicBool::new(false));
            let applier = match apply_interval {
                Some(secs) if secs > 0 => {
                    let databases = databases.clone();
                    let cancel = cancel.clone();
                    Some(
                        std::thread::Builder::new()
                            .name("annex-apply".to_string())
                            .spawn(move || {
                                apply_loop(databases, Duration::from_secs(secs), cancel)
                            })?,
                    )
                }
                _ => None,
            };

            let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding {addr}"))?;

            let state = Arc::new(AppState::new(databases.clone(), max_connections));
            let (stop_tx, stop_rx) = oneshot::channel::<()>();
            let mut server = tokio::spawn(serve(state, listener, async move {
                let _ = stop_rx.await;
            }));

            let deadline = Duration::from_secs(timeout);
            tokio::select! {
                result = &mut server => {
                    // Server exited on its own (listener failure)
                    cancel.store(true, Ordering::SeqCst);
                    result??;
                }
                _ = shutdown_signal() => {
                    cancel.store(true, Ordering::SeqCst);
                    let _ = stop_tx.send(());
                    match tokio::time::timeout(deadline, server).await {
                        Ok(result) => result??,
                        Err(_) => tracing::warn!(
                            "in-flight requests still running after {}s, shutting down anyway",
                            timeout
                        ),
                    }
                }
            }

            if let Some(handle) = applier {
                let joined = tokio::task::spawn_blocking(move || handle.join());
                match tokio::time::timeout(deadline, joined).await {
                    Ok(Ok(Ok(()))) => {}
                    Ok(_) => tracing::error!("background apply thread panicked"),
                    Err(_) => tracing::warn!("background apply still running after {}s", timeout),
                }
            }

            let saving = tokio::task::spawn_blocking(move || databases.save_all());
            match tokio::time::timeout(deadline, saving).await {
                Ok(failed) => {
                    let failed = failed?;
                    if failed > 0 {
                        anyhow::bail!("{} database(s) failed to save on shutdown", failed);
                    }
                }
                Err(_) => tracing::warn!("saving databases still running after {}s", timeout),
            }
            tracing::info!("Shutdown complete");
        }

        Commands::Import {
            from,
            dim,
            to,
            data_dir,
            map,
            byte_order,
            element,
            threads,
            m,
            ef_construction,
        } => {
            let mut config = StoreConfig::new(dim).with_threads(threads.unwrap_or_else(default_threads));
            config.m = m;
            config.ef_construction = ef_construction;
            let options = ImportOptions {
                config,
                byte_order,
                element,
                mapping: map,
            };

            let target = data_dir.join(&to);
            let report = importer_for(&from, options)
                .import(&from, &target)
                .with_context(|| format!("importing {} into {}", from.display(), to))?;
            println!("Imported {} vectors into '{}'", report.imported, to);
            if report.skipped_nodes > 0 {
                println!("  Skipped non-leaf nodes: {}", report.skipped_nodes);
            }
            println!("  Cursor: {}", report.apply.cursor);
        }

        Commands::Apply { data_dir, database } => {
            let store: Store = Store::open(data_dir.join(&database))
                .with_context(|| format!("opening database '{database}'"))?;
            let report = store.apply()?;
            store.compact()?;
            println!(
                "Applied {} entries ({} already reflected), cursor {}",
                report.applied, report.skipped, report.cursor
            );
        }

        Commands::Stats { data_dir, database } => {
            let store: Store = Store::open(data_dir.join(&database))
                .with_context(|| format!("opening database '{database}'"))?;
            let stats = store.stats();
            println!("Database: {}", database);
            println!("  Dimensions: {}", stats.dim);
            println!("  Active keys: {}", stats.active_keys);
            println!("  Engine nodes: {}", stats.engine_nodes);
            println!("  Tombstones: {}", stats.tombstones);
            println!("  Cursor: {}", stats.cursor);
            println!("  Last seq: {}", stats.last_seq);
            println!("  Pending: {}", stats.pending);
        }

        Commands::Search {
            server,
            database,
            key,
            limit,
        } => {
            let client = reqwest::Client::new();
            let url = format!(
                "{}/search?database={}&key={}&limit={}",
                server.trim_end_matches('/'),
                database,
                key,
                limit
            );

            let response = client.get(&url).send().await?;
            if !response.status().is_success() {
                let error: serde_json::Value = response.json().await?;
                eprintln!("Error: {}", error);
                std::process::exit(1);
            }

            let hits: Vec<Neighbor> = response.json().await?;
            println!("Results:");
            for hit in hits {
                println!("  Key: {}, Distance: {:.4}", hit.key, hit.distance);
            }
        }
    }

    Ok(())
}
