//! docfind binary — thin CLI shell over the [`docfind_engine`] library.

use clap::{Parser, Subcommand};
use docfind_engine::types::SizeCategory;
use docfind_engine::{EngineConfig, ProgressCallback, SearchEngine};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Desktop full-text search over local document trees.
#[derive(Parser)]
#[command(name = "docfind", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine root directory holding data_storage/ and cache/ (default: cwd)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Fixed shard count for a fresh data directory
    #[arg(long)]
    shards: Option<usize>,

    /// Fixed extraction worker count
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a directory tree
    Index {
        /// Directory to index
        directory: PathBuf,
        /// Restrict to these extensions (repeatable), e.g. --ext txt --ext pdf
        #[arg(long = "ext")]
        extensions: Vec<String>,
    },
    /// Search the index
    Search {
        /// Query string
        query: String,
        /// Maximum results
        #[arg(long, default_value_t = 5500)]
        limit: usize,
        /// Path-suffix filter, e.g. "pdf" ("all" disables)
        #[arg(long = "type", default_value = "all")]
        type_filter: String,
    },
    /// Print aggregated engine statistics as JSON
    Stats,
    /// Merge, vacuum, and analyze all shards
    Optimize,
    /// Drop both cache tiers and their persistence files
    ClearCache,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    let cli = Cli::parse();
    let root = cli
        .root
        .clone()
        .unwrap_or_else(|| std::env::current_dir().expect("current directory is accessible"));

    init_logging(&root);

    let mut config = EngineConfig::load(&root);
    if cli.shards.is_some() {
        config.shard_count = cli.shards;
    }
    if cli.workers.is_some() {
        config.worker_threads = cli.workers;
    }
    if let Commands::Index { extensions, .. } = &cli.command {
        if !extensions.is_empty() {
            config.extensions = extensions.clone();
        }
    }

    let engine = match SearchEngine::open(&root, config) {
        Ok(engine) => engine,
        Err(e) => {
            error!(root = %root.display(), error = %e, "Engine failed to open");
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Index { directory, .. } => {
            let done = Arc::new(AtomicUsize::new(0));
            let done_cb = Arc::clone(&done);
            let progress: ProgressCallback = Arc::new(move |path, category, ok| {
                let n = done_cb.fetch_add(1, Ordering::Relaxed) + 1;
                if n % 500 == 0 {
                    info!(files = n, "Indexing progress");
                }
                if !ok {
                    let label = SizeCategory::label(category);
                    info!(path, category = label, "File skipped");
                }
            });

            match engine.index_directory(&directory, Some(progress)) {
                Ok(summary) => {
                    // Durable writes ride timers; settle them before exit
                    engine.flush_pending();
                    println!(
                        "{} indexed / {} discovered in {:.1}s ({:.1} files/s){}",
                        summary.successful,
                        summary.total_files,
                        summary.duration_secs,
                        summary.files_per_second,
                        if summary.cancelled { " [cancelled]" } else { "" },
                    );
                }
                Err(e) => {
                    error!(error = %e, "Indexing failed");
                    std::process::exit(1);
                }
            }
        }
        Commands::Search { query, limit, type_filter } => {
            let results = engine.search(&query, limit, &type_filter);
            if results.is_empty() {
                println!("no matches");
            }
            for hit in &results {
                println!(
                    "{:8.2}  [{}]  {}  {}",
                    hit.relevance_score,
                    hit.layer,
                    hit.file_path,
                    hit.content_preview.chars().take(80).collect::<String>()
                );
            }
        }
        Commands::Stats => {
            let stats = engine.statistics();
            match serde_json::to_string_pretty(&stats) {
                Ok(json) => println!("{json}"),
                Err(e) => error!(error = %e, "Statistics serialization failed"),
            }
        }
        Commands::Optimize => {
            if let Err(e) = engine.optimize() {
                error!(error = %e, "Optimization failed");
                std::process::exit(1);
            }
            println!("optimization complete");
        }
        Commands::ClearCache => {
            engine.clear_cache();
            println!("caches cleared");
        }
    }

    engine.shutdown();
}

/// Stderr gets the env-filtered human log; the debug log file is truncated
/// on every start.
fn init_logging(root: &std::path::Path) {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("docfind_engine=info".parse().expect("static directive parses"))
        .add_directive("docfind_core=info".parse().expect("static directive parses"));

    let stderr_layer = tracing_subscriber::fmt::layer().with_target(false);

    match std::fs::File::create(root.join("file_search_app.log")) {
        Ok(file) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(Arc::new(file))
                .with_ansi(false);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
        }
        Err(_) => {
            tracing_subscriber::registry().with(env_filter).with(stderr_layer).init();
        }
    }
}
