//! Cache inspection utilities: read, trace, fetch and drop cache entries
//! without running a workflow.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value as JsonValue;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use buildgraph_cache::{Cache, CacheHub, FileCache, TRANSFORM_PREFIX};
use buildgraph_graph::TraceNode;

#[derive(Parser)]
#[command(name = "buildgraph", version, about = "BuildGraph cache utilities")]
struct Cli {
    /// Enable debug logging.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect and manage cache stores.
    Cache(CacheArgs),
}

#[derive(Args)]
struct CacheArgs {
    /// File-backed cache store directories, in priority order.
    #[arg(long = "store", required = true)]
    stores: Vec<PathBuf>,

    #[command(subcommand)]
    command: CacheCommand,
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Read transform key data.
    ReadKey {
        /// Cache key, or a path to a JSON key-data file when prefixed with
        /// `./`, `../` or `/`.
        key: String,
        /// Write the key data here instead of printing it.
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Only consult the named cache.
        #[arg(long, short)]
        cache: Option<String>,
    },
    /// Explain a transform key as its hash trace.
    TraceKey {
        key: String,
        /// Maximum trace depth; negative for unlimited.
        #[arg(long, short, default_value_t = -1)]
        depth: i32,
        #[arg(long, short)]
        output: Option<PathBuf>,
        #[arg(long, short)]
        cache: Option<String>,
    },
    /// Fetch a single medial blob by its content key.
    FetchMedial {
        key: String,
        #[arg(long, short)]
        output: PathBuf,
    },
    /// Drop transform key data from the caches.
    DropKey {
        key: String,
        /// Skip the confirmation prompt.
        #[arg(long, short)]
        yes: bool,
    },
    /// Drop a medial blob and its key from the caches.
    DropMedial {
        key: String,
        #[arg(long, short)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Cache(args) => {
            let hub = open_stores(&args.stores)?;
            match args.command {
                CacheCommand::ReadKey { key, output, cache } => {
                    read_key(&hub, &key, output.as_deref(), cache.as_deref()).await
                }
                CacheCommand::TraceKey {
                    key,
                    depth,
                    output,
                    cache,
                } => trace_key(&hub, &key, depth, output.as_deref(), cache.as_deref()).await,
                CacheCommand::FetchMedial { key, output } => {
                    fetch_medial(&hub, &key, &output).await
                }
                CacheCommand::DropKey { key, yes } => {
                    let key = qualify(&key);
                    drop_entries(&hub, &key, yes, false).await
                }
                CacheCommand::DropMedial { key, yes } => {
                    drop_entries(&hub, &key, yes, true).await
                }
            }
        }
    }
}

fn open_stores(stores: &[PathBuf]) -> Result<CacheHub> {
    let mut caches: Vec<Arc<dyn Cache>> = Vec::with_capacity(stores.len());
    for store in stores {
        let name = store
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| store.to_string_lossy().into_owned());
        debug!(store = %store.display(), name, "opening cache store");
        caches.push(Arc::new(
            FileCache::new(name, store)
                .with_context(|| format!("opening cache store {}", store.display()))?,
        ));
    }
    Ok(CacheHub::new(caches))
}

fn is_key_file(key: &str) -> bool {
    key.starts_with("./") || key.starts_with("../") || key.starts_with('/')
}

fn qualify(key: &str) -> String {
    if key.starts_with(TRANSFORM_PREFIX) {
        key.to_string()
    } else {
        format!("{TRANSFORM_PREFIX}{key}")
    }
}

/// Resolve a key argument to its key data: either a JSON file on disk or a
/// lookup through the caches.
async fn key_data(hub: &CacheHub, key: &str, from_cache: Option<&str>) -> Result<Option<JsonValue>> {
    if is_key_file(key) {
        println!("Assuming key '{key}' is a key data file");
        let raw = std::fs::read_to_string(key)
            .with_context(|| format!("reading key data file {key}"))?;
        return Ok(Some(serde_json::from_str(&raw)?));
    }
    println!("Assuming key '{key}' is a cache key (use a ./ prefix if this is a file)");
    let key = qualify(key);
    match hub.fetch_object(&key, from_cache).await {
        Some((cache, data)) => {
            println!("Key '{key}' found in cache: '{cache}'");
            Ok(Some(data))
        }
        None => {
            println!("Key '{key}' not found");
            Ok(None)
        }
    }
}

async fn read_key(
    hub: &CacheHub,
    key: &str,
    output: Option<&Path>,
    cache: Option<&str>,
) -> Result<ExitCode> {
    let Some(data) = key_data(hub, key, cache).await? else {
        return Ok(ExitCode::FAILURE);
    };
    match output {
        Some(output) => std::fs::write(output, serde_json::to_vec_pretty(&data)?)?,
        None => println!("{}", serde_json::to_string_pretty(&data)?),
    }
    Ok(ExitCode::SUCCESS)
}

async fn trace_key(
    hub: &CacheHub,
    key: &str,
    depth: i32,
    output: Option<&Path>,
    cache: Option<&str>,
) -> Result<ExitCode> {
    let Some(data) = key_data(hub, key, cache).await? else {
        return Ok(ExitCode::FAILURE);
    };
    let Some(trace) = data.get("trace").filter(|trace| !trace.is_null()) else {
        println!("No trace data! Was the workflow run with hash tracing enabled?");
        return Ok(ExitCode::FAILURE);
    };
    let trace: TraceNode = serde_json::from_value(trace.clone())?;
    let lines = format_trace(std::slice::from_ref(&trace), 0, depth);
    match output {
        Some(output) => {
            let mut file = std::fs::File::create(output)?;
            for line in lines {
                writeln!(file, "{line}")?;
            }
        }
        None => {
            for line in lines {
                println!("{line}");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn format_trace(nodes: &[TraceNode], depth: i32, max_depth: i32) -> Vec<String> {
    let mut lines = Vec::new();
    for node in nodes {
        lines.push(format!(
            "{depth} {} {} {:indent$} {}[{}]",
            node.rolling_hash,
            node.own_hash,
            "",
            node.kind,
            node.ident,
            indent = (depth as usize) * 2,
        ));
        if max_depth < 0 || depth < max_depth {
            lines.extend(format_trace(&node.children, depth + 1, max_depth));
        }
    }
    lines
}

async fn fetch_medial(hub: &CacheHub, key: &str, output: &Path) -> Result<ExitCode> {
    for cache in hub.caches() {
        if cache.fetch(key, output).await? {
            println!("Item found in cache: '{}'", cache.name());
            return Ok(ExitCode::SUCCESS);
        }
    }
    println!("Key '{key}' not found");
    Ok(ExitCode::FAILURE)
}

async fn drop_entries(
    hub: &CacheHub,
    key: &str,
    yes: bool,
    drop_content: bool,
) -> Result<ExitCode> {
    let mut code = ExitCode::SUCCESS;
    for cache in hub.caches() {
        if !yes && !confirm(&format!("Drop key from cache '{}'?", cache.name()))? {
            continue;
        }
        if drop_content {
            if let Some(content_hash) = cache.fetch_hash(key).await? {
                cache.drop_item(&content_hash).await?;
            }
        }
        if cache.drop_hash(key).await? {
            println!("Key dropped from cache: '{}'", cache.name());
        } else {
            println!("Key could not be dropped from cache: '{}'", cache.name());
            code = ExitCode::FAILURE;
        }
    }
    Ok(code)
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}
