//! CLI entry point for the fetchkit tool.

use std::io::{self, IsTerminal, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use fetchkit_core::{
    CacheIndex, DownloadQueue, HttpProcessor, LocalCache, Mirror, ProgressTracker, QueueOptions,
    RequestOptions, Resource, ResourceManager, StoragePriority, WeightedMirrorPolicy,
};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (warn)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    // Read input: from positional args or stdin
    let urls: Vec<String> = if args.urls.is_empty() && !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(ToString::to_string)
            .collect()
    } else {
        args.urls.clone()
    };

    if urls.is_empty() {
        info!("No input provided. Pipe URLs via stdin or pass as arguments.");
        info!("Example: echo 'https://example.com/file.pdf' | fetchkit");
        return Ok(());
    }

    let mut resources = Vec::new();
    for url in &urls {
        match Url::parse(url) {
            Ok(parsed) => {
                let id = resource_id_for(&parsed);
                resources.push(Resource::new(id, Mirror::new("main", url.clone())));
            }
            Err(e) => warn!(url = %url, error = %e, "skipping unparseable URL"),
        }
    }

    tokio::fs::create_dir_all(&args.dest).await?;
    let index = CacheIndex::new(&args.dest.join(".fetchkit-index.db")).await?;
    let policy = Arc::new(WeightedMirrorPolicy::with_max_retries(u32::from(
        args.max_retries,
    )));
    let cache = Arc::new(LocalCache::new(&args.dest, index, policy).await?);

    let queue = DownloadQueue::new(QueueOptions {
        simultaneous_downloads: usize::from(args.concurrency),
    });
    queue.add(Arc::new(HttpProcessor::new(args.dest.join(".partial"))));

    let manager = ResourceManager::new(cache, queue, None);

    let options = if args.permanent {
        RequestOptions {
            storage_priority: StoragePriority::Permanent,
            ..RequestOptions::default()
        }
    } else {
        RequestOptions::default()
    };

    let total = resources.len();
    let requests = manager.request(resources, options).await?;
    let cached = total - requests.len();
    if cached > 0 {
        info!(cached, "resources already cached");
    }
    if requests.is_empty() {
        println!("Nothing to fetch: all {total} resources are cached.");
        return Ok(());
    }

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    for request in &requests {
        let done_tx = done_tx.clone();
        manager
            .add_resource_completion(request.resource.id(), move |success, resource_id| {
                let _ = done_tx.send((success, resource_id.to_string()));
            })
            .await;
    }

    let _ = manager.progress_node("batch", &requests);
    let (ui_handle, stop) = spawn_progress_ui(
        !args.quiet && io::stderr().is_terminal(),
        manager.progress(),
        requests.len(),
    );

    let mut succeeded = 0usize;
    let mut failed = Vec::new();
    for _ in 0..requests.len() {
        let Some((success, resource_id)) = done_rx.recv().await else {
            break;
        };
        if success {
            succeeded += 1;
        } else {
            failed.push(resource_id);
        }
    }

    stop.store(true, Ordering::SeqCst);
    if let Some(handle) = ui_handle {
        let _ = handle.await;
    }

    println!("Fetched {succeeded}/{} ({cached} already cached)", requests.len());
    for resource_id in &failed {
        eprintln!("failed: {resource_id}");
    }
    if !failed.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

/// Derives a stable resource id from a URL: host plus path, slugged.
fn resource_id_for(url: &Url) -> String {
    let host = url.host_str().unwrap_or("download");
    let raw = format!("{host}{}", url.path());
    let mut id = String::new();
    let mut prev_sep = false;
    for ch in raw.chars() {
        if ch.is_alphanumeric() || matches!(ch, '-' | '_') {
            id.push(ch);
            prev_sep = false;
        } else if !prev_sep {
            id.push('_');
            prev_sep = true;
        }
    }
    id.trim_matches('_').to_string()
}

/// Spawns the progress UI (bar) when requested.
/// Returns (handle, stop) so the caller can signal stop and await the handle.
/// When `use_bar` is false, returns (None, stop) with stop already true.
fn spawn_progress_ui(
    use_bar: bool,
    tracker: Arc<ProgressTracker>,
    total: usize,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    if !use_bar {
        return (None, Arc::new(AtomicBool::new(true)));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let stop_signal = Arc::clone(&stop);
    let handle = tokio::spawn(async move {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{pos}/{len}] {msg} {wide_bar}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.enable_steady_tick(Duration::from_millis(100));

        while !stop_signal.load(Ordering::SeqCst) {
            let done = tracker.completed_download_count() + tracker.failed_download_count();
            bar.set_position(done);
            if let Some(node) = tracker.node_snapshot("batch") {
                bar.set_message(format!(
                    "{:.0}%",
                    node.fraction_completed() * 100.0
                ));
            }
            tokio::time::sleep(Duration::from_millis(120)).await;
        }

        bar.finish_and_clear();
    });
    (Some(handle), stop)
}
