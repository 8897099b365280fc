use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use imagetwin::core::indexer::{IndexPhase, IndexProgress};
use imagetwin::{AppConfig, ImageTwin, SearchParams};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(
    name = "imagetwin",
    version,
    about = "Find visually similar images in your directories"
)]
struct Cli {
    /// Config file (default: $IMAGETWIN_CONFIG or the per-user config)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the fingerprint store location
    #[arg(long, global = true, value_name = "DIR")]
    store: Option<PathBuf>,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fingerprint every image under the given directories
    Index {
        #[arg(value_name = "DIR", required = true)]
        dirs: Vec<PathBuf>,
    },

    /// Find indexed images similar to a query image
    Search {
        /// Query image
        #[arg(short, long, value_name = "FILE")]
        image: PathBuf,
        /// Minimum similarity in (0, 1]
        #[arg(short, long)]
        threshold: Option<f64>,
        /// Do not penalize differing resolutions
        #[arg(long)]
        ignore_resolution: bool,
        /// Do not penalize differing EXIF metadata
        #[arg(long)]
        ignore_metadata: bool,
        /// Only match images under this directory (repeatable)
        #[arg(long = "dir", value_name = "DIR")]
        dirs: Vec<PathBuf>,
        /// Return at most N results
        #[arg(short, long, value_name = "N")]
        limit: Option<usize>,
        /// Print the response as JSON
        #[arg(long)]
        json: bool,
    },

    /// Score two images against each other
    Compare {
        first: PathBuf,
        second: PathBuf,
        #[arg(long)]
        ignore_resolution: bool,
        #[arg(long)]
        ignore_metadata: bool,
    },

    /// Show what is indexed
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Remove every fingerprint from the store
    Clear {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = AppConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    let store_path = config.store_path.clone();
    let twin = ImageTwin::open(config)
        .with_context(|| format!("Failed to open store at {}", store_path.display()))?;

    match cli.command {
        Commands::Index { dirs } => run_index(&twin, dirs).await?,

        Commands::Search {
            image,
            threshold,
            ignore_resolution,
            ignore_metadata,
            dirs,
            limit,
            json,
        } => {
            let bytes = read_image(&image)?;
            let params = SearchParams {
                threshold,
                ignore_resolution,
                ignore_metadata,
                directories: dirs,
                limit,
            };
            let response = benchmark("search", twin.search(bytes, params))
                .await
                .context("Search failed")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else if response.results.is_empty() {
                println!("No similar images found.");
            } else {
                println!("Found {} similar image(s):", response.total);
                for result in &response.results {
                    println!("   {:>5.1}%  {}", result.similarity * 100.0, result.path.display());
                }
            }
        }

        Commands::Compare {
            first,
            second,
            ignore_resolution,
            ignore_metadata,
        } => {
            let score = twin
                .compare(
                    read_image(&first)?,
                    read_image(&second)?,
                    ignore_resolution,
                    ignore_metadata,
                )
                .await
                .context("Compare failed")?;
            println!(
                "▶ {} vs {}: {:.1}% similar",
                first.display(),
                second.display(),
                score * 100.0
            );
        }

        Commands::Status { json } => {
            let status = twin.status().await.context("Failed to read status")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("🗂️  Store: {}", status.store_path.display());
                println!("   {} image(s) indexed", status.total_indexed_images);
                for root in &status.roots {
                    println!(
                        "   ▶ {} ({} images, indexed {})",
                        root.path.display(),
                        root.image_count,
                        root.last_indexed_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
        }

        Commands::Clear { yes } => {
            let confirmed = yes
                || Confirm::new()
                    .with_prompt("Remove every indexed fingerprint?")
                    .default(false)
                    .interact()
                    .context("Failed to read confirmation")?;
            if !confirmed {
                println!("Nothing removed.");
                return Ok(());
            }
            let removed = twin.clear().await.context("Failed to clear store")?;
            println!("🧹 Removed {} fingerprint(s)", removed);
        }
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

async fn run_index(twin: &ImageTwin, dirs: Vec<PathBuf>) -> Result<()> {
    println!("▶ Indexing {} director(y/ies)…", dirs.len());

    let cancel = Arc::new(AtomicBool::new(false));
    let ctrl_c_flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n⚠️  Cancelling after in-flight files finish…");
            ctrl_c_flag.store(true, Ordering::Relaxed);
        }
    });

    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template(
        "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    )?);
    bar.enable_steady_tick(Duration::from_millis(100));

    let (sender, receiver) = mpsc::unbounded_channel();
    let reporter = tokio::spawn(report_progress(receiver, bar.clone()));

    let result = benchmark(
        "indexing",
        twin.index_with(dirs, cancel, Some(sender)),
    )
    .await;
    // The sender is dropped with the indexer, which ends the reporter.
    let _ = reporter.await;

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            bar.abandon_with_message("Index stopped");
            return Err(e).context("Indexing failed");
        }
    };
    bar.finish_with_message("Index complete");

    for root in &summary.skipped_roots {
        eprintln!("⚠️  Skipped {}", root.display());
    }
    println!(
        "✅ {} new, {} updated, {} removed, {} unchanged, {} failed",
        summary.new_count,
        summary.updated_count,
        summary.removed_count,
        summary.unchanged_count,
        summary.failed_count
    );
    println!("   {} image(s) in the index", summary.total_indexed);
    Ok(())
}

/// Folds per-root progress into one bar.
async fn report_progress(mut receiver: mpsc::UnboundedReceiver<IndexProgress>, bar: ProgressBar) {
    let mut per_root: HashMap<String, (usize, usize)> = HashMap::new();
    while let Some(progress) = receiver.recv().await {
        if progress.phase == IndexPhase::Discovery {
            bar.set_message(format!("scanning {}", progress.root));
            continue;
        }
        per_root.insert(
            progress.root.clone(),
            (progress.files_processed, progress.total_files),
        );
        let (done, total) = per_root
            .values()
            .fold((0, 0), |(d, t), (pd, pt)| (d + pd, t + pt));
        bar.set_length(total as u64);
        bar.set_position(done as u64);
        if progress.phase == IndexPhase::Fingerprinting {
            bar.set_message(progress.current_file);
        }
    }
}

/// Await `f`, print how long it took (with `label`), and return its result.
async fn benchmark<T, F: Future<Output = T>>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f.await;
    log::info!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
