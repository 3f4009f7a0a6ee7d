// src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mosaic::build::fetch_contents;
use mosaic::fetch::FetchScheduler;
use mosaic::index::QueryOptions;
use mosaic::plan::test_all_packages;
use mosaic::progress::{CliProgress, LogProgress, ProgressTracker};
use mosaic::{DirectiveEmitter, Dockerfile, InstallationPlan, MosaicConfig, PackageName};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mosaic")]
#[command(author, version, about = "Package metadata fetcher and image planner", long_about = None)]
struct Cli {
    /// Configuration file (default: <config dir>/mosaic/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Ignore cached fetch results
    #[arg(long, global = true)]
    force_refresh: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every fetcher once and report the index size
    Fetch,
    /// Search the package index
    Search {
        /// Query as distribution/name
        query: String,
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// Resolve packages into an installation plan
    Plan {
        /// Packages as distribution/name
        #[arg(required = true)]
        packages: Vec<String>,
        /// Emit a Dockerfile instead of the package list
        #[arg(long)]
        dockerfile: bool,
        /// Emit the dependency graph as DOT
        #[arg(long)]
        graph: bool,
        #[arg(long)]
        base_image: Option<String>,
        /// Download the contents of every planned package
        #[arg(long)]
        fetch_contents: bool,
    },
    /// Show the status of every fetcher
    Status,
    /// Try to plan every indexed package on its own
    TestAll,
    /// Keep the index current until interrupted
    Refresh,
}

fn load_config(path: Option<PathBuf>) -> Result<MosaicConfig> {
    let path = path.or_else(|| {
        dirs::config_dir()
            .map(|dir| dir.join("mosaic").join("config.toml"))
            .filter(|p| p.exists())
    });

    match path {
        Some(path) => MosaicConfig::load(&path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => {
            warn!("No configuration file found, using defaults");
            Ok(MosaicConfig::default())
        }
    }
}

fn scheduler(config: &MosaicConfig) -> Result<FetchScheduler> {
    let index = Arc::new(config.package_index()?);
    let store = config.fetch_store()?;
    Ok(FetchScheduler::new(index, store).with_options(config.fetch.scheduler_options()))
}

fn fetch_all(scheduler: &FetchScheduler) -> Result<()> {
    let progress = CliProgress::new("fetching", 0);
    scheduler.fetch_all(&progress)?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config)?;
    config.fetch.force_refresh |= cli.force_refresh;

    match cli.command {
        Some(Commands::Fetch) => {
            let scheduler = scheduler(&config)?;
            fetch_all(&scheduler)?;
            println!("Indexed {} packages", scheduler.index().count());
            Ok(())
        }
        Some(Commands::Search { query, limit }) => {
            let scheduler = scheduler(&config)?;
            fetch_all(&scheduler)?;

            let query = PackageName::parse(&query);
            let results = scheduler
                .index()
                .search(&query, &QueryOptions::with_max_results(limit))?;
            for pkg in &results {
                println!("{}  {}", pkg.name, pkg.description);
            }
            info!("{} results for {}", results.len(), query);
            Ok(())
        }
        Some(Commands::Plan {
            packages,
            dockerfile,
            graph,
            base_image,
            fetch_contents: download,
        }) => {
            let scheduler = scheduler(&config)?;
            fetch_all(&scheduler)?;

            let queries: Vec<PackageName> = packages.iter().map(|p| PackageName::parse(p)).collect();
            let mut plan = InstallationPlan::for_packages(
                Arc::clone(scheduler.index()),
                &queries,
                config.plan.clone(),
            )?;
            if let Some(image) = base_image {
                plan.set_base_image(image);
            }

            let stdout = io::stdout();
            let mut out = stdout.lock();
            if dockerfile {
                Dockerfile.emit(&plan.directives(), &mut out)?;
            } else if graph {
                plan.dump_graph(&mut out)?;
            } else {
                for pkg in plan.packages() {
                    writeln!(out, "{}", pkg.name)?;
                }
            }

            if download {
                let orchestrator = config.orchestrator()?;
                let paths = fetch_contents(&orchestrator, plan.packages())?;
                for (pkg, path) in plan.packages().iter().zip(&paths) {
                    info!("{} -> {}", pkg.name, path.display());
                }
            }
            Ok(())
        }
        Some(Commands::Status) => {
            let scheduler = scheduler(&config)?;
            if let Err(e) = fetch_all(&scheduler) {
                warn!("Fetch failed: {}", e);
            }
            for status in scheduler.index().fetcher_status() {
                println!(
                    "{:<12} {:<40} {:>8} packages  {}",
                    status.status.to_string(),
                    status.name,
                    status.package_count,
                    status
                        .last_updated
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string())
                );
                for message in &status.messages {
                    println!("    {}", message.message);
                }
            }
            Ok(())
        }
        Some(Commands::TestAll) => {
            let scheduler = scheduler(&config)?;
            fetch_all(&scheduler)?;

            let progress = LogProgress::new("test-all", scheduler.index().count() as u64);
            let (working, broken) = test_all_packages(scheduler.index(), &config.plan, &progress)?;
            progress.finish_with_message("done");
            println!("{} working, {} broken", working, broken);
            Ok(())
        }
        Some(Commands::Refresh) => {
            let scheduler = scheduler(&config)?;
            let _refresh = scheduler
                .start_auto_refresh(config.fetch.workers, config.fetch.refresh_interval())?;
            loop {
                std::thread::park();
            }
        }
        None => {
            println!("Mosaic v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'mosaic --help' for usage information");
            Ok(())
        }
    }
}
