use citefold::config::AppConfig;
use citefold::enrichment::{EnrichmentClient, EnrichmentRunner};
use citefold::ingestion::Pipeline;
use citefold::logging;
use citefold::sampler::{SamplerError, WeightedSampler};
use citefold::store::{DocumentStore, PopulationFilter, SharedStore, SledStore};
use citefold::CitefoldResult;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path of the sled database
    #[arg(long)]
    db: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load every dump file of the data directory
    Load {
        /// The data file directory
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Number of open files
        #[arg(long)]
        files: Option<usize>,

        /// Number of parallel datasets
        #[arg(long)]
        datasets: Option<usize>,

        /// Number of intents per bulk write
        #[arg(long)]
        batch_size: Option<usize>,

        /// Number of batch writers
        #[arg(long)]
        workers: Option<usize>,

        /// Recompute strata once loading is done
        #[arg(long)]
        refresh_strata: bool,
    },
    /// Recompute the prefix and year strata used by the sampler
    RefreshStrata,
    /// Print randomly drawn identifiers
    Sample {
        /// Number of draws
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,

        /// Refine prefixes by publication year
        #[arg(long)]
        by_year: bool,

        /// Stratum selection: ordinal or proportional
        #[arg(long)]
        mode: Option<String>,

        /// Fixed RNG seed
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Evaluate random identifiers with F-UJI and store the results
    Enrich {
        /// Stop after this many draws; runs until interrupted otherwise
        #[arg(short = 'n', long)]
        limit: Option<u64>,

        /// F-UJI API URL
        #[arg(long)]
        fuji_url: Option<String>,

        /// F-UJI user name
        #[arg(long)]
        fuji_user: Option<String>,

        /// F-UJI password
        #[arg(long)]
        fuji_pwd: Option<String>,

        /// Draws evaluated at the same time
        #[arg(long)]
        concurrency: Option<usize>,

        /// Refine prefixes by publication year
        #[arg(long)]
        by_year: bool,
    },
    /// Print the number of stored documents
    Count,
}

fn population(config: &AppConfig) -> PopulationFilter {
    PopulationFilter {
        resource_type_general: config.sampler.resource_type_general.clone(),
    }
}

/// Main entry point for the citefold CLI.
///
/// Configuration is read from the optional TOML file, then `CITEFOLD_*`
/// environment variables, then command-line flags. Failing to open the store
/// ends the process before any work starts.
#[tokio::main]
async fn main() -> CitefoldResult<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.log_level = Some(level);
    }
    logging::init(config.log_level.as_deref().unwrap_or("info"))?;
    if let Some(db) = cli.db {
        config.store.path = db;
    }

    match &cli.command {
        Commands::Load {
            data,
            files,
            datasets,
            batch_size,
            workers,
            ..
        } => {
            if let Some(data) = data {
                config.loader.data_dir = data.clone();
            }
            if let Some(n) = files {
                config.loader.parallel_files = *n;
            }
            if let Some(n) = datasets {
                config.loader.parallel_datasets = *n;
            }
            if let Some(n) = batch_size {
                config.loader.batch_size = *n;
            }
            if let Some(n) = workers {
                config.loader.workers = *n;
            }
        }
        Commands::Sample {
            by_year,
            mode,
            seed,
            ..
        } => {
            config.sampler.stratify_by_year |= *by_year;
            if let Some(mode) = mode {
                config.sampler.mode = mode.parse()?;
            }
            if seed.is_some() {
                config.sampler.seed = *seed;
            }
        }
        Commands::Enrich {
            fuji_url,
            fuji_user,
            fuji_pwd,
            concurrency,
            by_year,
            ..
        } => {
            if let Some(url) = fuji_url {
                config.enrichment.url = url.clone();
            }
            if let Some(user) = fuji_user {
                config.enrichment.username = user.clone();
            }
            if let Some(pwd) = fuji_pwd {
                config.enrichment.password = pwd.clone();
            }
            if let Some(n) = concurrency {
                config.enrichment.concurrency = *n;
            }
            config.sampler.stratify_by_year |= *by_year;
        }
        Commands::RefreshStrata | Commands::Count => {}
    }
    config.validate()?;

    info!("Opening store at {}", config.store.path.display());
    let store: SharedStore = match SledStore::open(&config.store) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Cannot open store: {}", e);
            return Err(e.into());
        }
    };
    let indexes = store.ensure_indexes().await?;
    info!("Indexes: {}", indexes.join(", "));

    match cli.command {
        Commands::Load { refresh_strata, .. } => {
            let pipeline = Arc::new(Pipeline::new(config.loader.clone(), store.clone())?);
            let stopper = pipeline.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    stopper.stop();
                }
            });

            let summary = pipeline.run().await?;
            println!(
                "upserted: {} modified: {} read: {} files: {} failed files: {} in {:.1}s",
                summary.totals.upserted,
                summary.totals.modified,
                summary.totals.read,
                summary.files_read,
                summary.files_failed,
                summary.elapsed.as_secs_f64()
            );
            if refresh_strata {
                let strata = store.refresh_strata(&population(&config)).await?;
                info!("Strata refreshed: {:?}", strata);
            }
        }
        Commands::RefreshStrata => {
            let strata = store.refresh_strata(&population(&config)).await?;
            println!(
                "scanned: {} counted: {} prefixes: {} years: {}",
                strata.documents_scanned,
                strata.documents_counted,
                strata.prefix_strata,
                strata.year_strata
            );
        }
        Commands::Sample { count, .. } => {
            let sampler = WeightedSampler::new(store, config.sampler.clone());
            for _ in 0..count {
                match sampler.sample().await {
                    Ok(doi) => println!("{}", doi),
                    Err(SamplerError::NoCandidate(reason)) => warn!("No candidate: {}", reason),
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Commands::Enrich { limit, .. } => {
            let client = Arc::new(EnrichmentClient::new(config.enrichment.clone())?);
            let sampler = Arc::new(WeightedSampler::new(store.clone(), config.sampler.clone()));
            let runner = Arc::new(EnrichmentRunner::new(
                sampler,
                store,
                client,
                &config.enrichment,
            )?);
            let stopper = runner.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    stopper.stop();
                }
            });

            let stats = runner.run(limit).await;
            println!(
                "evaluated: {} skipped: {} failed: {} no candidate: {}",
                stats.evaluated, stats.skipped, stats.failed, stats.no_candidate
            );
        }
        Commands::Count => {
            println!("{}", store.count_documents().await?);
        }
    }
    Ok(())
}
