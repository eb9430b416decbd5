use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::thread::available_parallelism;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rayon::ThreadPoolBuilder;
use tracing::{error, info, warn};

use super::catalog::CatalogConfig;
use super::fetcher::{CatalogTileSource, TileSource};
use super::partition::run_partition;
use crate::cli::{EnrichArgs, ExecutionMode};
use crate::db::{ensure_stat_columns, ground_table_exists, list_years, open_connection};

pub fn run(args: EnrichArgs) -> Result<()> {
    let config = CatalogConfig {
        catalog_url: args.catalog_url.clone(),
        collection: args.collection.clone(),
        timeout: (args.timeout_secs > 0).then(|| Duration::from_secs(args.timeout_secs)),
        s3_region: args.s3_region.clone(),
        window_cache_size: args.window_cache_size,
        asset_cache_size: args.asset_cache_size,
    };

    let connection = open_connection(&args.db_path)?;
    if !ground_table_exists(&connection)? {
        bail!(
            "{} has no ground_data table; run `groundfc ingest` first",
            args.db_path.display()
        );
    }
    ensure_stat_columns(&connection)?;
    let years = select_partitions(list_years(&connection)?, &args.years);
    drop(connection);

    let workers = args.workers.unwrap_or_else(default_worker_count).max(1);
    info!(
        db_path = %args.db_path.display(),
        partitions = years.len(),
        mode = args.mode.as_str(),
        workers,
        catalog = %config.catalog_url,
        collection = %config.collection,
        "starting enrichment"
    );

    run_batch(&args.db_path, &years, args.mode, workers, || {
        CatalogTileSource::connect(&config)
    })?;

    info!(partitions = years.len(), "enrichment finished");
    Ok(())
}

pub fn default_worker_count() -> usize {
    available_parallelism().map(|count| count.get()).unwrap_or(1)
}

/// Keeps the discovered years, narrowed to `requested` when any were given.
pub fn select_partitions(discovered: Vec<String>, requested: &[String]) -> Vec<String> {
    if requested.is_empty() {
        return discovered;
    }

    for year in requested {
        if !discovered.contains(year) {
            warn!(year = %year, "requested partition has no records");
        }
    }

    discovered
        .into_iter()
        .filter(|year| requested.contains(year))
        .collect()
}

/// Runs every partition and waits for all of them. Each partition gets its own
/// connection and its own tile source; a failing partition never affects others.
pub fn run_batch<F, S>(
    db_path: &Path,
    years: &[String],
    mode: ExecutionMode,
    workers: usize,
    open_source: F,
) -> Result<()>
where
    F: Fn() -> Result<S> + Sync,
    S: TileSource,
{
    match mode {
        ExecutionMode::Sequential => {
            for year in years {
                process_year(db_path, year, &open_source);
            }
        }
        ExecutionMode::Parallel => {
            let pool = ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|idx| format!("enrich-worker-{idx}"))
                .build()
                .context("failed to build partition worker pool")?;

            let open_source = &open_source;
            pool.scope(|scope| {
                for year in years {
                    scope.spawn(move |_| process_year(db_path, year, open_source));
                }
            });
        }
    }

    Ok(())
}

fn process_year<F, S>(db_path: &Path, year: &str, open_source: &F)
where
    F: Fn() -> Result<S>,
    S: TileSource,
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut connection = open_connection(db_path)?;
        let mut source = open_source()
            .with_context(|| format!("failed to initialize catalog access for {year}"))?;
        run_partition(&mut connection, &mut source, year)
    }));

    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => error!(year = %year, error = %format!("{err:#}"), "partition abandoned"),
        Err(_) => error!(year = %year, "partition worker panicked"),
    }
}
