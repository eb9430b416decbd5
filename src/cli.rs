use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::commands::enrich::{DEFAULT_CATALOG_URL, DEFAULT_S3_REGION, FRACTIONAL_COVER_COLLECTION};

#[derive(Parser, Debug)]
#[command(
    name = "groundfc",
    version,
    about = "Enrich ground survey records with satellite fractional-cover percentiles"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load the ground survey CSV into a fresh database table.
    Ingest(IngestArgs),
    /// Fetch fractional-cover statistics for every incomplete record.
    Enrich(EnrichArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct IngestArgs {
    #[arg(long, default_value = "Data/base_data_1986-2018.csv")]
    pub csv_path: PathBuf,

    #[arg(long, default_value = "fire.db")]
    pub db_path: PathBuf,

    #[arg(long = "exclude-year", default_values_t = [1986])]
    pub exclude_years: Vec<i32>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct EnrichArgs {
    #[arg(long, default_value = "fire.db")]
    pub db_path: PathBuf,

    #[arg(long, value_enum, default_value_t = ExecutionMode::Sequential)]
    pub mode: ExecutionMode,

    /// Worker pool size for parallel mode; defaults to available parallelism.
    #[arg(long)]
    pub workers: Option<usize>,

    #[arg(long = "year")]
    pub years: Vec<String>,

    #[arg(long, default_value = DEFAULT_CATALOG_URL)]
    pub catalog_url: String,

    #[arg(long, default_value = FRACTIONAL_COVER_COLLECTION)]
    pub collection: String,

    /// Per-request timeout for catalog and asset downloads; 0 waits forever.
    #[arg(long, default_value_t = 120)]
    pub timeout_secs: u64,

    #[arg(long, default_value = DEFAULT_S3_REGION)]
    pub s3_region: String,

    /// Cropped band windows kept per worker.
    #[arg(long, default_value_t = 32)]
    pub window_cache_size: usize,

    /// Downloaded band assets kept per worker; nine bands over two tiles by default.
    #[arg(long, default_value_t = 18)]
    pub asset_cache_size: usize,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = "fire.db")]
    pub db_path: PathBuf,

    /// Show the stored statistics of one record instead of the summary.
    #[arg(long, requires = "month")]
    pub grid_id: Option<i64>,

    #[arg(long, requires = "grid_id")]
    pub month: Option<String>,
}
