use std::io::Read;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, params_from_iter};
use tracing::{info, warn};

use super::layout::ColumnLayout;
use crate::cli::IngestArgs;
use crate::db::{
    DB_SCHEMA_VERSION, create_connection, create_ground_table, ensure_metadata_table, set_metadata,
};
use crate::util::{ensure_parent_directory, now_utc_string};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(super) struct IngestCounts {
    pub(super) rows_read: usize,
    pub(super) inserted: usize,
    pub(super) excluded_by_year: usize,
    pub(super) duplicates: usize,
}

pub fn run(args: IngestArgs) -> Result<()> {
    info!(
        csv_path = %args.csv_path.display(),
        db_path = %args.db_path.display(),
        "starting ingest"
    );

    let mut reader = csv::Reader::from_path(&args.csv_path)
        .with_context(|| format!("failed to open {}", args.csv_path.display()))?;

    ensure_parent_directory(&args.db_path)?;
    let mut connection = create_connection(&args.db_path)?;
    let counts = ingest_csv(&mut connection, &mut reader, &args.exclude_years)?;

    ensure_metadata_table(&connection)?;
    set_metadata(&connection, "db_schema_version", DB_SCHEMA_VERSION)?;
    set_metadata(&connection, "ingested_at", &now_utc_string())?;
    set_metadata(
        &connection,
        "source_csv",
        &args.csv_path.display().to_string(),
    )?;

    info!(
        rows_read = counts.rows_read,
        inserted = counts.inserted,
        excluded_by_year = counts.excluded_by_year,
        duplicates = counts.duplicates,
        "ingest completed"
    );

    Ok(())
}

/// Replaces the ground table with the CSV contents in one transaction, so a
/// bad file leaves any previous table untouched.
pub(super) fn ingest_csv<R: Read>(
    connection: &mut Connection,
    reader: &mut csv::Reader<R>,
    exclude_years: &[i32],
) -> Result<IngestCounts> {
    let headers = reader
        .headers()
        .context("failed to read CSV header")?
        .clone();
    let layout = ColumnLayout::from_headers(&headers)?;

    let tx = connection.transaction()?;
    create_ground_table(&tx, &layout.extra_names())?;

    let mut counts = IngestCounts::default();
    {
        let mut statement = tx
            .prepare(&layout.insert_sql())
            .context("failed to prepare ground_data insert")?;

        for (index, record) in reader.records().enumerate() {
            let line = index + 2;
            let record = record.with_context(|| format!("failed to read CSV line {line}"))?;
            counts.rows_read += 1;

            let row = layout
                .parse_row(&record)
                .with_context(|| format!("invalid CSV line {line}"))?;
            if exclude_years.contains(&row.year) {
                counts.excluded_by_year += 1;
                continue;
            }

            let changed = statement
                .execute(params_from_iter(row.values.iter()))
                .with_context(|| format!("failed to insert CSV line {line}"))?;
            if changed == 0 {
                counts.duplicates += 1;
                warn!(
                    grid_id = row.grid_id,
                    month = %row.month,
                    line,
                    "duplicate record skipped"
                );
            } else {
                counts.inserted += 1;
            }
        }
    }

    if counts.rows_read == 0 {
        bail!("CSV file has no data rows");
    }

    tx.commit().context("failed to commit ingest")?;
    Ok(counts)
}
