use anyhow::Result;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::db::{ground_table_exists, load_record, open_connection, partition_progress};
use crate::model::{STAT_COLUMNS, StatField};
use crate::util::normalize_month;

pub fn run(args: StatusArgs) -> Result<()> {
    info!(db_path = %args.db_path.display(), "status requested");

    if !args.db_path.exists() {
        warn!(path = %args.db_path.display(), "database file missing");
        return Ok(());
    }

    let connection = open_connection(&args.db_path)?;
    if !ground_table_exists(&connection)? {
        warn!(path = %args.db_path.display(), "ground_data table missing");
        return Ok(());
    }

    if let (Some(grid_id), Some(month)) = (args.grid_id, args.month.as_deref()) {
        return show_record(&connection, grid_id, month);
    }

    let progress = partition_progress(&connection)?;
    let mut total = 0_i64;
    let mut incomplete = 0_i64;

    for partition in &progress {
        total += partition.total;
        incomplete += partition.incomplete;
        info!(
            year = %partition.year,
            records = partition.total,
            complete = partition.total - partition.incomplete,
            incomplete = partition.incomplete,
            "partition status"
        );
    }

    info!(
        partitions = progress.len(),
        records = total,
        complete = total - incomplete,
        incomplete,
        "database status"
    );

    Ok(())
}

fn show_record(connection: &Connection, grid_id: i64, month: &str) -> Result<()> {
    let month = normalize_month(month)?;
    let Some(record) = load_record(connection, grid_id, &month)? else {
        warn!(grid_id, month = %month, "no such record");
        return Ok(());
    };

    info!(
        grid_id = record.grid_id,
        month = %record.month,
        lat = record.lat,
        lon = record.lon,
        complete = record.is_complete(),
        "record"
    );
    for (column, field) in STAT_COLUMNS.iter().zip(record.stats) {
        match field {
            StatField::Value(value) => info!(column = %column, value, "statistic"),
            StatField::Unresolved => info!(column = %column, "statistic unresolved"),
            StatField::Missing => info!(column = %column, "statistic missing"),
        }
    }

    Ok(())
}
