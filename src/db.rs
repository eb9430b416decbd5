use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

use crate::model::{
    GroundRecord, PartitionProgress, STAT_COLUMNS, StatField, StatisticsResult, UNRESOLVED_MARKER,
    WorkItem,
};

pub const GROUND_TABLE: &str = "ground_data";
pub const DB_SCHEMA_VERSION: &str = "0.1.0";

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens an existing database; a missing file is an error, never an empty database.
pub fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("failed to open {}", db_path.display()))?;
    configure_connection(&connection)?;
    Ok(connection)
}

pub fn create_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    configure_connection(&connection)?;
    Ok(connection)
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "FULL")
        .context("failed to set synchronous=FULL")?;
    connection
        .busy_timeout(BUSY_TIMEOUT)
        .context("failed to set busy timeout")?;
    Ok(())
}

pub fn ensure_metadata_table(connection: &Connection) -> Result<()> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

pub fn set_metadata(connection: &Connection, key: &str, value: &str) -> Result<()> {
    connection
        .execute(
            "INSERT INTO metadata(key, value) VALUES(?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )
        .with_context(|| format!("failed to write metadata key {key}"))?;
    Ok(())
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Replaces the ground table. `extra_columns` are carried through untyped.
pub fn create_ground_table(connection: &Connection, extra_columns: &[String]) -> Result<()> {
    let mut columns = vec![
        "grid_id INTEGER NOT NULL".to_string(),
        "month TEXT NOT NULL".to_string(),
        "lat REAL NOT NULL".to_string(),
        "lon REAL NOT NULL".to_string(),
    ];
    columns.extend(extra_columns.iter().map(|name| quote_identifier(name)));
    columns.push("UNIQUE(grid_id, month)".to_string());

    connection
        .execute_batch(&format!(
            "
            DROP TABLE IF EXISTS {GROUND_TABLE};
            CREATE TABLE {GROUND_TABLE} (
              {}
            );
            CREATE INDEX IF NOT EXISTS idx_ground_data_year ON {GROUND_TABLE}(substr(month, 1, 4));
            ",
            columns.join(",\n              ")
        ))
        .context("failed to create ground_data table")?;

    ensure_stat_columns(connection)
}

pub fn ground_table_exists(connection: &Connection) -> Result<bool> {
    let found = connection
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [GROUND_TABLE],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Adds any missing statistic column with the unresolved marker as its default.
pub fn ensure_stat_columns(connection: &Connection) -> Result<()> {
    for column in STAT_COLUMNS {
        ensure_column_exists(
            connection,
            GROUND_TABLE,
            &format!("{column} REAL DEFAULT '{UNRESOLVED_MARKER}'"),
        )?;
    }
    Ok(())
}

fn ensure_column_exists(
    connection: &Connection,
    table_name: &str,
    column_definition: &str,
) -> Result<()> {
    let Some(column_name) = column_definition.split_whitespace().next() else {
        bail!("invalid column definition: {column_definition}");
    };

    let pragma_sql = format!("PRAGMA table_info({table_name})");
    let mut statement = connection
        .prepare(&pragma_sql)
        .with_context(|| format!("failed to inspect schema for table {table_name}"))?;

    let mut rows = statement.query([])?;
    while let Some(row) = rows.next()? {
        let existing_name: String = row.get(1)?;
        if existing_name == column_name {
            return Ok(());
        }
    }

    let alter_sql = format!("ALTER TABLE {table_name} ADD COLUMN {column_definition}");
    connection
        .execute(&alter_sql, [])
        .with_context(|| format!("failed to add column {column_name} on {table_name}"))?;

    Ok(())
}

fn incomplete_predicate() -> String {
    STAT_COLUMNS
        .iter()
        .map(|column| format!("{column} IS '{UNRESOLVED_MARKER}'"))
        .collect::<Vec<String>>()
        .join(" OR ")
}

pub fn list_years(connection: &Connection) -> Result<Vec<String>> {
    let mut statement = connection
        .prepare(&format!(
            "SELECT DISTINCT substr(month, 1, 4) AS year FROM {GROUND_TABLE} ORDER BY year"
        ))
        .context("failed to prepare partition listing")?;

    let years = statement
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<String>>>()
        .context("failed to list partition years")?;

    Ok(years)
}

/// Every record of `year` still holding at least one unresolved marker.
pub fn select_incomplete(connection: &Connection, year: &str) -> Result<Vec<WorkItem>> {
    let sql = format!(
        "
        SELECT month, lat, lon, grid_id
        FROM {GROUND_TABLE}
        WHERE substr(month, 1, 4) = ?1
          AND ({})
        ORDER BY rowid
        ",
        incomplete_predicate()
    );

    let mut statement = connection
        .prepare(&sql)
        .context("failed to prepare incomplete-record selection")?;

    let items = statement
        .query_map([year], |row| {
            Ok(WorkItem {
                month: row.get(0)?,
                lat: row.get(1)?,
                lon: row.get(2)?,
                grid_id: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<WorkItem>>>()
        .with_context(|| format!("failed to select incomplete records for {year}"))?;

    Ok(items)
}

/// Writes all nine statistics for one (grid_id, month) and commits.
/// Returns the number of rows changed (0 or 1).
pub fn apply_statistics(connection: &mut Connection, result: &StatisticsResult) -> Result<usize> {
    let values = result.cover.to_columns();
    if let Some(position) = values.iter().position(|value| !value.is_finite()) {
        bail!(
            "refusing to store non-finite {} for grid {} month {}",
            STAT_COLUMNS[position],
            result.grid_id,
            result.month
        );
    }

    let assignments = STAT_COLUMNS
        .iter()
        .enumerate()
        .map(|(index, column)| format!("{column} = ?{}", index + 1))
        .collect::<Vec<String>>()
        .join(", ");
    let sql = format!("UPDATE {GROUND_TABLE} SET {assignments} WHERE grid_id = ?10 AND month = ?11");

    let tx = connection
        .transaction()
        .context("failed to begin statistics update")?;
    let changed = tx
        .execute(
            &sql,
            params![
                values[0],
                values[1],
                values[2],
                values[3],
                values[4],
                values[5],
                values[6],
                values[7],
                values[8],
                result.grid_id,
                &result.month
            ],
        )
        .with_context(|| {
            format!(
                "failed to update grid {} month {}",
                result.grid_id, result.month
            )
        })?;

    if changed > 1 {
        bail!(
            "update for grid {} month {} matched {changed} rows",
            result.grid_id,
            result.month
        );
    }

    tx.commit().context("failed to commit statistics update")?;
    Ok(changed)
}

fn decode_stat_field(value: ValueRef<'_>) -> StatField {
    match value {
        ValueRef::Null => StatField::Missing,
        ValueRef::Integer(number) => StatField::Value(number as f64),
        ValueRef::Real(number) => StatField::Value(number),
        ValueRef::Text(bytes) if bytes == UNRESOLVED_MARKER.as_bytes() => StatField::Unresolved,
        ValueRef::Text(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|text| text.trim().parse::<f64>().ok())
            .filter(|number| number.is_finite())
            .map(StatField::Value)
            .unwrap_or(StatField::Missing),
        ValueRef::Blob(_) => StatField::Missing,
    }
}

pub fn load_record(
    connection: &Connection,
    grid_id: i64,
    month: &str,
) -> Result<Option<GroundRecord>> {
    let sql = format!(
        "SELECT grid_id, month, lat, lon, {} FROM {GROUND_TABLE} WHERE grid_id = ?1 AND month = ?2",
        STAT_COLUMNS.join(", ")
    );

    let record = connection
        .query_row(&sql, params![grid_id, month], |row| {
            let mut stats = [StatField::Missing; 9];
            for (index, field) in stats.iter_mut().enumerate() {
                *field = decode_stat_field(row.get_ref(4 + index)?);
            }
            Ok(GroundRecord {
                grid_id: row.get(0)?,
                month: row.get(1)?,
                lat: row.get(2)?,
                lon: row.get(3)?,
                stats,
            })
        })
        .optional()
        .with_context(|| format!("failed to load grid {grid_id} month {month}"))?;

    Ok(record)
}

pub fn partition_progress(connection: &Connection) -> Result<Vec<PartitionProgress>> {
    let sql = format!(
        "
        SELECT substr(month, 1, 4) AS year,
               COUNT(*),
               SUM(CASE WHEN ({}) THEN 1 ELSE 0 END)
        FROM {GROUND_TABLE}
        GROUP BY year
        ORDER BY year
        ",
        incomplete_predicate()
    );

    let mut statement = connection
        .prepare(&sql)
        .context("failed to prepare partition progress query")?;
    let progress = statement
        .query_map([], |row| {
            Ok(PartitionProgress {
                year: row.get(0)?,
                total: row.get(1)?,
                incomplete: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<PartitionProgress>>>()
        .context("failed to read partition progress")?;

    Ok(progress)
}
