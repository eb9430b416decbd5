use std::collections::HashSet;

use anyhow::{Context, Result, bail};
use csv::StringRecord;
use rusqlite::types::Value;
use tracing::warn;

use crate::db::{GROUND_TABLE, quote_identifier};
use crate::model::STAT_COLUMNS;
use crate::util::normalize_month;

/// Source columns with no meaning downstream.
const DROPPED_COLUMNS: [&str; 2] = ["time", "index_right"];

/// Where the identity columns live in the CSV, and which other columns ride along.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct ColumnLayout {
    grid_id: usize,
    month: usize,
    lat: usize,
    lon: usize,
    extras: Vec<(usize, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub(super) struct ParsedRow {
    pub(super) grid_id: i64,
    pub(super) month: String,
    pub(super) year: i32,
    pub(super) values: Vec<Value>,
}

impl ColumnLayout {
    pub(super) fn from_headers(headers: &StringRecord) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut grid_id = None;
        let mut month = None;
        let mut lat = None;
        let mut lon = None;
        let mut extras = Vec::new();

        for (index, raw_name) in headers.iter().enumerate() {
            let name = raw_name.trim();
            if name.is_empty() {
                bail!("CSV header column {} has no name", index + 1);
            }
            if !seen.insert(name.to_string()) {
                bail!("CSV header repeats column {name}");
            }

            match name {
                "grid_id" => grid_id = Some(index),
                "month" => month = Some(index),
                "lat" => lat = Some(index),
                "lon" => lon = Some(index),
                _ if DROPPED_COLUMNS.contains(&name) => {}
                _ if STAT_COLUMNS.contains(&name) => {
                    warn!(column = %name, "ignoring statistic column from CSV");
                }
                _ => extras.push((index, name.to_string())),
            }
        }

        Ok(Self {
            grid_id: grid_id.context("CSV is missing the grid_id column")?,
            month: month.context("CSV is missing the month column")?,
            lat: lat.context("CSV is missing the lat column")?,
            lon: lon.context("CSV is missing the lon column")?,
            extras,
        })
    }

    pub(super) fn extra_names(&self) -> Vec<String> {
        self.extras.iter().map(|(_, name)| name.clone()).collect()
    }

    pub(super) fn insert_sql(&self) -> String {
        let mut columns = vec![
            "grid_id".to_string(),
            "month".to_string(),
            "lat".to_string(),
            "lon".to_string(),
        ];
        columns.extend(self.extras.iter().map(|(_, name)| quote_identifier(name)));
        let placeholders = (1..=columns.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<String>>()
            .join(", ");

        format!(
            "INSERT INTO {GROUND_TABLE}({}) VALUES({placeholders})
             ON CONFLICT(grid_id, month) DO NOTHING",
            columns.join(", ")
        )
    }

    pub(super) fn parse_row(&self, record: &StringRecord) -> Result<ParsedRow> {
        let field = |index: usize, name: &str| {
            record
                .get(index)
                .map(str::trim)
                .with_context(|| format!("row is missing {name}"))
        };

        let grid_id = parse_grid_id(field(self.grid_id, "grid_id")?)?;
        let month = normalize_month(field(self.month, "month")?)?;
        let year = month[..4]
            .parse::<i32>()
            .with_context(|| format!("invalid year in month {month}"))?;
        let lat = parse_coordinate(field(self.lat, "lat")?, "lat")?;
        let lon = parse_coordinate(field(self.lon, "lon")?, "lon")?;

        let mut values = vec![
            Value::Integer(grid_id),
            Value::Text(month.clone()),
            Value::Real(lat),
            Value::Real(lon),
        ];
        values.extend(
            self.extras
                .iter()
                .map(|(index, _)| infer_value(record.get(*index).unwrap_or(""))),
        );

        Ok(ParsedRow {
            grid_id,
            month,
            year,
            values,
        })
    }
}

fn parse_grid_id(raw: &str) -> Result<i64> {
    if let Ok(value) = raw.parse::<i64>() {
        return Ok(value);
    }

    // Exported frames sometimes write integer ids as floats ("7.0").
    let value = raw
        .parse::<f64>()
        .with_context(|| format!("invalid grid_id {raw:?}"))?;
    if !value.is_finite() || value.fract() != 0.0 {
        bail!("grid_id is not an integer: {raw:?}");
    }
    Ok(value as i64)
}

fn parse_coordinate(raw: &str, name: &str) -> Result<f64> {
    let value = raw
        .parse::<f64>()
        .with_context(|| format!("invalid {name} {raw:?}"))?;
    if !value.is_finite() {
        bail!("{name} is not finite: {raw:?}");
    }
    Ok(value)
}

/// Numeric-looking text becomes INTEGER or REAL, empty becomes NULL.
pub(super) fn infer_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if let Ok(integer) = trimmed.parse::<i64>() {
        return Value::Integer(integer);
    }
    match trimmed.parse::<f64>() {
        Ok(real) if real.is_finite() => Value::Real(real),
        _ => Value::Text(trimmed.to_string()),
    }
}
