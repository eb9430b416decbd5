use anyhow::Result;
use rusqlite::Connection;
use tracing::{error, info, warn};

use super::aggregate::summarize;
use super::fetcher::{FetchOutcome, TileSource};
use crate::db::{apply_statistics, select_incomplete};
use crate::model::{PartitionTally, WorkItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStage {
    Fetching,
    Aggregating,
    Updating,
}

impl ItemStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetching => "fetching",
            Self::Aggregating => "aggregating",
            Self::Updating => "updating",
        }
    }
}

#[derive(Debug)]
pub struct ItemFailure {
    pub stage: ItemStage,
    pub error: anyhow::Error,
}

impl ItemFailure {
    fn at(stage: ItemStage) -> impl FnOnce(anyhow::Error) -> Self {
        move |error| Self { stage, error }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Updated,
    NoData,
    /// The record disappeared between the snapshot and the write.
    Vanished,
}

/// Enriches every incomplete record of `year`. The work list is taken once up
/// front; each item is attempted exactly once and item failures never stop the
/// partition. Only a failure to take the snapshot is returned as an error.
pub fn run_partition<S>(
    connection: &mut Connection,
    source: &mut S,
    year: &str,
) -> Result<PartitionTally>
where
    S: TileSource + ?Sized,
{
    let snapshot = select_incomplete(connection, year)?;
    info!(year = %year, tiles = snapshot.len(), "processing partition");

    let mut tally = PartitionTally::default();
    for item in &snapshot {
        tally.attempted += 1;
        match process_item(connection, source, item, year) {
            Ok(ItemOutcome::Updated) => tally.updated += 1,
            Ok(ItemOutcome::NoData) => {
                tally.no_data += 1;
                warn!(
                    year = %year,
                    grid_id = item.grid_id,
                    month = %item.month,
                    lat = item.lat,
                    lon = item.lon,
                    "no data found; record left unresolved"
                );
            }
            Ok(ItemOutcome::Vanished) => {
                tally.failed += 1;
                warn!(
                    year = %year,
                    grid_id = item.grid_id,
                    month = %item.month,
                    lat = item.lat,
                    lon = item.lon,
                    "record vanished before update"
                );
            }
            Err(failure) => {
                tally.failed += 1;
                log_failure(year, item, &failure);
            }
        }
    }

    info!(
        year = %year,
        attempted = tally.attempted,
        updated = tally.updated,
        no_data = tally.no_data,
        failed = tally.failed,
        "partition finished"
    );

    Ok(tally)
}

fn process_item<S>(
    connection: &mut Connection,
    source: &mut S,
    item: &WorkItem,
    year: &str,
) -> Result<ItemOutcome, ItemFailure>
where
    S: TileSource + ?Sized,
{
    let dataset = match source
        .fetch(item, year)
        .map_err(ItemFailure::at(ItemStage::Fetching))?
    {
        FetchOutcome::Loaded(dataset) => dataset,
        FetchOutcome::NoData => return Ok(ItemOutcome::NoData),
    };

    let result = summarize(item, &dataset).map_err(ItemFailure::at(ItemStage::Aggregating))?;
    let changed =
        apply_statistics(connection, &result).map_err(ItemFailure::at(ItemStage::Updating))?;

    Ok(if changed == 0 {
        ItemOutcome::Vanished
    } else {
        ItemOutcome::Updated
    })
}

fn log_failure(year: &str, item: &WorkItem, failure: &ItemFailure) {
    let message = format!("{:#}", failure.error);
    match failure.stage {
        ItemStage::Updating => error!(
            year = %year,
            grid_id = item.grid_id,
            month = %item.month,
            lat = item.lat,
            lon = item.lon,
            stage = failure.stage.as_str(),
            error = %message,
            "failed to store statistics"
        ),
        ItemStage::Fetching | ItemStage::Aggregating => warn!(
            year = %year,
            grid_id = item.grid_id,
            month = %item.month,
            lat = item.lat,
            lon = item.lon,
            stage = failure.stage.as_str(),
            error = %message,
            "skipping item"
        ),
    }
}
