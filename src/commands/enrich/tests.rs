use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use rusqlite::Connection;

use super::fetcher::{FetchOutcome, TileSource};
use super::partition::run_partition;
use super::raster::{BandGrid, RasterDataset};
use super::run::{run_batch, select_partitions};
use crate::cli::ExecutionMode;
use crate::db::tests::{count_records, memory_db, seed_record};
use crate::db::{
    apply_statistics, create_connection, create_ground_table, load_record, select_incomplete,
};
use crate::model::{
    CoverPercentiles, PartitionTally, STAT_COLUMNS, StatField, StatisticsResult, WorkItem,
};

const SCENARIO_VALUES: [f64; 9] = [12.5, 20.0, 35.0, 5.0, 10.0, 18.0, 1.0, 2.0, 4.0];

#[derive(Clone, Copy)]
enum Script {
    Cover([f64; 9]),
    NoData,
    Fail,
    MissingBand,
    Panic,
}

fn dataset(values: [f64; 9], bands: &[&str]) -> RasterDataset {
    let mut dataset = RasterDataset::default();
    for (band, value) in STAT_COLUMNS.iter().zip(values) {
        if bands.contains(band) {
            dataset.push(
                band,
                Arc::new(BandGrid {
                    width: 1,
                    height: 1,
                    samples: vec![value as f32],
                }),
            );
        }
    }
    dataset
}

/// Plays back a fixed outcome per (grid_id, month); years listed in
/// `failing_years` fail every fetch.
#[derive(Default)]
struct ScriptedSource {
    scripts: HashMap<(i64, String), Script>,
    failing_years: Vec<String>,
    calls: Vec<(i64, String)>,
}

impl ScriptedSource {
    fn with(mut self, grid_id: i64, month: &str, script: Script) -> Self {
        self.scripts.insert((grid_id, month.to_string()), script);
        self
    }

    fn failing_year(mut self, year: &str) -> Self {
        self.failing_years.push(year.to_string());
        self
    }
}

impl TileSource for ScriptedSource {
    fn fetch(&mut self, item: &WorkItem, year: &str) -> Result<FetchOutcome> {
        self.calls.push((item.grid_id, item.month.clone()));
        if self.failing_years.iter().any(|failing| failing == year) {
            return Err(anyhow!("catalog unreachable for {year}"));
        }

        let script = self
            .scripts
            .get(&(item.grid_id, item.month.clone()))
            .copied()
            .unwrap_or(Script::Cover([1.0; 9]));

        match script {
            Script::Cover(values) => Ok(FetchOutcome::Loaded(dataset(values, &STAT_COLUMNS))),
            Script::NoData => Ok(FetchOutcome::NoData),
            Script::Fail => Err(anyhow!("connection reset")),
            Script::MissingBand => Ok(FetchOutcome::Loaded(dataset(
                [1.0; 9],
                &STAT_COLUMNS[..8],
            ))),
            Script::Panic => panic!("raster loader exploded"),
        }
    }
}

fn file_db(dir: &Path) -> PathBuf {
    let path = dir.join("fire.db");
    let connection = create_connection(&path).unwrap();
    create_ground_table(&connection, &[]).unwrap();
    path
}

fn is_complete(connection: &Connection, grid_id: i64, month: &str) -> bool {
    load_record(connection, grid_id, month)
        .unwrap()
        .unwrap()
        .is_complete()
}

#[test]
fn partition_run_writes_band_means_to_the_record() {
    let mut connection = memory_db();
    seed_record(&connection, 7, "2015-06", -30.0, 145.0);
    let mut source = ScriptedSource::default().with(7, "2015-06", Script::Cover(SCENARIO_VALUES));

    let tally = run_partition(&mut connection, &mut source, "2015").unwrap();

    assert_eq!(
        tally,
        PartitionTally {
            attempted: 1,
            updated: 1,
            no_data: 0,
            failed: 0,
        }
    );
    let record = load_record(&connection, 7, "2015-06").unwrap().unwrap();
    assert!(record.is_complete());
    let stored = record
        .stats
        .iter()
        .map(|field| match field {
            StatField::Value(value) => *value,
            other => panic!("unexpected field {other:?}"),
        })
        .collect::<Vec<f64>>();
    assert_eq!(stored, SCENARIO_VALUES.to_vec());
}

#[test]
fn no_data_leaves_record_unresolved_for_the_next_run() {
    let mut connection = memory_db();
    seed_record(&connection, 9, "2010-03", -20.0, 130.0);
    let mut source = ScriptedSource::default().with(9, "2010-03", Script::NoData);

    let tally = run_partition(&mut connection, &mut source, "2010").unwrap();
    assert_eq!(tally.no_data, 1);
    assert_eq!(tally.updated, 0);

    let record = load_record(&connection, 9, "2010-03").unwrap().unwrap();
    assert!(record.stats.iter().all(|field| field.is_unresolved()));

    let again = select_incomplete(&connection, "2010").unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].grid_id, 9);
}

#[test]
fn item_failures_do_not_stop_the_partition() {
    let mut connection = memory_db();
    seed_record(&connection, 1, "2012-01", -30.0, 145.0);
    seed_record(&connection, 2, "2012-02", -30.0, 145.0);
    seed_record(&connection, 3, "2012-03", -30.0, 145.0);
    let mut source = ScriptedSource::default()
        .with(1, "2012-01", Script::Fail)
        .with(2, "2012-02", Script::MissingBand)
        .with(3, "2012-03", Script::Cover([3.0; 9]));

    let tally = run_partition(&mut connection, &mut source, "2012").unwrap();

    assert_eq!(
        tally,
        PartitionTally {
            attempted: 3,
            updated: 1,
            no_data: 0,
            failed: 2,
        }
    );
    assert!(!is_complete(&connection, 1, "2012-01"));
    assert!(!is_complete(&connection, 2, "2012-02"));
    assert!(is_complete(&connection, 3, "2012-03"));
    assert_eq!(source.calls.len(), 3);
}

#[test]
fn partition_only_touches_its_own_year_and_skips_complete_records() {
    let mut connection = memory_db();
    seed_record(&connection, 1, "2013-01", -30.0, 145.0);
    seed_record(&connection, 2, "2013-02", -30.0, 145.0);
    seed_record(&connection, 1, "2014-01", -30.0, 145.0);
    apply_statistics(
        &mut connection,
        &StatisticsResult {
            month: "2013-02".to_string(),
            grid_id: 2,
            cover: CoverPercentiles::from_columns([5.0; 9]),
        },
    )
    .unwrap();
    let mut source = ScriptedSource::default();

    run_partition(&mut connection, &mut source, "2013").unwrap();

    assert_eq!(source.calls, vec![(1, "2013-01".to_string())]);
    assert!(!is_complete(&connection, 1, "2014-01"));
}

/// Completes a sibling record through its own connection during the first fetch.
struct InterferingSource {
    other: Connection,
    calls: usize,
}

impl TileSource for InterferingSource {
    fn fetch(&mut self, item: &WorkItem, _year: &str) -> Result<FetchOutcome> {
        self.calls += 1;
        if self.calls == 1 {
            apply_statistics(
                &mut self.other,
                &StatisticsResult {
                    month: "2016-02".to_string(),
                    grid_id: 2,
                    cover: CoverPercentiles::from_columns([9.0; 9]),
                },
            )?;
        }
        let value = item.grid_id as f64;
        Ok(FetchOutcome::Loaded(dataset([value; 9], &STAT_COLUMNS)))
    }
}

#[test]
fn snapshot_is_not_shrunk_by_concurrent_completion() {
    let dir = tempfile::tempdir().unwrap();
    let path = file_db(dir.path());
    let mut connection = create_connection(&path).unwrap();
    seed_record(&connection, 1, "2016-01", -30.0, 145.0);
    seed_record(&connection, 2, "2016-02", -30.0, 145.0);

    let mut source = InterferingSource {
        other: create_connection(&path).unwrap(),
        calls: 0,
    };
    let tally = run_partition(&mut connection, &mut source, "2016").unwrap();

    assert_eq!(tally.attempted, 2);
    assert_eq!(tally.updated, 2);
    assert_eq!(source.calls, 2);

    let record = load_record(&connection, 2, "2016-02").unwrap().unwrap();
    assert_eq!(record.stats[0], StatField::Value(2.0));
    assert_eq!(count_records(&connection, 2, "2016-02").unwrap(), 1);
}

#[test]
fn storage_fault_on_one_record_does_not_stop_the_partition() {
    let mut connection = memory_db();
    seed_record(&connection, 1, "2012-01", -30.0, 145.0);
    seed_record(&connection, 2, "2012-02", -30.0, 145.0);
    connection
        .execute_batch(
            "CREATE TRIGGER reject_grid_one BEFORE UPDATE ON ground_data
             WHEN OLD.grid_id = 1
             BEGIN SELECT RAISE(ABORT, 'storage rejected write'); END;",
        )
        .unwrap();
    let mut source = ScriptedSource::default();

    let tally = run_partition(&mut connection, &mut source, "2012").unwrap();

    assert_eq!(
        tally,
        PartitionTally {
            attempted: 2,
            updated: 1,
            no_data: 0,
            failed: 1,
        }
    );
    assert!(!is_complete(&connection, 1, "2012-01"));
    assert!(is_complete(&connection, 2, "2012-02"));
    let remaining = select_incomplete(&connection, "2012").unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].grid_id, 1);
}

/// Deletes the record being fetched through its own connection.
struct DeletingSource {
    other: Connection,
}

impl TileSource for DeletingSource {
    fn fetch(&mut self, item: &WorkItem, _year: &str) -> Result<FetchOutcome> {
        self.other.execute(
            "DELETE FROM ground_data WHERE grid_id = ?1 AND month = ?2",
            rusqlite::params![item.grid_id, item.month],
        )?;
        Ok(FetchOutcome::Loaded(dataset([4.0; 9], &STAT_COLUMNS)))
    }
}

#[test]
fn record_deleted_mid_fetch_counts_as_failed() {
    let dir = tempfile::tempdir().unwrap();
    let path = file_db(dir.path());
    let mut connection = create_connection(&path).unwrap();
    seed_record(&connection, 5, "2017-04", -30.0, 145.0);
    seed_record(&connection, 6, "2017-05", -30.0, 145.0);

    let mut source = DeletingSource {
        other: create_connection(&path).unwrap(),
    };
    let tally = run_partition(&mut connection, &mut source, "2017").unwrap();

    assert_eq!(
        tally,
        PartitionTally {
            attempted: 2,
            updated: 0,
            no_data: 0,
            failed: 2,
        }
    );
    assert_eq!(count_records(&connection, 5, "2017-04").unwrap(), 0);
    assert_eq!(count_records(&connection, 6, "2017-05").unwrap(), 0);
}

fn seed_three_years(path: &Path) {
    let connection = create_connection(path).unwrap();
    for (grid_id, month) in [
        (1, "2010-01"),
        (2, "2010-02"),
        (1, "2011-01"),
        (2, "2011-02"),
        (1, "2012-01"),
        (2, "2012-02"),
    ] {
        seed_record(&connection, grid_id, month, -30.0, 145.0);
    }
}

fn assert_years(path: &Path, complete: &[&str], incomplete: &[&str]) {
    let connection = create_connection(path).unwrap();
    for year in complete {
        assert!(
            select_incomplete(&connection, year).unwrap().is_empty(),
            "{year} should be complete"
        );
    }
    for year in incomplete {
        assert_eq!(
            select_incomplete(&connection, year).unwrap().len(),
            2,
            "{year} should be untouched"
        );
    }
}

fn years() -> Vec<String> {
    vec!["2010".to_string(), "2011".to_string(), "2012".to_string()]
}

#[test]
fn sequential_batch_isolates_a_failing_partition() {
    let dir = tempfile::tempdir().unwrap();
    let path = file_db(dir.path());
    seed_three_years(&path);

    run_batch(&path, &years(), ExecutionMode::Sequential, 1, || {
        Ok(ScriptedSource::default().failing_year("2011"))
    })
    .unwrap();

    assert_years(&path, &["2010", "2012"], &["2011"]);
}

#[test]
fn parallel_batch_isolates_a_failing_partition() {
    let dir = tempfile::tempdir().unwrap();
    let path = file_db(dir.path());
    seed_three_years(&path);

    run_batch(&path, &years(), ExecutionMode::Parallel, 3, || {
        Ok(ScriptedSource::default().failing_year("2011"))
    })
    .unwrap();

    assert_years(&path, &["2010", "2012"], &["2011"]);
}

#[test]
fn parallel_batch_survives_a_panicking_partition() {
    let dir = tempfile::tempdir().unwrap();
    let path = file_db(dir.path());
    seed_three_years(&path);

    run_batch(&path, &years(), ExecutionMode::Parallel, 2, || {
        Ok(ScriptedSource::default()
            .with(1, "2011-01", Script::Panic)
            .with(2, "2011-02", Script::Panic))
    })
    .unwrap();

    assert_years(&path, &["2010", "2012"], &["2011"]);
}

#[test]
fn partition_is_abandoned_when_catalog_setup_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = file_db(dir.path());
    seed_three_years(&path);
    let opened = AtomicUsize::new(0);

    run_batch(&path, &years(), ExecutionMode::Sequential, 1, || {
        if opened.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(anyhow!("catalog unreachable"));
        }
        Ok(ScriptedSource::default())
    })
    .unwrap();

    assert_eq!(opened.load(Ordering::SeqCst), 3);
    assert_years(&path, &["2011", "2012"], &["2010"]);
}

#[test]
fn rerunning_a_batch_converges_to_complete() {
    let dir = tempfile::tempdir().unwrap();
    let path = file_db(dir.path());
    seed_three_years(&path);
    let attempts = AtomicUsize::new(0);

    // First pass: every worker's catalog is down. Second pass succeeds.
    for _ in 0..2 {
        run_batch(&path, &years(), ExecutionMode::Parallel, 2, || {
            let source = ScriptedSource::default();
            if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                return Ok(source
                    .failing_year("2010")
                    .failing_year("2011")
                    .failing_year("2012"));
            }
            Ok(source)
        })
        .unwrap();
    }

    assert_years(&path, &["2010", "2011", "2012"], &[]);
}

#[test]
fn select_partitions_narrows_to_requested_years() {
    let discovered = years();
    assert_eq!(select_partitions(discovered.clone(), &[]), discovered);
    assert_eq!(
        select_partitions(discovered, &["2011".to_string(), "1999".to_string()]),
        vec!["2011".to_string()]
    );
}
