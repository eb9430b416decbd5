use anyhow::{Context, Result, bail};

use super::raster::RasterDataset;
use crate::model::{CoverPercentiles, STAT_COLUMNS, StatisticsResult, WorkItem};

/// Mean over every unmasked pixel of every time slice of `band`.
pub fn band_mean(dataset: &RasterDataset, band: &str) -> Result<f64> {
    let grids = dataset
        .band(band)
        .with_context(|| format!("band {band} missing from loaded raster"))?;

    let (sum, count) = grids
        .iter()
        .flat_map(|grid| grid.valid_samples())
        .fold((0.0_f64, 0_usize), |(sum, count), value| {
            (sum + value, count + 1)
        });

    if count == 0 {
        bail!("band {band} has no valid pixels");
    }

    let mean = sum / count as f64;
    if !mean.is_finite() {
        bail!("band {band} mean is not finite");
    }

    Ok(mean)
}

pub fn summarize(item: &WorkItem, dataset: &RasterDataset) -> Result<StatisticsResult> {
    let mut values = [0.0_f64; 9];
    for (value, band) in values.iter_mut().zip(STAT_COLUMNS) {
        *value = band_mean(dataset, band)?;
    }

    Ok(StatisticsResult {
        month: item.month.clone(),
        grid_id: item.grid_id,
        cover: CoverPercentiles::from_columns(values),
    })
}
