use anyhow::{Context, Result};
use tracing::debug;

use super::catalog::{AssetReader, BoundingBox, Catalog, CatalogConfig, DateRange, StacClient};
use super::raster::{ALBERS_CRS, RasterDataset, RasterLoader};
use crate::model::{STAT_COLUMNS, WorkItem};

/// Half-width in degrees of the square query box around a grid cell.
pub const QUERY_HALF_WIDTH_DEG: f64 = 0.05;

#[derive(Debug)]
pub enum FetchOutcome {
    Loaded(RasterDataset),
    /// The catalog had nothing for this place and year. Not a failure.
    NoData,
}

/// Source of raster data for one work item. Errors are scoped to that item.
pub trait TileSource {
    fn fetch(&mut self, item: &WorkItem, year: &str) -> Result<FetchOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryWindow {
    pub bbox: BoundingBox,
    pub dates: DateRange,
}

impl QueryWindow {
    pub fn for_item(item: &WorkItem) -> Result<Self> {
        let year = item
            .year()
            .with_context(|| format!("month {:?} has no year", item.month))?;

        Ok(Self {
            bbox: BoundingBox::around(item.lat, item.lon, QUERY_HALF_WIDTH_DEG),
            dates: DateRange::calendar_year(year)?,
        })
    }
}

/// The real fetcher: a catalog search, then a raster load of whatever it found.
pub struct CatalogTileSource<C> {
    catalog: C,
    loader: RasterLoader,
}

impl CatalogTileSource<StacClient> {
    /// One-time remote setup for a worker.
    pub fn connect(config: &CatalogConfig) -> Result<Self> {
        Ok(Self::new(
            StacClient::connect(config)?,
            RasterLoader::new(config.window_cache_size, config.asset_cache_size),
        ))
    }
}

impl<C> CatalogTileSource<C> {
    pub fn new(catalog: C, loader: RasterLoader) -> Self {
        Self { catalog, loader }
    }
}

impl<C> TileSource for CatalogTileSource<C>
where
    C: Catalog + AssetReader,
{
    fn fetch(&mut self, item: &WorkItem, year: &str) -> Result<FetchOutcome> {
        let window = QueryWindow::for_item(item)?;
        let items = self
            .catalog
            .search(&window.bbox, &window.dates)
            .context("catalog search failed")?;

        if items.is_empty() {
            return Ok(FetchOutcome::NoData);
        }

        debug!(
            year = %year,
            grid_id = item.grid_id,
            catalog_items = items.len(),
            "loading raster"
        );

        let dataset = self
            .loader
            .load(
                &self.catalog,
                &items,
                &STAT_COLUMNS,
                ALBERS_CRS,
                &window.bbox,
                &window.dates,
            )
            .context("raster load failed")?;

        Ok(FetchOutcome::Loaded(dataset))
    }
}
