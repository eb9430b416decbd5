use std::collections::BTreeMap;
use std::io::Cursor;
use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use lru::LruCache;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tracing::debug;

use super::albers::AustralianAlbers;
use super::catalog::{AssetReader, BoundingBox, DateRange, StacItem};

pub const ALBERS_CRS: &str = "EPSG:3577";
/// Fill value of the fractional-cover percentile product when the catalog omits one.
pub const DEFAULT_NODATA: f64 = 255.0;

/// One band of one catalog item cropped to the query window. Masked pixels are NaN.
/// Percentile products are 8-bit, so `f32` holds every sample exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct BandGrid {
    pub width: usize,
    pub height: usize,
    pub samples: Vec<f32>,
}

impl BandGrid {
    pub fn valid_samples(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples
            .iter()
            .copied()
            .filter(|value| !value.is_nan())
            .map(f64::from)
    }
}

/// In-memory multi-band raster: every time slice of every band that fell inside
/// the query window.
#[derive(Debug, Clone, Default)]
pub struct RasterDataset {
    bands: BTreeMap<String, Vec<Arc<BandGrid>>>,
}

impl RasterDataset {
    pub fn push(&mut self, band: &str, grid: Arc<BandGrid>) {
        self.bands.entry(band.to_string()).or_default().push(grid);
    }

    pub fn band(&self, name: &str) -> Option<&[Arc<BandGrid>]> {
        self.bands.get(name).map(Vec::as_slice)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectedBounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl ProjectedBounds {
    /// Envelope of the box sampled on a 3x3 lattice, since parallels curve in Albers.
    pub fn from_geographic(bbox: &BoundingBox) -> Self {
        let albers = AustralianAlbers::new();
        let mut bounds = Self {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        };

        for step_lon in 0..3 {
            for step_lat in 0..3 {
                let lon = bbox.min_lon + (bbox.max_lon - bbox.min_lon) * f64::from(step_lon) / 2.0;
                let lat = bbox.min_lat + (bbox.max_lat - bbox.min_lat) * f64::from(step_lat) / 2.0;
                let (x, y) = albers.project(lon, lat);
                bounds.min_x = bounds.min_x.min(x);
                bounds.min_y = bounds.min_y.min(y);
                bounds.max_x = bounds.max_x.max(x);
                bounds.max_y = bounds.max_y.max(y);
            }
        }

        bounds
    }

    fn cache_key(&self) -> [u64; 4] {
        [
            self.min_x.to_bits(),
            self.min_y.to_bits(),
            self.max_x.to_bits(),
            self.max_y.to_bits(),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelWindow {
    pub col_off: usize,
    pub row_off: usize,
    pub width: usize,
    pub height: usize,
}

/// North-up affine transform from `proj:transform`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub pixel_width: f64,
    pub pixel_height: f64,
    pub origin_x: f64,
    pub origin_y: f64,
}

impl GeoTransform {
    pub fn from_proj(values: &[f64]) -> Result<Self> {
        let [a, b, c, d, e, f, ..] = values else {
            bail!("proj:transform needs at least six coefficients, got {}", values.len());
        };
        if *b != 0.0 || *d != 0.0 {
            bail!("rotated rasters are not supported");
        }
        if *a <= 0.0 || *e == 0.0 {
            bail!("degenerate pixel size in proj:transform");
        }

        Ok(Self {
            pixel_width: *a,
            pixel_height: *e,
            origin_x: *c,
            origin_y: *f,
        })
    }

    /// Pixels of a `width` x `height` raster covering `bounds`, or `None` when
    /// the raster does not intersect them.
    pub fn window(
        &self,
        bounds: &ProjectedBounds,
        width: usize,
        height: usize,
    ) -> Option<PixelWindow> {
        let col_start = ((bounds.min_x - self.origin_x) / self.pixel_width).floor();
        let col_end = ((bounds.max_x - self.origin_x) / self.pixel_width).ceil();
        let row_a = (bounds.max_y - self.origin_y) / self.pixel_height;
        let row_b = (bounds.min_y - self.origin_y) / self.pixel_height;
        let row_start = row_a.min(row_b).floor();
        let row_end = row_a.max(row_b).ceil();

        let col_start = col_start.max(0.0);
        let col_end = col_end.min(width as f64);
        let row_start = row_start.max(0.0);
        let row_end = row_end.min(height as f64);

        if !(col_end > col_start && row_end > row_start) {
            return None;
        }

        Some(PixelWindow {
            col_off: col_start as usize,
            row_off: row_start as usize,
            width: (col_end - col_start) as usize,
            height: (row_end - row_start) as usize,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    href: String,
    bounds: [u64; 4],
}

fn lru_capacity(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}

/// Loads catalog items into a `RasterDataset`. Two per-worker caches: cropped
/// windows, so the months of one grid cell decode once, and downloaded asset
/// bytes, so neighbouring cells on the same tile download once.
pub struct RasterLoader {
    windows: LruCache<WindowKey, Option<Arc<BandGrid>>>,
    assets: LruCache<String, Arc<Vec<u8>>>,
}

impl RasterLoader {
    pub fn new(window_cache_size: usize, asset_cache_size: usize) -> Self {
        Self {
            windows: LruCache::new(lru_capacity(window_cache_size)),
            assets: LruCache::new(lru_capacity(asset_cache_size)),
        }
    }

    pub fn load<R: AssetReader>(
        &mut self,
        reader: &R,
        items: &[StacItem],
        bands: &[&str],
        crs: &str,
        bbox: &BoundingBox,
        dates: &DateRange,
    ) -> Result<RasterDataset> {
        if crs != ALBERS_CRS {
            bail!("unsupported target crs {crs}; only {ALBERS_CRS} is available");
        }

        let bounds = ProjectedBounds::from_geographic(bbox);
        let mut dataset = RasterDataset::default();

        for item in items {
            if let Some((start, end)) = item.temporal_span() {
                if !dates.contains_span(start, end) {
                    debug!(item = %item.id, "catalog item outside requested time range");
                    continue;
                }
            }

            for band in bands {
                if let Some(grid) = self.load_band(reader, item, band, &bounds)? {
                    dataset.push(band, grid);
                }
            }
        }

        for band in bands {
            if dataset.band(band).is_none() {
                bail!("empty raster: no {band} pixels inside the query window");
            }
        }

        Ok(dataset)
    }

    fn load_band<R: AssetReader>(
        &mut self,
        reader: &R,
        item: &StacItem,
        band: &str,
        bounds: &ProjectedBounds,
    ) -> Result<Option<Arc<BandGrid>>> {
        let asset = item
            .assets
            .get(band)
            .with_context(|| format!("item {} has no {band} asset", item.id))?;

        match item.asset_crs(asset) {
            Some(crs) if crs == ALBERS_CRS => {}
            Some(crs) => bail!("item {} band {band} is published in {crs}", item.id),
            None => bail!("item {} band {band} has no projection metadata", item.id),
        }

        let key = WindowKey {
            href: asset.href.clone(),
            bounds: bounds.cache_key(),
        };
        if let Some(cached) = self.windows.get(&key) {
            return Ok(cached.clone());
        }

        let transform = item
            .asset_transform(asset)
            .with_context(|| format!("item {} band {band} has no proj:transform", item.id))?;
        let transform = GeoTransform::from_proj(transform)?;

        if let Some((height, width)) = item.asset_shape(asset) {
            if transform.window(bounds, width, height).is_none() {
                self.windows.put(key, None);
                return Ok(None);
            }
        }

        let bytes = self.asset_bytes(reader, &asset.href)?;
        let nodata = asset.nodata().unwrap_or(DEFAULT_NODATA);
        let grid = decode_window(&bytes, &transform, bounds, Some(nodata))
            .with_context(|| format!("failed to decode {}", asset.href))?
            .map(Arc::new);
        if let Some(grid) = &grid {
            debug!(
                item = %item.id,
                band,
                width = grid.width,
                height = grid.height,
                valid = grid.valid_samples().count(),
                "decoded window"
            );
        }

        self.windows.put(key, grid.clone());
        Ok(grid)
    }

    fn asset_bytes<R: AssetReader>(&mut self, reader: &R, href: &str) -> Result<Arc<Vec<u8>>> {
        if let Some(bytes) = self.assets.get(href) {
            return Ok(bytes.clone());
        }

        let bytes = Arc::new(reader.read(href)?);
        self.assets.put(href.to_string(), bytes.clone());
        Ok(bytes)
    }
}

/// Decodes only the strips or tiles of a single-band GeoTIFF that intersect
/// `bounds`, masking `nodata` and non-finite samples.
pub fn decode_window(
    bytes: &[u8],
    transform: &GeoTransform,
    bounds: &ProjectedBounds,
    nodata: Option<f64>,
) -> Result<Option<BandGrid>> {
    let mut decoder = Decoder::new(Cursor::new(bytes))
        .context("failed to open GeoTIFF")?
        .with_limits(Limits::unlimited());
    let (width, height) = decoder
        .dimensions()
        .context("failed to read raster dimensions")?;
    let (width, height) = (width as usize, height as usize);

    let Some(window) = transform.window(bounds, width, height) else {
        return Ok(None);
    };

    let (chunk_width, chunk_height) = decoder.chunk_dimensions();
    let (chunk_width, chunk_height) = (chunk_width as usize, chunk_height as usize);
    if chunk_width == 0 || chunk_height == 0 {
        bail!("raster declares zero-sized chunks");
    }
    let chunks_across = width.div_ceil(chunk_width);

    let mut samples = vec![f32::NAN; window.width * window.height];
    let last_row = (window.row_off + window.height - 1) / chunk_height;
    let last_col = (window.col_off + window.width - 1) / chunk_width;
    let chunk_rows = window.row_off / chunk_height..=last_row;
    let chunk_cols = window.col_off / chunk_width..=last_col;

    for chunk_row in chunk_rows {
        for chunk_col in chunk_cols.clone() {
            let index = u32::try_from(chunk_row * chunks_across + chunk_col)
                .context("raster chunk index out of range")?;
            let (data_width, data_height) = decoder.chunk_data_dimensions(index);
            let placement = PixelWindow {
                col_off: chunk_col * chunk_width,
                row_off: chunk_row * chunk_height,
                width: data_width as usize,
                height: data_height as usize,
            };

            let chunk = decoder
                .read_chunk(index)
                .with_context(|| format!("failed to decode raster chunk {index}"))?;
            match chunk {
                DecodingResult::U8(data) => {
                    copy_chunk(&data, &placement, &window, nodata, &mut samples)?
                }
                DecodingResult::U16(data) => {
                    copy_chunk(&data, &placement, &window, nodata, &mut samples)?
                }
                DecodingResult::U32(data) => {
                    copy_chunk(&data, &placement, &window, nodata, &mut samples)?
                }
                DecodingResult::I8(data) => {
                    copy_chunk(&data, &placement, &window, nodata, &mut samples)?
                }
                DecodingResult::I16(data) => {
                    copy_chunk(&data, &placement, &window, nodata, &mut samples)?
                }
                DecodingResult::I32(data) => {
                    copy_chunk(&data, &placement, &window, nodata, &mut samples)?
                }
                DecodingResult::F32(data) => {
                    copy_chunk(&data, &placement, &window, nodata, &mut samples)?
                }
                DecodingResult::F64(data) => {
                    copy_chunk(&data, &placement, &window, nodata, &mut samples)?
                }
                _ => bail!("unsupported raster sample format"),
            }
        }
    }

    Ok(Some(BandGrid {
        width: window.width,
        height: window.height,
        samples,
    }))
}

/// Copies the part of one decoded chunk at `placement` that falls inside `window`.
fn copy_chunk<T>(
    data: &[T],
    placement: &PixelWindow,
    window: &PixelWindow,
    nodata: Option<f64>,
    samples: &mut [f32],
) -> Result<()>
where
    T: Copy + Into<f64>,
{
    if data.len() != placement.width * placement.height {
        bail!(
            "expected a single-band {}x{} chunk, got {} samples",
            placement.width,
            placement.height,
            data.len()
        );
    }

    let rows = window.row_off.max(placement.row_off)
        ..(window.row_off + window.height).min(placement.row_off + placement.height);
    let cols = window.col_off.max(placement.col_off)
        ..(window.col_off + window.width).min(placement.col_off + placement.width);

    for row in rows {
        let source = (row - placement.row_off) * placement.width;
        let target = (row - window.row_off) * window.width;
        for col in cols.clone() {
            let value: f64 = data[source + col - placement.col_off].into();
            let masked = !value.is_finite() || nodata.is_some_and(|fill| value == fill);
            samples[target + col - window.col_off] = if masked { f32::NAN } else { value as f32 };
        }
    }

    Ok(())
}
