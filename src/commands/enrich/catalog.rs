use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

pub const DEFAULT_CATALOG_URL: &str = "https://explorer.dea.ga.gov.au/stac";
pub const FRACTIONAL_COVER_COLLECTION: &str = "ga_ls_fc_pc_cyear_3";
pub const DEFAULT_S3_REGION: &str = "ap-southeast-2";

const SEARCH_PAGE_LIMIT: u32 = 100;
const MAX_SEARCH_PAGES: usize = 50;
const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Per-worker remote access settings. Cloned into every worker and turned into
/// a client exactly once there.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub catalog_url: String,
    pub collection: String,
    pub timeout: Option<Duration>,
    pub s3_region: String,
    pub window_cache_size: usize,
    pub asset_cache_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn around(lat: f64, lon: f64, half_width: f64) -> Self {
        Self {
            min_lon: lon - half_width,
            min_lat: lat - half_width,
            max_lon: lon + half_width,
            max_lat: lat + half_width,
        }
    }

    fn as_query(&self) -> String {
        format!(
            "{},{},{},{}",
            self.min_lon, self.min_lat, self.max_lon, self.max_lat
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn calendar_year(year: &str) -> Result<Self> {
        if year.len() != 4 {
            bail!("partition year must have four digits: {year:?}");
        }
        let parsed = year
            .parse::<i32>()
            .with_context(|| format!("invalid partition year: {year:?}"))?;

        let start = NaiveDate::from_ymd_opt(parsed, 1, 1)
            .with_context(|| format!("year out of range: {year}"))?;
        let end = NaiveDate::from_ymd_opt(parsed, 12, 31)
            .with_context(|| format!("year out of range: {year}"))?;

        Ok(Self { start, end })
    }

    pub fn contains_span(&self, start: NaiveDate, end: NaiveDate) -> bool {
        start <= self.end && end >= self.start
    }

    fn as_interval(&self) -> String {
        format!(
            "{}/{}",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    features: Vec<StacItem>,
    #[serde(default)]
    links: Vec<Link>,
}

#[derive(Debug, Clone, Deserialize)]
struct Link {
    rel: String,
    href: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    body: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StacItem {
    pub id: String,
    #[serde(default)]
    pub properties: ItemProperties,
    #[serde(default)]
    pub assets: HashMap<String, Asset>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemProperties {
    #[serde(default)]
    pub datetime: Option<String>,
    #[serde(default)]
    pub start_datetime: Option<String>,
    #[serde(default)]
    pub end_datetime: Option<String>,
    #[serde(rename = "proj:epsg", default)]
    pub epsg: Option<u32>,
    #[serde(rename = "proj:code", default)]
    pub code: Option<String>,
    #[serde(rename = "proj:shape", default)]
    pub shape: Option<Vec<usize>>,
    #[serde(rename = "proj:transform", default)]
    pub transform: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Asset {
    pub href: String,
    #[serde(rename = "proj:epsg", default)]
    pub epsg: Option<u32>,
    #[serde(rename = "proj:code", default)]
    pub code: Option<String>,
    #[serde(rename = "proj:shape", default)]
    pub shape: Option<Vec<usize>>,
    #[serde(rename = "proj:transform", default)]
    pub transform: Option<Vec<f64>>,
    #[serde(default)]
    pub nodata: Option<Value>,
    #[serde(rename = "raster:bands", default)]
    pub raster_bands: Vec<RasterBandInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RasterBandInfo {
    #[serde(default)]
    pub nodata: Option<Value>,
}

fn crs_name(epsg: Option<u32>, code: Option<&str>) -> Option<String> {
    epsg.map(|value| format!("EPSG:{value}"))
        .or_else(|| code.map(ToOwned::to_owned))
}

fn nodata_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.parse::<f64>().ok(),
        _ => None,
    }
}

impl StacItem {
    /// Asset-level projection metadata wins over item-level.
    pub fn asset_crs(&self, asset: &Asset) -> Option<String> {
        crs_name(asset.epsg, asset.code.as_deref())
            .or_else(|| crs_name(self.properties.epsg, self.properties.code.as_deref()))
    }

    pub fn asset_transform<'a>(&'a self, asset: &'a Asset) -> Option<&'a [f64]> {
        asset
            .transform
            .as_deref()
            .or(self.properties.transform.as_deref())
    }

    /// `(height, width)` as published in `proj:shape`.
    pub fn asset_shape(&self, asset: &Asset) -> Option<(usize, usize)> {
        let shape = asset
            .shape
            .as_deref()
            .or(self.properties.shape.as_deref())?;
        match shape {
            [height, width] => Some((*height, *width)),
            _ => None,
        }
    }

    pub fn temporal_span(&self) -> Option<(NaiveDate, NaiveDate)> {
        let properties = &self.properties;
        let start = properties
            .start_datetime
            .as_deref()
            .or(properties.datetime.as_deref())
            .and_then(parse_stac_date)?;
        let end = properties
            .end_datetime
            .as_deref()
            .or(properties.datetime.as_deref())
            .and_then(parse_stac_date)?;
        Some((start, end))
    }
}

impl Asset {
    pub fn nodata(&self) -> Option<f64> {
        self.nodata.as_ref().and_then(nodata_number).or_else(|| {
            self.raster_bands
                .first()
                .and_then(|band| band.nodata.as_ref())
                .and_then(nodata_number)
        })
    }
}

fn parse_stac_date(value: &str) -> Option<NaiveDate> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.date_naive())
        .ok()
        .or_else(|| value.get(..10).and_then(|day| NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()))
}

/// Anything that can hand back the bytes behind an asset href.
pub trait AssetReader {
    fn read(&self, href: &str) -> Result<Vec<u8>>;
}

/// Item search over one collection.
pub trait Catalog {
    /// Every item intersecting `bbox` during `dates`. An empty result is not an error.
    fn search(&self, bbox: &BoundingBox, dates: &DateRange) -> Result<Vec<StacItem>>;
}

pub struct StacClient {
    http: Client,
    search_url: String,
    collection: String,
    s3_region: String,
}

impl StacClient {
    pub fn connect(config: &CatalogConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build catalog HTTP client")?;

        Ok(Self {
            http,
            search_url: format!("{}/search", config.catalog_url.trim_end_matches('/')),
            collection: config.collection.clone(),
            s3_region: config.s3_region.clone(),
        })
    }

    fn first_page(&self, bbox: &BoundingBox, dates: &DateRange) -> Result<SearchPage> {
        let bbox_query = bbox.as_query();
        let interval = dates.as_interval();
        let limit = SEARCH_PAGE_LIMIT.to_string();

        let response = self
            .http
            .get(&self.search_url)
            .query(&[
                ("collections", self.collection.as_str()),
                ("bbox", bbox_query.as_str()),
                ("datetime", interval.as_str()),
                ("limit", limit.as_str()),
            ])
            .send()
            .with_context(|| format!("catalog search request failed: {}", self.search_url))?;

        read_page(response)
    }

    fn follow(&self, link: &Link) -> Result<SearchPage> {
        let is_post = link
            .method
            .as_deref()
            .is_some_and(|method| method.eq_ignore_ascii_case("POST"));

        let request = if is_post {
            let body = link.body.clone().unwrap_or(Value::Null);
            self.http.post(&link.href).json(&body)
        } else {
            self.http.get(&link.href)
        };

        let response = request
            .send()
            .with_context(|| format!("catalog page request failed: {}", link.href))?;
        read_page(response)
    }
}

impl Catalog for StacClient {
    fn search(&self, bbox: &BoundingBox, dates: &DateRange) -> Result<Vec<StacItem>> {
        let first = self.first_page(bbox, dates)?;
        collect_pages(first, |link| self.follow(link))
    }
}

impl AssetReader for StacClient {
    fn read(&self, href: &str) -> Result<Vec<u8>> {
        let url = resolve_href(href, &self.s3_region)?;
        let response = self
            .http
            .get(&url)
            .send()
            .with_context(|| format!("asset request failed: {url}"))?
            .error_for_status()
            .with_context(|| format!("asset request rejected: {url}"))?;
        let bytes = response
            .bytes()
            .with_context(|| format!("failed to read asset body: {url}"))?;
        Ok(bytes.to_vec())
    }
}

fn read_page(response: Response) -> Result<SearchPage> {
    let response = response
        .error_for_status()
        .context("catalog returned an error status")?;
    response
        .json::<SearchPage>()
        .context("malformed catalog search response")
}

fn next_link(links: &[Link]) -> Option<Link> {
    links.iter().find(|link| link.rel == "next").cloned()
}

/// Drains `rel=next` links starting from `first`, at most `MAX_SEARCH_PAGES` pages.
fn collect_pages<F>(first: SearchPage, mut follow: F) -> Result<Vec<StacItem>>
where
    F: FnMut(&Link) -> Result<SearchPage>,
{
    let mut page = first;
    let mut items = Vec::new();
    let mut pages = 1usize;

    loop {
        items.extend(page.features);
        let Some(next) = next_link(&page.links) else {
            break;
        };
        if pages >= MAX_SEARCH_PAGES {
            bail!("catalog search exceeded {MAX_SEARCH_PAGES} pages");
        }
        debug!(href = %next.href, page = pages + 1, "following catalog next link");
        page = follow(&next)?;
        pages += 1;
    }

    Ok(items)
}

/// Rewrites `s3://bucket/key` to the bucket's anonymous HTTPS endpoint.
pub fn resolve_href(href: &str, s3_region: &str) -> Result<String> {
    if let Some(rest) = href.strip_prefix("s3://") {
        let Some((bucket, key)) = rest.split_once('/') else {
            bail!("s3 href has no object key: {href}");
        };
        return Ok(format!("https://{bucket}.s3.{s3_region}.amazonaws.com/{key}"));
    }

    if href.starts_with("https://") || href.starts_with("http://") {
        return Ok(href.to_string());
    }

    bail!("unsupported asset href: {href}")
}
