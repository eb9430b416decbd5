mod aggregate;
mod albers;
mod catalog;
mod fetcher;
mod partition;
mod raster;
mod run;
#[cfg(test)]
mod tests;

pub use catalog::{DEFAULT_CATALOG_URL, DEFAULT_S3_REGION, FRACTIONAL_COVER_COLLECTION};
pub use run::run;
