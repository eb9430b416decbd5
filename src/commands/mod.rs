pub mod enrich;
pub mod ingest;
pub mod status;
