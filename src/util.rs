use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, SecondsFormat, Utc};

pub fn now_utc_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn ensure_parent_directory(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }
    }
    Ok(())
}

/// Normalizes `YYYY-MM` or any longer ISO date (`YYYY-MM-DD...`) to `YYYY-MM`.
pub fn normalize_month(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let Some(prefix) = trimmed.get(..7) else {
        bail!("month value too short: {raw:?}");
    };

    let date = NaiveDate::parse_from_str(&format!("{prefix}-01"), "%Y-%m-%d")
        .with_context(|| format!("invalid month value: {raw:?}"))?;

    Ok(date.format("%Y-%m").to_string())
}
