/// Text value stored in a statistic column until the record has been enriched.
pub const UNRESOLVED_MARKER: &str = "NAN";

/// Statistic columns in storage order: {bs, pv, npv} x {p10, p50, p90}.
pub const STAT_COLUMNS: [&str; 9] = [
    "bs_pc_10",
    "bs_pc_50",
    "bs_pc_90",
    "pv_pc_10",
    "pv_pc_50",
    "pv_pc_90",
    "npv_pc_10",
    "npv_pc_50",
    "npv_pc_90",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatField {
    Unresolved,
    Missing,
    Value(f64),
}

impl StatField {
    pub fn is_unresolved(self) -> bool {
        matches!(self, Self::Unresolved)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroundRecord {
    pub grid_id: i64,
    pub month: String,
    pub lat: f64,
    pub lon: f64,
    pub stats: [StatField; 9],
}

impl GroundRecord {
    /// A record is complete once none of its statistic fields carry the marker.
    pub fn is_complete(&self) -> bool {
        !self.stats.iter().any(|field| field.is_unresolved())
    }
}

/// One incomplete record projected to what the fetch step needs.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub month: String,
    pub lat: f64,
    pub lon: f64,
    pub grid_id: i64,
}

impl WorkItem {
    pub fn year(&self) -> Option<&str> {
        self.month.get(..4)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Percentiles {
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoverPercentiles {
    pub bare_soil: Percentiles,
    pub photosynthetic: Percentiles,
    pub non_photosynthetic: Percentiles,
}

impl CoverPercentiles {
    pub fn from_columns(values: [f64; 9]) -> Self {
        let [bs10, bs50, bs90, pv10, pv50, pv90, npv10, npv50, npv90] = values;
        Self {
            bare_soil: Percentiles {
                p10: bs10,
                p50: bs50,
                p90: bs90,
            },
            photosynthetic: Percentiles {
                p10: pv10,
                p50: pv50,
                p90: pv90,
            },
            non_photosynthetic: Percentiles {
                p10: npv10,
                p50: npv50,
                p90: npv90,
            },
        }
    }

    /// Values in `STAT_COLUMNS` order.
    pub fn to_columns(&self) -> [f64; 9] {
        [
            self.bare_soil.p10,
            self.bare_soil.p50,
            self.bare_soil.p90,
            self.photosynthetic.p10,
            self.photosynthetic.p50,
            self.photosynthetic.p90,
            self.non_photosynthetic.p10,
            self.non_photosynthetic.p50,
            self.non_photosynthetic.p90,
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatisticsResult {
    pub month: String,
    pub grid_id: i64,
    pub cover: CoverPercentiles,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionTally {
    pub attempted: usize,
    pub updated: usize,
    pub no_data: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionProgress {
    pub year: String,
    pub total: i64,
    pub incomplete: i64,
}
