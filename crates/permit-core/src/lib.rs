//! Canonical permit model shared by every ingestion source.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "permit-core";

/// Destination table for canonical permit rows.
pub const PERMITS_TABLE: &str = "permits";

/// Conflict target for every permit upsert. Matches [`NaturalKey`].
pub const PERMIT_CONFLICT_KEY: &str = "source_system,permit_id";

/// Table holding one [`EtlState`] row per source.
pub const ETL_STATE_TABLE: &str = "etl_state";

/// Conflict target for `etl_state` upserts.
pub const ETL_STATE_CONFLICT_KEY: &str = "source";

/// Untyped source payload, one object per upstream row.
pub type RawRecord = Map<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Trade {
    Electrical,
    Plumbing,
    #[serde(rename = "HVAC")]
    Hvac,
    Roofing,
    Pool,
    General,
}

impl Trade {
    pub fn as_str(self) -> &'static str {
        match self {
            Trade::Electrical => "Electrical",
            Trade::Plumbing => "Plumbing",
            Trade::Hvac => "HVAC",
            Trade::Roofing => "Roofing",
            Trade::Pool => "Pool",
            Trade::General => "General",
        }
    }
}

impl fmt::Display for Trade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Natural key of a permit row; unique per destination table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
    pub source_system: String,
    pub permit_id: String,
}

/// Key used for in-run duplicate suppression: natural key plus issue day.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub source_system: String,
    pub permit_id: String,
    pub issue_day: NaiveDate,
}

/// Canonical permit record, the unit persisted into [`PERMITS_TABLE`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermitRecord {
    pub source_system: String,
    pub permit_id: String,
    pub issue_date: DateTime<Utc>,
    pub trade: Trade,
    pub description: Option<String>,
    pub address: Option<String>,
    pub zipcode: Option<String>,
    pub valuation: Option<f64>,
    pub contractor: Option<String>,
    pub applicant: Option<String>,
    pub raw: JsonValue,
}

impl PermitRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            source_system: self.source_system.clone(),
            permit_id: self.permit_id.clone(),
        }
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            source_system: self.source_system.clone(),
            permit_id: self.permit_id.clone(),
            issue_day: self.issue_date.date_naive(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    /// Nothing new upstream and the run was allowed to be empty.
    Empty,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Empty => "empty",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_ok(self) -> bool {
        !matches!(self, RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row of [`ETL_STATE_TABLE`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtlState {
    pub source: String,
    pub last_run: DateTime<Utc>,
    pub last_success: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub records_processed: u64,
    pub error_message: Option<String>,
}
