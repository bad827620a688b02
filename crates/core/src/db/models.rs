use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codegen::StatsRow;
use crate::config::CfiConfig;
use crate::services::HardenReport;

/// Summary of one hardening run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub program: String,
    /// Fingerprint of the configuration used.
    pub config_hash: String,
    /// RFC 3339.
    pub started_at: String,
    pub finished_at: String,
    pub functions: u64,
    pub sites: u64,
    pub max_id: u64,
}

impl RunRecord {
    pub fn from_report(report: &HardenReport, config: &CfiConfig, started_at: DateTime<Utc>) -> Self {
        Self {
            program: report.program.clone(),
            config_hash: config.fingerprint(),
            started_at: started_at.to_rfc3339(),
            finished_at: Utc::now().to_rfc3339(),
            functions: report.functions as u64,
            sites: report.stats.len() as u64,
            max_id: report.density.max_id,
        }
    }
}

/// A run as stored, with its row id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRun {
    pub id: i64,
    #[serde(flatten)]
    pub run: RunRecord,
}

/// Per-site row. `kind` holds the statistics label
/// (`call`, `resolve`, `resolvefunc`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteStatRecord {
    pub run_id: i64,
    pub kind: String,
    pub name: String,
    pub targets: u64,
    pub hash: String,
}

impl SiteStatRecord {
    pub fn from_row(run_id: i64, row: &StatsRow) -> Self {
        Self {
            run_id,
            kind: row.kind.stats_label().to_string(),
            name: row.name.clone(),
            targets: row.targets as u64,
            hash: row.hash.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRepetition {
    pub hash: String,
    /// Sites carrying the hash, over all runs.
    pub sites: u64,
    /// Distinct runs the hash appeared in.
    pub runs: u64,
}
