use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use switchboard_core::db::{HashRepetition, StatsDb, StoredRun};

#[derive(Debug, Serialize)]
pub struct StatsSummary {
    pub runs: Vec<StoredRun>,
    pub repetitions: Vec<HashRepetition>,
}

/// Show recorded runs and the site hashes that repeat at least `min_sites` times.
pub fn stats_command(db_path: &Path, program: Option<&str>, min_sites: u64, json: bool) -> Result<()> {
    if !db_path.is_file() {
        bail!("Statistics database not found at {}", db_path.display());
    }
    let db = StatsDb::open(db_path)
        .with_context(|| format!("Failed to open statistics database {}", db_path.display()))?;
    let summary = StatsSummary {
        runs: db.list_runs(program).context("Failed to list runs")?,
        repetitions: db.hash_repetitions(min_sites).context("Failed to count hash repetitions")?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    if summary.runs.is_empty() {
        println!("No runs recorded.");
    } else {
        println!("Runs:");
        for stored in &summary.runs {
            let run = &stored.run;
            println!(
                "- #{} {} at {}: {} functions, {} sites, max id {} (config {})",
                stored.id, run.program, run.started_at, run.functions, run.sites, run.max_id, run.config_hash
            );
        }
    }
    if !summary.repetitions.is_empty() {
        println!("Repeated site hashes (>= {min_sites} sites):");
        for rep in &summary.repetitions {
            println!("- {}: {} sites in {} run(s)", rep.hash, rep.sites, rep.runs);
        }
    }
    Ok(())
}
