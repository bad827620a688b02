use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;

use switchboard_core::config::CfiConfig;
use switchboard_core::db::{RunRecord, StatsDb};
use switchboard_core::document::write_document;
use switchboard_core::services::{harden, write_side_files, HardenReport};

use crate::commands::{load_config, load_facts, load_program};
use crate::{canonicalize_or_current, infer_output_name, sha256_file};

/// Inputs of `switchboard harden`.
#[derive(Debug, Clone, Default)]
pub struct HardenOptions {
    pub program: PathBuf,
    pub facts: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub env: bool,
    pub output: Option<PathBuf>,
    pub side_dir: Option<PathBuf>,
    pub stats_db: Option<PathBuf>,
    pub json: bool,
}

/// Harden a serialized program and write the rewritten program plus side files.
pub fn harden_command(options: &HardenOptions) -> Result<()> {
    let mut program = load_program(&options.program)?;
    let facts = load_facts(options.facts.as_deref(), &program)?;
    let mut config = load_config(options.config.as_deref(), options.env)?;
    if let Some(output) = &options.output {
        if config.output_name == CfiConfig::default().output_name {
            config.output_name = infer_output_name(output);
        }
    }
    let input_hash = sha256_file(&options.program)?;

    let started = Utc::now();
    let report = harden(&mut program, &facts, &config)
        .with_context(|| format!("Failed to harden {}", options.program.display()))?;

    if let Some(output) = &options.output {
        write_document(output, &program)
            .with_context(|| format!("Failed to write hardened program to {}", output.display()))?;
    }

    let side_files = match &options.side_dir {
        Some(dir) => {
            let dir = canonicalize_or_current(&dir.to_string_lossy())?;
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create side-file directory {}", dir.display()))?;
            write_side_files(&report, &config, &dir)
                .with_context(|| format!("Failed to write side files into {}", dir.display()))?
        }
        None => Vec::new(),
    };

    let run_id = match &options.stats_db {
        Some(path) => {
            let mut db = StatsDb::open(path)
                .with_context(|| format!("Failed to open statistics database {}", path.display()))?;
            let record = RunRecord::from_report(&report, &config, started);
            Some(db.record_run(&record, &report.stats).context("Failed to record run")?)
        }
        None => None,
    };

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    print_summary(&report, &input_hash);
    if let Some(output) = &options.output {
        println!("Wrote {}", output.display());
    }
    for path in &side_files {
        println!("Wrote {}", path.display());
    }
    if let Some(run_id) = run_id {
        println!("Recorded run {run_id}");
    }
    Ok(())
}

fn print_summary(report: &HardenReport, input_hash: &str) {
    println!("Program: {} (sha256 {})", report.program, &input_hash[..input_hash.len().min(12)]);
    println!("- functions with identifiers: {}", report.functions);
    println!("- identifiers: {}..{}", report.first_id, report.next_id);
    println!("- call sites: {}", report.stats.len());
    println!(
        "- dispatch: {} direct, {} switched, {} shared, {} runtime",
        report.codegen.direct, report.codegen.switched, report.codegen.shared, report.codegen.runtime
    );
    if !report.codegen.dispatchers.is_empty() {
        println!("- shared dispatchers: {}", report.codegen.dispatchers.join(", "));
    }
    println!(
        "- candidates per site: avg {:.2}, worst {:.2}, worst large {:.2}",
        report.density.average, report.density.worst, report.density.worst_large
    );
    if let Some((min, max)) = report.registered {
        println!("- registered identifier range: {min}..={max}");
    }
    let critical = report.residuals.iter().filter(|r| !r.carve_out).count();
    if critical > 0 {
        println!("- residual indirect calls: {critical}");
    }
    for warning in report.warnings() {
        eprintln!("warning: {warning}");
    }
}
