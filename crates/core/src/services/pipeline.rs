//! End-to-end hardening of a program.
//!
//! `harden` chains the build-time stages over one program value: registry
//! population, the optional all-identifier handler, identifier assignment,
//! reference replacement, per-site dispatch generation, handler
//! registration and the residual check.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::analysis::{assign_ids, module_id, DensityReport, FactSet, RegistryError, TargetRegistry};
use crate::codegen::handler::{add_all_id_handler, add_register_ctor, mark_tail_calls};
use crate::codegen::{
    check_residuals, id_listing, stats_csv, stats_rows, CodegenError, CodegenReport, Generator, Residual,
    StatsRow, VerifyError,
};
use crate::config::CfiConfig;
use crate::document::DocumentError;
use crate::model::{ModelError, Program};

/// File name of the per-site statistics written next to the output.
pub const STATS_FILE: &str = "noic-output.txt";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Codegen(#[from] CodegenError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("Malformed program: {0}")]
    Model(#[from] ModelError),

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Everything a hardening run produced besides the rewritten program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardenReport {
    pub program: String,
    pub functions: usize,
    /// First identifier of the shared space.
    pub first_id: u64,
    /// Next unused identifier of the shared space.
    pub next_id: u64,
    pub ids: String,
    pub stats: Vec<StatsRow>,
    pub density: DensityReport,
    pub codegen: CodegenReport,
    pub residuals: Vec<Residual>,
    /// Identifier range registered with the runtime, if any.
    pub registered: Option<(u64, u64)>,
}

impl HardenReport {
    pub fn warnings(&self) -> &[String] {
        &self.codegen.warnings
    }
}

/// Rewrite `program` in place.
pub fn harden(program: &mut Program, facts: &FactSet, config: &CfiConfig) -> Result<HardenReport, PipelineError> {
    program.validate()?;
    let mut registry = TargetRegistry::populate(program, facts, config)?;

    let mut first_id = config.min_id;
    if config.shared_object && config.dynamic_linking && config.external_resolver {
        first_id = module_id(&config.output_name, config.id_bitwidth).max(config.min_id);
        registry.set_next_id(first_id);
        info!(module_id = format!("{first_id:#x}"), output = %config.output_name, "shared object identifier base");
    }

    let handler = config.wants_all_id_handler().then(|| add_all_id_handler(program, &mut registry));

    let density = assign_ids(&mut registry, config, program.pointer_bits);

    let codegen = {
        let mut generator = Generator::new(program, &mut registry, config);
        generator.replace_functions_with_ids();
        generator.generate_all()?;
        generator.finish()
    };

    let next_id = registry.next_id();
    let mut registered = None;
    if let Some(handler) = handler {
        // Internal clusters restart at the floor, so the range ends at the
        // highest identifier of any space.
        let last = registry.functions().filter(|f| !f.removed).filter_map(|f| f.id).max();
        if let Some(last) = last.filter(|last| *last >= first_id) {
            add_register_ctor(program, handler, first_id, last);
            registered = Some((first_id, last));
        }
        mark_tail_calls(program, handler);
    }

    let residuals = check_residuals(program, config)?;

    let report = HardenReport {
        program: program.name.clone(),
        functions: registry.functions().filter(|f| !f.removed).count(),
        first_id,
        next_id,
        ids: id_listing(&registry),
        stats: stats_rows(&registry),
        density,
        codegen,
        residuals,
        registered,
    };
    info!(
        program = %report.program,
        functions = report.functions,
        sites = report.stats.len(),
        direct = report.codegen.direct,
        switched = report.codegen.switched,
        shared = report.codegen.shared,
        warnings = report.codegen.warnings.len(),
        "hardened program"
    );
    Ok(report)
}

/// Write `<output>-ids.txt` and, when enabled, the statistics file into `dir`.
pub fn write_side_files(report: &HardenReport, config: &CfiConfig, dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let mut written = Vec::new();

    let ids_path = dir.join(format!("{}-ids.txt", config.output_name));
    write_file(&ids_path, &report.ids)?;
    written.push(ids_path);

    if config.export_stats {
        let stats_path = dir.join(STATS_FILE);
        write_file(&stats_path, &stats_csv(&report.stats))?;
        written.push(stats_path);
    }
    Ok(written)
}

fn write_file(path: &Path, contents: &str) -> Result<(), PipelineError> {
    std::fs::write(path, contents).map_err(|source| PipelineError::Io { path: path.to_path_buf(), source })
}
