use std::path::Path;

use anyhow::{Context, Result};

use switchboard_core::analysis::{collect_facts, FactSet};
use switchboard_core::config::CfiConfig;
use switchboard_core::document::read_document;
use switchboard_core::model::{Arch, Program};

/// Read a serialized program (JSON or YAML by extension) and check its handles.
pub fn load_program(path: &Path) -> Result<Program> {
    let program: Program =
        read_document(path).with_context(|| format!("Failed to load program from {}", path.display()))?;
    program.validate().with_context(|| format!("Malformed program in {}", path.display()))?;
    Ok(program)
}

/// Read facts from `path`, or collect them from the program itself.
pub fn load_facts(path: Option<&Path>, program: &Program) -> Result<FactSet> {
    match path {
        Some(path) => read_document(path).with_context(|| format!("Failed to load facts from {}", path.display())),
        None => Ok(collect_facts(program)),
    }
}

/// Defaults, then the config file, then `TG_*` variables from the process
/// environment when `use_env` is set.
pub fn load_config(path: Option<&Path>, use_env: bool) -> Result<CfiConfig> {
    let config = match path {
        Some(path) => {
            CfiConfig::load(path).with_context(|| format!("Failed to load config from {}", path.display()))?
        }
        None => CfiConfig::default(),
    };
    if use_env {
        return config.apply_env(std::env::vars()).context("Invalid TG_* environment override");
    }
    Ok(config)
}

/// Architecture names accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ArchArg {
    Aarch64,
    #[value(name = "x86_64", alias = "x86-64")]
    X86_64,
}

impl From<ArchArg> for Arch {
    fn from(arch: ArchArg) -> Self {
        match arch {
            ArchArg::Aarch64 => Arch::Aarch64,
            ArchArg::X86_64 => Arch::X86_64,
        }
    }
}
