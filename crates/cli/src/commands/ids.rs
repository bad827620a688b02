use std::path::Path;

use anyhow::{Context, Result};

use switchboard_core::services::harden;

use crate::commands::{load_config, load_facts, load_program};

/// Print the identifier listing a hardening run would produce, without
/// writing anything.
pub fn ids_command(program_path: &Path, facts: Option<&Path>, config: Option<&Path>, env: bool) -> Result<()> {
    let mut program = load_program(program_path)?;
    let facts = load_facts(facts, &program)?;
    let config = load_config(config, env)?;
    let report = harden(&mut program, &facts, &config)
        .with_context(|| format!("Failed to assign identifiers for {}", program_path.display()))?;
    print!("{}", report.ids);
    Ok(())
}
