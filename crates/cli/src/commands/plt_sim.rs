use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};

use switchboard_core::model::Arch;
use switchboard_core::runtime::{BufferRegion, EntryOutcome, PltPatcher};

use crate::parse_number_pair;

/// Inputs of `switchboard plt-sim`.
#[derive(Debug, Clone)]
pub struct PltSimOptions {
    pub arch: Arch,
    /// Raw bytes of the table, header included.
    pub table: PathBuf,
    /// Address the table is loaded at.
    pub base: u64,
    /// `slot=target` pairs standing in for the GOT.
    pub slots: Vec<String>,
    pub output: Option<PathBuf>,
    pub json: bool,
}

/// Patch a dumped procedure linkage table against a given set of GOT slots.
pub fn plt_sim_command(options: &PltSimOptions) -> Result<()> {
    let bytes =
        std::fs::read(&options.table).with_context(|| format!("Failed to read table {}", options.table.display()))?;
    let slots = options.slots.iter().map(|pair| parse_number_pair(pair)).collect::<Result<BTreeMap<u64, u64>>>()?;

    let mut region = BufferRegion::new(options.base, bytes);
    let report = PltPatcher::new(options.arch)
        .patch_all(&mut region, &slots)
        .with_context(|| format!("Failed to patch {}", options.table.display()))?;

    if let Some(output) = &options.output {
        std::fs::write(output, region.into_bytes())
            .with_context(|| format!("Failed to write patched table to {}", output.display()))?;
    }

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Entries: {} ({} patched)", report.entries.len(), report.patched());
    for (addr, outcome) in &report.entries {
        let label = match outcome {
            EntryOutcome::Direct => "direct branch",
            EntryOutcome::Indirect => "register branch",
            EntryOutcome::AlreadyPatched => "already patched",
            EntryOutcome::EmptySlot => "slot not resolved yet",
        };
        println!("- {addr:#x}: {label}");
    }
    if let Some(output) = &options.output {
        println!("Wrote {}", output.display());
    }
    Ok(())
}
