use std::path::Path;

use anyhow::{bail, Context, Result};

use switchboard_core::services::{default_scan_registry, ScanRequest};

/// Scan a linked binary for indirect branches left after hardening.
///
/// Fails when any branch outside the tolerated startup code remains.
pub fn scan_binary_command(path: &Path, backend: &str, arch: Option<&str>, json: bool) -> Result<()> {
    let registry = default_scan_registry();
    let scanner = registry.require(backend)?;
    let request = ScanRequest { path: path.to_path_buf(), arch: arch.map(str::to_string) };
    let report = scanner.scan(&request).with_context(|| format!("Failed to scan {}", path.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Scanned {} ({}, backend {})", path.display(), report.arch, report.backend);
        for branch in &report.branches {
            let location = match &branch.symbol {
                Some(symbol) => format!("{symbol}+{:#x}", branch.offset),
                None => "?".to_string(),
            };
            let marker = if branch.critical { "" } else { " (tolerated)" };
            println!("- {:#x} {location}: {}{marker}", branch.address, branch.mnemonic);
        }
        if report.branches.is_empty() {
            println!("No indirect branches found.");
        }
    }

    let critical = report.critical_count();
    if critical > 0 {
        bail!("{critical} indirect branch(es) found outside tolerated code");
    }
    Ok(())
}
