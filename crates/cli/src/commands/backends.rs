use anyhow::Result;
use serde::Serialize;

use switchboard_core::services::default_scan_registry;

#[derive(Debug, Serialize)]
pub struct BackendInfo {
    pub name: String,
    pub description: String,
}

/// List the residual scan backends compiled into this binary.
pub fn list_backends_command(json: bool) -> Result<()> {
    let registry = default_scan_registry();
    let entries: Vec<BackendInfo> = registry
        .names()
        .into_iter()
        .map(|name| {
            let description = match name.as_str() {
                "pattern" => "Word-pattern matcher for AArch64 br/blr".to_string(),
                "capstone" => "Capstone disassembly (x86_64, aarch64)".to_string(),
                other => format!("Backend '{}'", other),
            };
            BackendInfo { name, description }
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!("Backends:");
    for entry in entries {
        println!("- {}: {}", entry.name, entry.description);
    }
    Ok(())
}
