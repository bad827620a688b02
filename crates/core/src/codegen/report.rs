//! Side-file renderings of the registry.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::analysis::facts::SiteKind;
use crate::analysis::registry::TargetRegistry;

/// Identifier listing, one ` - [ID n] name` line per live function.
pub fn id_listing(registry: &TargetRegistry) -> String {
    let mut out = String::new();
    for f in registry.functions() {
        let Some(id) = f.id.filter(|_| !f.removed) else { continue };
        let _ = write!(out, " - [ID {id}] {}", f.name);
        if !f.leaking {
            out.push_str(" (internal)");
        }
        out.push('\n');
    }
    out
}

/// One line of the per-site statistics file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsRow {
    pub kind: SiteKind,
    pub name: String,
    pub targets: usize,
    pub hash: String,
}

pub fn stats_rows(registry: &TargetRegistry) -> Vec<StatsRow> {
    registry
        .sites()
        .iter()
        .map(|site| StatsRow {
            kind: site.kind,
            name: site.name.clone(),
            targets: site.targets.len(),
            hash: site.hash.clone().unwrap_or_default(),
        })
        .collect()
}

/// `kind,name,count,hash` lines in site order.
pub fn stats_csv(rows: &[StatsRow]) -> String {
    rows.iter()
        .map(|r| format!("{},{},{},{}\n", r.kind.stats_label(), r.name, r.targets, r.hash))
        .collect()
}
