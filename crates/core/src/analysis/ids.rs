//! Identifier assignment.
//!
//! Functions that co-occur as candidates of a site form a cluster and are
//! numbered densely. Everything reachable from outside the program (leaking
//! functions and targets of external sites) shares one cluster numbered from
//! the shared counter; every other cluster is numbered from the floor on its
//! own. Within a large cluster the biggest qualifying site is numbered first
//! so its dispatch table stays contiguous.

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::analysis::facts::SiteKind;
use crate::analysis::registry::{ResolveSite, TargetRegistry};
use crate::config::CfiConfig;
use crate::model::FuncId;

/// Clusters up to this size are numbered without looking for a sub-split.
const SPLIT_THRESHOLD: usize = 5;
/// A sub-split site needs more targets than this.
const MIN_SUBSET_TARGETS: usize = 4;
/// Sites with fewer targets are left out of the density report.
const DENSITY_MIN_TARGETS: usize = 4;
const LARGE_SITE_TARGETS: usize = 20;

/// Identifier base for a shared object, derived from its output name.
pub fn module_id(output_name: &str, id_bitwidth: u32) -> u64 {
    let digest = Sha256::digest(output_name.as_bytes());
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest[..8]);
    let mut id = u64::from_le_bytes(raw) & 0x7fff_ffff_ffff_ff00;
    if id_bitwidth < 64 {
        id &= (1u64 << id_bitwidth) - 1;
    }
    if id == 0 {
        0xff00
    } else {
        id
    }
}

/// Content hash of a site: kind, resolver fallback, shape and sorted
/// candidate handles. Sites sharing a hash share one dispatcher.
pub fn site_hash(site: &ResolveSite, pointer_bits: u32) -> String {
    let mut key = format!("{:?};{};", site.kind, site.external);
    key.push_str(&site.shape.params.len().to_string());
    key.push_str(&format!(";{}", site.shape.ret.size_bits(pointer_bits)));
    for param in &site.shape.params {
        key.push_str(&format!(";{}", param.size_bits(pointer_bits)));
    }
    let targets: BTreeSet<FuncId> = site.targets.iter().copied().collect();
    for target in targets {
        key.push_str(&format!(";{}", target.0));
    }
    let digest = Sha256::digest(key.as_bytes());
    format!("{:x}", digest)[..16].to_string()
}

/// How densely the candidates of each site are numbered.
///
/// A width of 1.0 means a site's identifiers form a gap-free run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DensityReport {
    pub sites: usize,
    pub average: f64,
    pub worst: f64,
    pub worst_large: f64,
    /// Highest identifier handed out in any space.
    pub max_id: u64,
}

impl TargetRegistry {
    /// Fill in missing site hashes and count repetitions.
    pub fn compute_hashes(&mut self, pointer_bits: u32) {
        for site in &mut self.sites {
            if site.hash.is_some() {
                continue;
            }
            let hash = site_hash(site, pointer_bits);
            *self.hash_counts.entry(hash.clone()).or_insert(0) += 1;
            site.hash = Some(hash);
        }
    }

    fn is_numberable(&self, func: FuncId) -> bool {
        self.functions.get(&func).map(|f| !f.removed && f.id.is_none() && !f.in_cluster).unwrap_or(false)
    }

    /// Grow `cluster` by every function that shares a site with a member.
    pub fn collect_cluster(&mut self, cluster: &mut BTreeSet<FuncId>, sites: &mut BTreeSet<usize>) {
        let mut queue: VecDeque<FuncId> = VecDeque::new();
        for func in cluster.iter() {
            if let Some(entry) = self.functions.get_mut(func) {
                entry.in_cluster = true;
            }
            queue.push_back(*func);
        }

        while let Some(func) = queue.pop_front() {
            for (idx, site) in self.sites.iter().enumerate() {
                if !site.targets.contains(&func) || !sites.insert(idx) {
                    continue;
                }
                for target in &site.targets {
                    let Some(entry) = self.functions.get_mut(target) else { continue };
                    if entry.in_cluster || entry.removed {
                        continue;
                    }
                    entry.in_cluster = true;
                    cluster.insert(*target);
                    queue.push_back(*target);
                }
            }
        }
    }

    /// Number `cluster` consecutively from `next`; returns the next free id.
    pub fn assign_cluster_ids(&mut self, cluster: &BTreeSet<FuncId>, sites: &BTreeSet<usize>, mut next: u64) -> u64 {
        if cluster.len() > SPLIT_THRESHOLD {
            let mut biggest: Option<(usize, BTreeSet<FuncId>)> = None;
            for idx in sites {
                let targets: BTreeSet<FuncId> = self.sites[*idx].targets.iter().copied().collect();
                let size = targets.len();
                if size <= MIN_SUBSET_TARGETS || size >= cluster.len() {
                    continue;
                }
                if biggest.as_ref().is_some_and(|(_, b)| size <= b.len()) {
                    continue;
                }
                if targets.is_subset(cluster) {
                    biggest = Some((*idx, targets));
                }
            }

            if let Some((idx, subset)) = biggest {
                debug!(site = %self.sites[idx].name, size = subset.len(), "numbering sub-cluster first");
                next = self.assign_cluster_ids(&subset, sites, next);
                let rest: BTreeSet<FuncId> = cluster.difference(&subset).copied().collect();
                return self.assign_cluster_ids(&rest, sites, next);
            }
        }

        let mut ordered: Vec<FuncId> = cluster.iter().copied().collect();
        ordered.sort_by(|a, b| {
            let name_a = self.functions.get(a).map(|f| f.name.as_str());
            let name_b = self.functions.get(b).map(|f| f.name.as_str());
            name_a.cmp(&name_b).then(a.cmp(b))
        });
        for func in ordered {
            if let Some(entry) = self.functions.get_mut(&func) {
                entry.id = Some(next);
                next += 1;
            }
        }
        next
    }

    /// Number the external cluster from the shared counter, then every
    /// internal cluster from the floor. Functions no site can reach are
    /// left to [`Self::assign_missing_ids`]. Returns the highest id used.
    pub fn assign_optimal_ids(&mut self, config: &CfiConfig) -> u64 {
        let mut external: BTreeSet<FuncId> = self
            .functions
            .values()
            .filter(|f| f.leaking)
            .map(|f| f.func)
            .filter(|f| self.is_numberable(*f))
            .collect();
        for site in &self.sites {
            if site.external {
                external.extend(site.targets.iter().copied().filter(|f| self.is_numberable(*f)));
            }
        }

        let mut max = self.next_id.saturating_sub(1);
        if !external.is_empty() {
            let mut external_sites = BTreeSet::new();
            self.collect_cluster(&mut external, &mut external_sites);
            self.next_id = self.assign_cluster_ids(&external, &external_sites, self.next_id);
            max = self.next_id - 1;
            info!(functions = external.len(), first = config.min_id, next = self.next_id, "numbered external cluster");
        }

        let reachable: BTreeSet<FuncId> = self.sites.iter().flat_map(|s| s.targets.iter().copied()).collect();
        let pending: Vec<FuncId> = self.functions.keys().copied().collect();
        for func in pending {
            if !reachable.contains(&func) || !self.is_numberable(func) {
                continue;
            }
            let mut cluster = BTreeSet::from([func]);
            let mut sites = BTreeSet::new();
            self.collect_cluster(&mut cluster, &mut sites);
            let next = self.assign_cluster_ids(&cluster, &sites, config.min_id);
            max = max.max(next - 1);
        }

        info!(functions = self.functions.len(), max_id = max, "assigned function identifiers");
        max
    }

    /// Give every function still without an identifier the next shared one.
    pub fn assign_missing_ids(&mut self) {
        for entry in self.functions.values_mut() {
            if entry.id.is_none() && !entry.removed {
                entry.id = Some(self.next_id);
                self.next_id += 1;
            }
        }
    }

    /// Measure identifier density per site and log it.
    pub fn density_report(&self, config: &CfiConfig) -> DensityReport {
        let mut report = DensityReport { worst: 1.0, worst_large: 1.0, ..DensityReport::default() };
        let mut total = 0.0;

        for site in &self.sites {
            if site.targets.len() < DENSITY_MIN_TARGETS {
                continue;
            }
            let ids: Vec<u64> = site.targets.iter().filter_map(|f| self.id_of(*f)).collect();
            let (Some(min), Some(max)) = (ids.iter().min(), ids.iter().max()) else { continue };
            let width = match site.kind {
                SiteKind::Call => (max + 1 - min) as f64 / site.targets.len() as f64,
                _ => (max + 1) as f64 / (site.targets.len() as u64 + config.min_id) as f64,
            };
            report.sites += 1;
            total += width;
            report.worst = report.worst.min(width);
            if site.targets.len() >= LARGE_SITE_TARGETS {
                report.worst_large = report.worst_large.min(width);
            }
        }

        report.max_id = self.functions.values().filter_map(|f| f.id).max().unwrap_or(0);
        if report.sites > 0 {
            report.average = total / report.sites as f64;
            info!(
                sites = report.sites,
                average = format!("{:.2}%", report.average * 100.0),
                worst = format!("{:.2}%", report.worst * 100.0),
                worst_large = format!("{:.2}%", report.worst_large * 100.0),
                "identifier density"
            );
        }
        report
    }
}

/// Run hashing and numbering over a populated registry.
pub fn assign_ids(registry: &mut TargetRegistry, config: &CfiConfig, pointer_bits: u32) -> DensityReport {
    registry.compute_hashes(pointer_bits);
    registry.assign_optimal_ids(config);
    registry.assign_missing_ids();
    registry.density_report(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_id_is_masked_and_never_zero() {
        let id = module_id("libfoo.so", 31);
        assert_eq!(id & 0xff, 0);
        assert!(id < (1 << 31));
        assert_eq!(module_id("libfoo.so", 31), id);
        assert_eq!(module_id("anything", 8), 0xff00);
    }
}
