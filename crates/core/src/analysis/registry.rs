//! Known functions and resolve sites, built from a fact set.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::{debug, warn};

use crate::analysis::compat::is_compatible;
use crate::analysis::facts::{FactSet, SiteFact, SiteKind};
use crate::config::CfiConfig;
use crate::model::{FuncId, InstId, InstKind, InstRef, ModelError, Program, Signature};

/// Runtime helper that patches the PLT; never gets an identifier.
const PLT_PATCHER: &str = "__noic_patch_plt";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Site refers to unknown function {0}")]
    UnknownFunction(String),

    #[error("Site {site} names target {target}, which does not exist")]
    UnknownTarget { site: String, target: String },

    #[error("Instruction {inst} in {function} is not a call")]
    NotACall { function: String, inst: u32 },

    #[error("Instruction {inst} in {function} is described by more than one {kind:?} fact")]
    DuplicateSite { function: String, inst: u32, kind: SiteKind },

    #[error(transparent)]
    Model(#[from] ModelError),
}

/// A function that may receive an identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFunction {
    pub func: FuncId,
    pub name: String,
    pub id: Option<u64>,
    /// Observable outside the program; numbered in the shared space.
    pub leaking: bool,
    pub removed: bool,
    pub in_cluster: bool,
}

/// A place where a function value is consumed indirectly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveSite {
    pub kind: SiteKind,
    pub name: String,
    pub external: bool,
    /// Candidates in discovery order, without duplicates.
    pub targets: Vec<FuncId>,
    /// Owning instruction; cleared once the site has been rewritten.
    pub call: Option<InstRef>,
    pub resolve_arg: u32,
    /// Content hash, filled in by identifier assignment.
    pub hash: Option<String>,
    /// Call shape used for matching and hashing.
    pub shape: Signature,
}

impl ResolveSite {
    pub fn is_consumed(&self) -> bool {
        self.call.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TargetRegistry {
    pub(crate) functions: BTreeMap<FuncId, TargetFunction>,
    pub(crate) sites: Vec<ResolveSite>,
    /// Next identifier of the shared (leaking) space.
    pub(crate) next_id: u64,
    pub(crate) hash_counts: BTreeMap<String, usize>,
}

impl TargetRegistry {
    pub fn new(first_id: u64) -> Self {
        Self { next_id: first_id, ..Self::default() }
    }

    /// Build the registry for `program` from `facts`.
    pub fn populate(program: &Program, facts: &FactSet, config: &CfiConfig) -> Result<Self, RegistryError> {
        let mut registry = TargetRegistry::new(config.min_id);

        let mut candidates: BTreeSet<FuncId> = program.address_taken();
        for fact in &facts.functions {
            if fact.address_taken || fact.leaking {
                if let Some(func) = program.function_by_name(&fact.name) {
                    candidates.insert(func);
                }
            }
        }
        candidates.retain(|f| program.function(*f).name != PLT_PATCHER);

        for func in &candidates {
            let fact = facts.function(&program.function(*func).name);
            let entry = registry.register(program, *func);
            entry.leaking |= fact.map(|f| f.leaking).unwrap_or(false);
            entry.removed |= fact.map(|f| f.removed).unwrap_or(false);
        }

        let mut seen: BTreeSet<(InstRef, SiteKind, u32)> = BTreeSet::new();
        for fact in &facts.sites {
            if config.is_carve_out(&fact.function) {
                debug!(function = %fact.function, "skipping site in carve-out function");
                continue;
            }
            let site = registry.site_from_fact(program, fact, &candidates, config)?;
            let Some(call) = site.call else { continue };
            if !seen.insert((call, site.kind, site.resolve_arg)) {
                return Err(RegistryError::DuplicateSite {
                    function: fact.function.clone(),
                    inst: fact.inst,
                    kind: fact.kind,
                });
            }
            if site.targets.is_empty() {
                warn!(site = %site.name, "site has no compatible targets");
            }
            registry.sites.push(site);
        }

        debug!(functions = registry.functions.len(), sites = registry.sites.len(), "registry populated");
        Ok(registry)
    }

    fn site_from_fact(
        &mut self,
        program: &Program,
        fact: &SiteFact,
        candidates: &BTreeSet<FuncId>,
        config: &CfiConfig,
    ) -> Result<ResolveSite, RegistryError> {
        let func = program
            .function_by_name(&fact.function)
            .ok_or_else(|| RegistryError::UnknownFunction(fact.function.clone()))?;
        let call = InstRef { func, inst: InstId(fact.inst) };
        if !matches!(program.inst(call)?.kind, InstKind::Call { .. }) {
            return Err(RegistryError::NotACall { function: fact.function.clone(), inst: fact.inst });
        }

        let name = fact.name.clone().unwrap_or_else(|| format!("<unnamed call> in {}", fact.function));
        let shape = Signature { params: fact.args.clone(), ret: fact.ret.clone(), variadic: fact.variadic };
        let mut targets = Vec::new();

        match &fact.target {
            Some(target) => {
                let target_fn = program.function_by_name(target).ok_or_else(|| RegistryError::UnknownTarget {
                    site: name.clone(),
                    target: target.clone(),
                })?;
                self.register(program, target_fn);
                targets.push(target_fn);
            }
            None => {
                for candidate in candidates {
                    let f = program.function(*candidate);
                    if config.is_never_target(&f.name) {
                        continue;
                    }
                    if !fact.unconstrained && !is_compatible(&shape, &f.sig, program.pointer_bits) {
                        continue;
                    }
                    let entry = self.register(program, *candidate);
                    if entry.removed {
                        continue;
                    }
                    entry.leaking |= config.dynamic_linking;
                    if !targets.contains(candidate) {
                        targets.push(*candidate);
                    }
                }
            }
        }

        let external = match fact.kind {
            SiteKind::Call => fact.external.unwrap_or(config.external_resolver),
            _ => fact.external.unwrap_or(false),
        };

        Ok(ResolveSite {
            kind: fact.kind,
            name,
            external,
            targets,
            call: Some(call),
            resolve_arg: fact.resolve_arg,
            hash: None,
            shape,
        })
    }

    /// Entry for `func`, created on first reference.
    pub fn register(&mut self, program: &Program, func: FuncId) -> &mut TargetFunction {
        self.functions.entry(func).or_insert_with(|| TargetFunction {
            func,
            name: program.function(func).name.clone(),
            id: None,
            leaking: false,
            removed: false,
            in_cluster: false,
        })
    }

    /// Drop `func` from every site and keep it out of numbering.
    pub fn remove(&mut self, func: FuncId) {
        if let Some(entry) = self.functions.get_mut(&func) {
            entry.removed = true;
        }
        for site in &mut self.sites {
            site.targets.retain(|t| *t != func);
        }
    }

    pub fn add_site(&mut self, site: ResolveSite) -> usize {
        self.sites.push(site);
        self.sites.len() - 1
    }

    pub fn function(&self, func: FuncId) -> Option<&TargetFunction> {
        self.functions.get(&func)
    }

    pub fn function_mut(&mut self, func: FuncId) -> Option<&mut TargetFunction> {
        self.functions.get_mut(&func)
    }

    /// Registered functions in handle order.
    pub fn functions(&self) -> impl Iterator<Item = &TargetFunction> {
        self.functions.values()
    }

    pub fn sites(&self) -> &[ResolveSite] {
        &self.sites
    }

    pub fn sites_mut(&mut self) -> &mut [ResolveSite] {
        &mut self.sites
    }

    pub fn id_of(&self, func: FuncId) -> Option<u64> {
        self.functions.get(&func).filter(|f| !f.removed).and_then(|f| f.id)
    }

    /// Next identifier of the shared space.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Move the start of the shared space, e.g. to a module identifier.
    pub fn set_next_id(&mut self, next: u64) {
        self.next_id = next;
    }

    /// Number of sites carrying `hash`.
    pub fn hash_count(&self, hash: &str) -> usize {
        self.hash_counts.get(hash).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::facts::collect_facts;
    use crate::model::{Arch, Linkage, Type, Value};

    fn program_with_callbacks() -> Program {
        let mut p = Program::new("t", Arch::X86_64);
        let i32t = Type::Int(32);
        let add = p.define("add", Signature::new(vec![i32t.clone()], i32t.clone()), Linkage::Internal, |b| {
            b.ret(Some(b.arg(0)));
        });
        let neg = p.define("neg", Signature::new(vec![i32t.clone()], i32t.clone()), Linkage::Internal, |b| {
            b.ret(Some(b.arg(0)));
        });
        let log = p.define("log", Signature::new(vec![Type::Float(64)], Type::Void), Linkage::Internal, |b| {
            b.ret(None);
        });
        let restore = p.define("__restore", Signature::new(vec![i32t.clone()], i32t.clone()), Linkage::Internal, |b| {
            b.ret(Some(b.arg(0)));
        });
        p.add_global(crate::model::Global {
            name: "table".into(),
            cells: vec![Value::Func(add), Value::Func(neg), Value::Func(log), Value::Func(restore)],
            constant: true,
        });
        p.define("run", Signature::new(vec![Type::Ptr], i32t.clone()), Linkage::External, |b| {
            let r = b.call_indirect(b.arg(0), vec![b.int(32, 1)], Type::Int(32));
            b.ret(Some(r));
        });
        p
    }

    #[test]
    fn unknown_target_matches_compatible_address_taken_functions() {
        let p = program_with_callbacks();
        let facts = collect_facts(&p);
        let registry = TargetRegistry::populate(&p, &facts, &CfiConfig::default()).expect("populate");

        assert_eq!(registry.functions().count(), 4);
        let site = &registry.sites()[0];
        let names: Vec<&str> = site.targets.iter().map(|f| p.function(*f).name.as_str()).collect();
        assert_eq!(names, vec!["add", "neg"]);
        assert!(!site.external);
    }

    #[test]
    fn dynamic_linking_marks_matched_candidates_leaking() {
        let p = program_with_callbacks();
        let facts = collect_facts(&p);
        let config = CfiConfig { dynamic_linking: true, external_resolver: true, ..CfiConfig::default() };
        let registry = TargetRegistry::populate(&p, &facts, &config).expect("populate");
        let add = p.function_by_name("add").expect("add");
        let log = p.function_by_name("log").expect("log");
        assert!(registry.function(add).expect("add").leaking);
        assert!(!registry.function(log).expect("log").leaking);
        assert!(registry.sites()[0].external);
    }

    #[test]
    fn sites_in_carve_outs_are_ignored() {
        let mut p = program_with_callbacks();
        let run = p.function_by_name("run").expect("run");
        p.function_mut(run).name = "libc_start_init".into();
        let facts = collect_facts(&p);
        let registry = TargetRegistry::populate(&p, &facts, &CfiConfig::default()).expect("populate");
        assert!(registry.sites().is_empty());
    }
}
