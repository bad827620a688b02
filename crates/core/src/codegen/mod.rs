//! Site rewriting.
//!
//! After identifiers are assigned, every raw function reference becomes an
//! identifier constant and every resolve site is rewritten exactly once:
//! a direct call, an inline switch over identifiers, a call into a shared
//! dispatcher, a call into the runtime resolver, or a translation from
//! identifier back to address.

pub mod coerce;
pub mod dispatch;
pub mod handler;
pub mod report;
pub mod translate;
pub mod verify;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::analysis::facts::{SiteKind, REGISTER_HANDLER, REGISTER_HANDLER_NOVT};
use crate::analysis::registry::{ResolveSite, TargetRegistry};
use crate::config::CfiConfig;
use crate::model::{BlockId, Callee, FuncId, InstKind, InstRef, ModelError, Program, Type, Value};

pub use handler::{ALL_ID_HANDLER, DEFAULT_HANDLER, REGISTER_CTOR};
pub use report::{id_listing, stats_csv, stats_rows, StatsRow};
pub use verify::{check_residuals, find_residuals, Residual, VerifyError};

/// Function whose references must stay raw addresses.
const SIGACTION: &str = "__libc_sigaction";

#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("Site {site}: cannot pass argument {index} of type {from} as {to} to {target}")]
    ArgumentCoercion { site: String, index: usize, from: Type, to: Type, target: String },

    #[error("Site {site}: cannot convert result of type {from} to {to}")]
    ResultCoercion { site: String, from: Type, to: Type },

    #[error("Site {site}: cannot use a value of type {ty} as a function identifier")]
    Identifier { site: String, ty: Type },

    #[error("Site {site}: instruction is no longer placed in its function")]
    MissingInstruction { site: String },

    #[error("Site {site}: instruction is not a call")]
    NotACall { site: String },

    #[error("Site {site}: call has no argument {index} to resolve")]
    ResolveArgument { site: String, index: u32 },

    #[error(transparent)]
    Model(#[from] ModelError),
}

/// What the generator did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodegenReport {
    pub replaced_uses: usize,
    pub direct: usize,
    pub switched: usize,
    pub shared: usize,
    pub runtime: usize,
    pub translated: usize,
    pub dispatchers: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct Generator<'a> {
    program: &'a mut Program,
    registry: &'a mut TargetRegistry,
    config: &'a CfiConfig,
    report: CodegenReport,
}

impl<'a> Generator<'a> {
    pub fn new(program: &'a mut Program, registry: &'a mut TargetRegistry, config: &'a CfiConfig) -> Self {
        Self { program, registry, config, report: CodegenReport::default() }
    }

    pub fn report(&self) -> &CodegenReport {
        &self.report
    }

    pub fn finish(self) -> CodegenReport {
        self.report
    }

    /// Substitute identifier constants for every raw function reference.
    ///
    /// Direct callees, arguments of the handler registration routines and
    /// anything inside carve-out functions keep the real address. Functions
    /// without an identifier get the next shared one first.
    pub fn replace_functions_with_ids(&mut self) -> usize {
        let mut ids: BTreeMap<FuncId, u64> = BTreeMap::new();
        let mut next_id = self.registry.next_id;
        for entry in self.registry.functions.values_mut() {
            if entry.removed {
                continue;
            }
            let id = match entry.id {
                Some(id) => id,
                None => {
                    next_id += 1;
                    entry.id = Some(next_id - 1);
                    next_id - 1
                }
            };
            ids.insert(entry.func, id);
        }
        self.registry.next_id = next_id;

        let register_handlers: Vec<FuncId> = [REGISTER_HANDLER, REGISTER_HANDLER_NOVT]
            .iter()
            .filter_map(|name| self.program.function_by_name(name))
            .collect();

        let mut replaced = 0;
        for f in &mut self.program.functions {
            if self.config.is_carve_out(&f.name) || f.name == SIGACTION {
                continue;
            }
            let Some(body) = f.body.as_mut() else { continue };
            let placed: Vec<_> = body.blocks.iter().flat_map(|b| b.insts.iter().copied()).collect();
            for id in placed {
                let inst = body.inst_mut(id);
                if let InstKind::Call { callee: Callee::Direct(target), .. } = &inst.kind {
                    if register_handlers.contains(target) {
                        continue;
                    }
                }
                inst.for_each_operand_mut(|v| {
                    if let Value::Func(func) = v {
                        if let Some(id) = ids.get(func) {
                            *v = Value::addr(*id);
                            replaced += 1;
                        }
                    }
                });
            }
        }

        for global in &mut self.program.globals {
            for cell in &mut global.cells {
                if let Value::Func(func) = cell {
                    if let Some(id) = ids.get(func) {
                        *cell = Value::addr(*id);
                        replaced += 1;
                    }
                }
            }
        }

        info!(functions = ids.len(), uses = replaced, "replaced function references with identifiers");
        self.report.replaced_uses += replaced;
        replaced
    }

    /// Rewrite every site that has not been consumed yet, in creation order.
    pub fn generate_all(&mut self) -> Result<(), CodegenError> {
        for idx in 0..self.registry.sites.len() {
            self.generate_site(idx)?;
        }
        Ok(())
    }

    pub fn generate_site(&mut self, idx: usize) -> Result<(), CodegenError> {
        let site = self.registry.sites[idx].clone();
        if site.is_consumed() {
            return Ok(());
        }
        debug!(site = %site.name, kind = ?site.kind, targets = site.targets.len(), external = site.external, "generating");
        match site.kind {
            SiteKind::Call => self.generate_call(&site)?,
            SiteKind::ResolveArgument | SiteKind::ResolveReturn => self.generate_resolve(&site)?,
        }
        self.registry.sites[idx].call = None;
        Ok(())
    }

    fn locate(&self, site: &ResolveSite, call: InstRef) -> Result<(BlockId, usize), CodegenError> {
        self.program
            .body(call.func)?
            .locate(call.inst)
            .ok_or_else(|| CodegenError::MissingInstruction { site: site.name.clone() })
    }

    /// Identifiers of a site's candidates, in candidate order.
    fn numbered_targets(&self, site: &ResolveSite) -> Vec<(FuncId, u64)> {
        site.targets.iter().filter_map(|f| self.registry.id_of(*f).map(|id| (*f, id))).collect()
    }

    fn warn(&mut self, message: String) {
        tracing::warn!("{message}");
        self.report.warnings.push(message);
    }
}
