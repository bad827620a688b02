//! Final check for indirect calls that survived rewriting.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{CfiConfig, ResidualMode};
use crate::model::Program;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("{count} indirect call(s) remain after rewriting, first in {first}")]
    ResidualIndirectCalls { count: usize, first: String },
}

/// An indirect call still present in the program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Residual {
    pub function: String,
    pub inst: u32,
    /// Lives in a carve-out function and is tolerated.
    pub carve_out: bool,
}

pub fn find_residuals(program: &Program, config: &CfiConfig) -> Vec<Residual> {
    program
        .instructions()
        .filter(|(_, inst)| inst.is_indirect_call())
        .map(|(at, _)| {
            let function = program.function(at.func).name.clone();
            let carve_out = config.is_carve_out(&function);
            Residual { function, inst: at.inst.0, carve_out }
        })
        .collect()
}

/// Report residual indirect calls according to `config.residual_check`.
///
/// Returns the residuals found; in error mode any residual outside a
/// carve-out function fails.
pub fn check_residuals(program: &Program, config: &CfiConfig) -> Result<Vec<Residual>, VerifyError> {
    if config.residual_check == ResidualMode::Off {
        return Ok(Vec::new());
    }
    let residuals = find_residuals(program, config);
    for r in &residuals {
        if r.carve_out {
            info!(function = %r.function, inst = r.inst, "indirect call kept in carve-out function");
        } else {
            warn!(function = %r.function, inst = r.inst, "indirect call survived rewriting");
        }
    }

    let offending: Vec<&Residual> = residuals.iter().filter(|r| !r.carve_out).collect();
    if config.residual_check == ResidualMode::Error {
        if let Some(first) = offending.first() {
            return Err(VerifyError::ResidualIndirectCalls { count: offending.len(), first: first.function.clone() });
        }
    }
    Ok(residuals)
}
