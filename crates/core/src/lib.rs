//! switchboard-core
//!
//! Control-flow integrity by indirect-call elimination. Function addresses
//! are replaced by small dense identifiers, and every indirect call becomes
//! a switch over the identifiers its site may legally reach.
//!
//! - `model`: the explicit program representation the stages rewrite, plus
//!   a reference interpreter.
//! - `analysis`: input facts, the target registry, identifier assignment.
//! - `codegen`: dispatch generation, back-translation and the residual check.
//! - `runtime`: the branch sled and the PLT patcher.
//! - `services`: the end-to-end pipeline and binary scanners.
//! - `db`: the run statistics database.

pub mod analysis;
pub mod codegen;
pub mod config;
pub mod db;
pub mod document;
pub mod model;
pub mod runtime;
pub mod services;

/// Returns the library version as encoded at compile time.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
