//! Build-time analysis: input facts, signature matching, the target registry
//! and identifier assignment.

pub mod compat;
pub mod facts;
pub mod ids;
pub mod registry;

pub use compat::is_compatible;
pub use facts::{collect_facts, FactSet, FunctionFact, SiteFact, SiteKind};
pub use ids::{assign_ids, module_id, site_hash, DensityReport};
pub use registry::{RegistryError, ResolveSite, TargetFunction, TargetRegistry};
