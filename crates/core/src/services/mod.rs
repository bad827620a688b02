//! Services built on top of the core stages: the hardening pipeline and
//! the binary scanners.

pub mod backends;
pub mod pipeline;
pub mod scan;

pub use pipeline::{harden, write_side_files, HardenReport, PipelineError, STATS_FILE};
pub use scan::{
    default_scan_registry, IndirectBranch, PatternScanner, ScanBackend, ScanError, ScanRegistry, ScanReport,
    ScanRequest,
};
