//! Runtime support: the branch sled that caches identifier-to-address
//! routes, and the PLT patcher. Both write machine code only through
//! [`CodeRegion`].

pub mod aarch64;
pub mod plt;
pub mod region;
pub mod sled;
pub mod x86_64;

pub use plt::{EntryOutcome, PltError, PltPatcher, PltReport, ProcessSlots, SlotMemory};
#[cfg(unix)]
pub use region::ExecutableRegion;
pub use region::{BufferRegion, CodeRegion, RegionError};
pub use sled::{sled_len, BranchSled, Fallback, Route, SledError, SledResolver, SledState};
