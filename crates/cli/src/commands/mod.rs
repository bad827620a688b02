pub mod backends;
pub mod exec;
pub mod harden;
pub mod ids;
pub mod plt_sim;
pub mod scan;
pub mod sled_sim;
pub mod stats;
pub mod util;

pub use backends::*;
pub use exec::*;
pub use harden::*;
pub use ids::*;
pub use plt_sim::*;
pub use scan::*;
pub use sled_sim::*;
pub use stats::*;
pub use util::*;
