//! Statistics database.
//!
//! Every hardening run can be recorded in a SQLite file together with its
//! per-site rows. The history is used to tune the dispatcher-sharing
//! threshold: hashes that repeat a lot across runs are the ones worth a
//! shared dispatcher.
//!
//! - `RunRecord` / `StoredRun`: one hardening run.
//! - `SiteStatRecord`: one resolve site of a run.
//! - `HashRepetition`: how often a site hash occurs.
//! - `StatsDb`: the SQLite wrapper with `PRAGMA user_version` migrations.

mod models;
mod stats_db;

pub use models::{HashRepetition, RunRecord, SiteStatRecord, StoredRun};
pub use stats_db::{DbError, DbResult, StatsDb, CURRENT_SCHEMA_VERSION};
