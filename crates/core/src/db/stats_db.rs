use std::path::Path;

use rusqlite::{params, Connection};
use thiserror::Error;

use crate::codegen::StatsRow;
use crate::db::{HashRepetition, RunRecord, SiteStatRecord, StoredRun};

/// Minimum schema version we know how to handle.
///
/// `0` means "no schema yet" (fresh DB).
const MIN_SUPPORTED_SCHEMA_VERSION: i32 = 0;

/// Latest schema version this crate knows about.
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// The database was created with a newer schema version than we support.
    #[error("Unsupported schema version {found}; supported range is {min_supported}..={max_supported}")]
    UnsupportedSchemaVersion { found: i32, min_supported: i32, max_supported: i32 },
}

pub type DbResult<T> = Result<T, DbError>;

/// SQLite-backed run history.
#[derive(Debug)]
pub struct StatsDb {
    conn: Connection,
}

impl StatsDb {
    /// Open (or create) a database at `path` and bring the schema up to date.
    pub fn open(path: &Path) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        apply_migrations(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        apply_migrations(&conn)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Insert a run and its site rows in one transaction; returns the run id.
    pub fn record_run(&mut self, run: &RunRecord, rows: &[StatsRow]) -> DbResult<i64> {
        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO runs (program, config_hash, started_at, finished_at, functions, sites, max_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                run.program,
                run.config_hash,
                run.started_at,
                run.finished_at,
                run.functions as i64,
                run.sites as i64,
                run.max_id as i64
            ],
        )?;
        let run_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO site_stats (run_id, kind, name, targets, hash)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )?;
            for row in rows {
                let record = SiteStatRecord::from_row(run_id, row);
                stmt.execute(params![run_id, record.kind, record.name, record.targets as i64, record.hash])?;
            }
        }
        tx.commit()?;
        Ok(run_id)
    }

    /// Runs, oldest first, optionally for one program.
    pub fn list_runs(&self, program: Option<&str>) -> DbResult<Vec<StoredRun>> {
        fn map_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRun> {
            Ok(StoredRun {
                id: row.get(0)?,
                run: RunRecord {
                    program: row.get(1)?,
                    config_hash: row.get(2)?,
                    started_at: row.get(3)?,
                    finished_at: row.get(4)?,
                    functions: row.get::<_, i64>(5)? as u64,
                    sites: row.get::<_, i64>(6)? as u64,
                    max_id: row.get::<_, i64>(7)? as u64,
                },
            })
        }

        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, program, config_hash, started_at, finished_at, functions, sites, max_id
            FROM runs
            WHERE ?1 IS NULL OR program = ?1
            ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map(params![program], map_run)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Site rows of one run, or of every run.
    pub fn list_site_stats(&self, run_id: Option<i64>) -> DbResult<Vec<SiteStatRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT run_id, kind, name, targets, hash
            FROM site_stats
            WHERE ?1 IS NULL OR run_id = ?1
            ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(SiteStatRecord {
                run_id: row.get(0)?,
                kind: row.get(1)?,
                name: row.get(2)?,
                targets: row.get::<_, i64>(3)? as u64,
                hash: row.get(4)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Hashes carried by at least `min_sites` sites, most frequent first.
    pub fn hash_repetitions(&self, min_sites: u64) -> DbResult<Vec<HashRepetition>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT hash, COUNT(*) AS sites, COUNT(DISTINCT run_id) AS runs
            FROM site_stats
            WHERE hash != ''
            GROUP BY hash
            HAVING COUNT(*) >= ?1
            ORDER BY sites DESC, hash
            "#,
        )?;
        let rows = stmt.query_map(params![min_sites as i64], |row| {
            Ok(HashRepetition {
                hash: row.get(0)?,
                sites: row.get::<_, i64>(1)? as u64,
                runs: row.get::<_, i64>(2)? as u64,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// Apply schema migrations to bring the database to the latest version.
///
/// Version map:
/// - 0: no schema
/// - 1: runs
/// - 2: site_stats
fn apply_migrations(conn: &Connection) -> DbResult<()> {
    let current_version = current_schema_version(conn)?;

    if current_version > CURRENT_SCHEMA_VERSION {
        return Err(DbError::UnsupportedSchemaVersion {
            found: current_version,
            min_supported: MIN_SUPPORTED_SCHEMA_VERSION,
            max_supported: CURRENT_SCHEMA_VERSION,
        });
    }

    if current_version < 1 {
        conn.execute_batch(
            r#"
            BEGIN;
            CREATE TABLE IF NOT EXISTS runs (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                program      TEXT NOT NULL,
                config_hash  TEXT NOT NULL,
                started_at   TEXT NOT NULL,
                finished_at  TEXT NOT NULL,
                functions    INTEGER NOT NULL,
                sites        INTEGER NOT NULL,
                max_id       INTEGER NOT NULL
            );

            PRAGMA user_version = 1;
            COMMIT;
            "#,
        )?;
    }

    if current_version < 2 {
        conn.execute_batch(
            r#"
            BEGIN;
            CREATE TABLE IF NOT EXISTS site_stats (
                id       INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id   INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                kind     TEXT NOT NULL,
                name     TEXT NOT NULL,
                targets  INTEGER NOT NULL,
                hash     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS site_stats_hash ON site_stats (hash);

            PRAGMA user_version = 2;
            COMMIT;
            "#,
        )?;
    }

    Ok(())
}

/// Read the SQLite schema version from `PRAGMA user_version`.
fn current_schema_version(conn: &Connection) -> DbResult<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    Ok(version)
}
