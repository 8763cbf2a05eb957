#![forbid(unsafe_code)]

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use ulid::Ulid;

use gauntlet_domain::{hash_json, now_rfc3339, EvalRecord, FinalDecision, RunId};

const ARCHIVE_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS run_snapshots (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  final_decision TEXT CHECK (final_decision IN ('BUILD','KILL','INSUFFICIENT_INFO')),
  snapshot_json TEXT NOT NULL,
  snapshot_hash TEXT NOT NULL,
  UNIQUE(run_id, recorded_at)
);

CREATE INDEX IF NOT EXISTS idx_run_snapshots_run ON run_snapshots(run_id, id);

CREATE TRIGGER IF NOT EXISTS trg_run_snapshots_no_update
BEFORE UPDATE ON run_snapshots
BEGIN
  SELECT RAISE(FAIL, 'run_snapshots is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_run_snapshots_no_delete
BEFORE DELETE ON run_snapshots
BEGIN
  SELECT RAISE(FAIL, 'run_snapshots is append-only');
END;
";

/// One archived run snapshot as read back from storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchivedRun {
    pub run_id: RunId,
    pub recorded_at: String,
    pub final_decision: Option<String>,
    pub snapshot: serde_json::Value,
    pub snapshot_hash: String,
}

/// Durable record of finished (or killed) evaluation runs.
pub trait RunArchive {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn persist(&self, record: &EvalRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_runs(&self) -> Result<Vec<ArchivedRun>>;

    /// Latest snapshot for one run, if any exists.
    #[allow(clippy::missing_errors_doc)]
    fn get_run(&self, run_id: RunId) -> Result<Option<ArchivedRun>>;
}

/// Archive that drops everything. Used when no database path is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRunArchive;

impl RunArchive for NoopRunArchive {
    fn migrate(&self) -> Result<()> {
        Ok(())
    }

    fn persist(&self, _record: &EvalRecord) -> Result<()> {
        Ok(())
    }

    fn list_runs(&self) -> Result<Vec<ArchivedRun>> {
        Ok(Vec::new())
    }

    fn get_run(&self, _run_id: RunId) -> Result<Option<ArchivedRun>> {
        Ok(None)
    }
}

pub struct SqliteRunArchive {
    conn: Connection,
}

impl SqliteRunArchive {
    /// Open or create a `SQLite` archive database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }
}

impl RunArchive for SqliteRunArchive {
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply archive schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![ARCHIVE_SCHEMA_VERSION, now_rfc3339()?],
            )
            .context("failed to record archive migration")?;
        Ok(())
    }

    fn persist(&self, record: &EvalRecord) -> Result<()> {
        let snapshot = serde_json::to_value(record)?;
        self.conn
            .execute(
                "INSERT INTO run_snapshots(
                    run_id, recorded_at, final_decision, snapshot_json, snapshot_hash
                ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.run_id.to_string(),
                    now_rfc3339()?,
                    record.final_decision.map(FinalDecision::as_str),
                    serde_json::to_string(&snapshot)?,
                    hash_json(&snapshot)?,
                ],
            )
            .context("failed to insert run snapshot")?;
        Ok(())
    }

    fn list_runs(&self) -> Result<Vec<ArchivedRun>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, recorded_at, final_decision, snapshot_json, snapshot_hash
             FROM run_snapshots
             ORDER BY id ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_archived(
                &row.get::<_, String>(0)?,
                row.get(1)?,
                row.get(2)?,
                &row.get::<_, String>(3)?,
                row.get(4)?,
            )?);
        }
        Ok(out)
    }

    fn get_run(&self, run_id: RunId) -> Result<Option<ArchivedRun>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, recorded_at, final_decision, snapshot_json, snapshot_hash
             FROM run_snapshots
             WHERE run_id = ?1
             ORDER BY id DESC
             LIMIT 1",
        )?;

        stmt.query_row(params![run_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })
        .optional()?
        .map(|(run_id_raw, recorded_at, final_decision, snapshot_json, snapshot_hash)| {
            row_to_archived(
                &run_id_raw,
                recorded_at,
                final_decision,
                &snapshot_json,
                snapshot_hash,
            )
        })
        .transpose()
    }
}

fn row_to_archived(
    run_id_raw: &str,
    recorded_at: String,
    final_decision: Option<String>,
    snapshot_json: &str,
    snapshot_hash: String,
) -> Result<ArchivedRun> {
    Ok(ArchivedRun {
        run_id: parse_run_id(run_id_raw)?,
        recorded_at,
        final_decision,
        snapshot: serde_json::from_str(snapshot_json).context("invalid snapshot_json")?,
        snapshot_hash,
    })
}

fn parse_run_id(value: &str) -> Result<RunId> {
    let ulid = Ulid::from_str(value).map_err(|err| anyhow!("invalid run_id ULID: {err}"))?;
    Ok(RunId(ulid))
}
