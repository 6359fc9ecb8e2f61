//! Append-only audit log of run lifecycle events, stored in sqlite.

use anyhow::Result;
use rusqlite::{Connection, params};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const MANIFEST_DB: &str = "manifest.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    RunStarted,
    LockReclaimed,
    JobProvisioned,
    JobStarted,
    JobFinished,
    JobCleanup,
    BranchDeleted,
    Merge,
    TasksCompleted,
    RunInterrupted,
    RunFinished,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::RunStarted => "run_started",
            Phase::LockReclaimed => "lock_reclaimed",
            Phase::JobProvisioned => "job_provisioned",
            Phase::JobStarted => "job_started",
            Phase::JobFinished => "job_finished",
            Phase::JobCleanup => "job_cleanup",
            Phase::BranchDeleted => "branch_deleted",
            Phase::Merge => "merge",
            Phase::TasksCompleted => "tasks_completed",
            Phase::RunInterrupted => "run_interrupted",
            Phase::RunFinished => "run_finished",
        }
    }
}

/// One event as appended by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct NewEntry {
    pub run_id: String,
    pub group: Option<String>,
    pub job_id: Option<String>,
    pub task_id: Option<String>,
    pub branch_name: Option<String>,
    pub status: String,
    pub base_revision: Option<String>,
    pub log_ref: Option<String>,
}

impl NewEntry {
    pub fn run(run_id: &str, status: impl Into<String>) -> Self {
        Self {
            run_id: run_id.to_string(),
            status: status.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestEntry {
    pub id: i64,
    pub timestamp: String,
    pub phase: String,
    pub run_id: String,
    pub group: Option<String>,
    pub job_id: Option<String>,
    pub task_id: Option<String>,
    pub branch_name: Option<String>,
    pub status: String,
    pub base_revision: Option<String>,
    pub log_ref: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ManifestQuery {
    pub run_id: Option<String>,
    pub group: Option<String>,
    pub job_id: Option<String>,
    pub task_id: Option<String>,
    pub phase: Option<Phase>,
}

/// Aggregated view of one run for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct RunProgress {
    pub run_id: String,
    pub started_at: String,
    pub last_event_at: String,
    pub last_phase: String,
    pub jobs_started: u32,
    pub jobs_finished: u32,
    pub merged: u32,
    pub finished: bool,
}

#[derive(Clone)]
pub struct Manifest {
    db: Arc<Mutex<Connection>>,
}

impl Manifest {
    pub async fn open(state_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(state_dir).await?;
        let db = Connection::open(state_dir.join(MANIFEST_DB))?;
        Self::init(db)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> Result<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS manifest_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                phase TEXT NOT NULL,
                run_id TEXT NOT NULL,
                grp TEXT,
                job_id TEXT,
                task_id TEXT,
                branch_name TEXT,
                status TEXT NOT NULL,
                base_revision TEXT,
                log_ref TEXT
            )",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_manifest_run_id ON manifest_entries(run_id, id)",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_manifest_task_id ON manifest_entries(task_id)",
            [],
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    pub async fn append(&self, phase: Phase, entry: NewEntry) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO manifest_entries
                (phase, run_id, grp, job_id, task_id, branch_name, status, base_revision, log_ref)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                phase.as_str(),
                entry.run_id,
                entry.group,
                entry.job_id,
                entry.task_id,
                entry.branch_name,
                entry.status,
                entry.base_revision,
                entry.log_ref,
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub async fn entries(&self, query: &ManifestQuery) -> Result<Vec<ManifestEntry>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, timestamp, phase, run_id, grp, job_id, task_id, branch_name, status, base_revision, log_ref
             FROM manifest_entries
             WHERE (?1 IS NULL OR run_id = ?1)
               AND (?2 IS NULL OR grp = ?2)
               AND (?3 IS NULL OR job_id = ?3)
               AND (?4 IS NULL OR task_id = ?4)
               AND (?5 IS NULL OR phase = ?5)
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(
            params![
                query.run_id,
                query.group,
                query.job_id,
                query.task_id,
                query.phase.map(|p| p.as_str()),
            ],
            |row| {
                Ok(ManifestEntry {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    phase: row.get(2)?,
                    run_id: row.get(3)?,
                    group: row.get(4)?,
                    job_id: row.get(5)?,
                    task_id: row.get(6)?,
                    branch_name: row.get(7)?,
                    status: row.get(8)?,
                    base_revision: row.get(9)?,
                    log_ref: row.get(10)?,
                })
            },
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Most recent runs first.
    pub async fn recent_runs(&self, limit: usize) -> Result<Vec<RunProgress>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT run_id,
                    MIN(timestamp),
                    MAX(timestamp),
                    (SELECT phase FROM manifest_entries last
                       WHERE last.run_id = m.run_id ORDER BY last.id DESC LIMIT 1),
                    SUM(CASE WHEN phase = 'job_started' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN phase = 'job_finished' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN phase = 'merge' AND status = 'success' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN phase IN ('run_finished', 'run_interrupted') THEN 1 ELSE 0 END)
             FROM manifest_entries m
             GROUP BY run_id
             ORDER BY MAX(id) DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(RunProgress {
                run_id: row.get(0)?,
                started_at: row.get(1)?,
                last_event_at: row.get(2)?,
                last_phase: row.get(3)?,
                jobs_started: row.get(4)?,
                jobs_finished: row.get(5)?,
                merged: row.get(6)?,
                finished: row.get::<_, i64>(7)? > 0,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
