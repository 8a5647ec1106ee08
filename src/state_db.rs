use std::sync::Mutex;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{Connection, params};

use crate::error::GuardResult;
use crate::models::deployment::{
    DeploymentState, DeploymentVersion, RollbackEvent, RollbackReason,
};

const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, TS_FORMAT)
        .map(|n| n.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

/// Durable trail of deployments, state transitions, and rollback events.
/// Every transition is written here before its externally visible side
/// effect completes, so a crash mid-rollback leaves a resumable record.
pub struct StateDb {
    conn: Mutex<Connection>,
}

impl StateDb {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS deployments (
                id              TEXT PRIMARY KEY,
                artifact_ref    TEXT NOT NULL,
                deployed_at     TEXT NOT NULL,
                config_snapshot TEXT NOT NULL DEFAULT '{}',
                metrics_baseline TEXT NOT NULL DEFAULT '{}',
                schema_revision TEXT NOT NULL DEFAULT '',
                created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_deployments_at ON deployments(deployed_at DESC);

            CREATE TABLE IF NOT EXISTS state_transitions (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                from_state TEXT NOT NULL,
                to_state   TEXT NOT NULL,
                note       TEXT,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );

            CREATE TABLE IF NOT EXISTS rollback_events (
                id           TEXT PRIMARY KEY,
                triggered_at TEXT NOT NULL,
                reason       TEXT NOT NULL,
                from_version TEXT NOT NULL,
                to_version   TEXT NOT NULL,
                duration_ms  INTEGER NOT NULL,
                created_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_rollback_events_at ON rollback_events(triggered_at DESC);
            ",
        )?;
        Ok(())
    }

    pub fn record_deployment(&self, version: &DeploymentVersion) -> GuardResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO deployments
             (id, artifact_ref, deployed_at, config_snapshot, metrics_baseline, schema_revision)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                version.id,
                version.artifact_ref,
                format_ts(&version.deployed_at),
                serde_json::to_string(&version.config_snapshot)?,
                serde_json::to_string(&version.metrics_baseline)?,
                version.schema_revision,
            ],
        )?;
        Ok(())
    }

    pub fn record_transition(
        &self,
        from: DeploymentState,
        to: DeploymentState,
        note: Option<&str>,
    ) -> GuardResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO state_transitions (from_state, to_state, note) VALUES (?1, ?2, ?3)",
            params![from.as_str(), to.as_str(), note],
        )?;
        Ok(())
    }

    pub fn append_rollback_event(&self, event: &RollbackEvent) -> GuardResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO rollback_events
             (id, triggered_at, reason, from_version, to_version, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id,
                format_ts(&event.triggered_at),
                event.reason.as_str(),
                event.from_version,
                event.to_version,
                event.duration_ms as i64,
            ],
        )?;
        Ok(())
    }

    pub fn list_recent_events(&self, limit: usize) -> GuardResult<Vec<RollbackEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, triggered_at, reason, from_version, to_version, duration_ms
             FROM rollback_events ORDER BY triggered_at DESC, created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let reason: String = row.get(2)?;
                Ok(RollbackEvent {
                    id: row.get(0)?,
                    triggered_at: parse_ts(&row.get::<_, String>(1)?),
                    reason: RollbackReason::parse(&reason)
                        .unwrap_or(RollbackReason::ManualTrigger),
                    from_version: row.get(3)?,
                    to_version: row.get(4)?,
                    duration_ms: row.get::<_, i64>(5)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_rollback_events(&self) -> GuardResult<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM rollback_events", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn count_transitions(&self) -> GuardResult<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM state_transitions", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
