//! Launch journal.
//!
//! Records every launch and every supervisor event so `fxlaunch status`
//! can show what happened after the console window is gone:
//! - Launches: what was started, what was killed, how it ended
//! - Supervisor events: starts, exits, restarts, give-ups

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use uuid::Uuid;

use crate::launcher::{LaunchReport, LaunchRequest};

/// Database connection pool for the journal.
pub struct Database {
    pool: SqlitePool,
}

/// Stored launch record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredLaunch {
    pub id: String,
    pub kind: String,
    pub host: String,
    pub port: i64,
    pub command: String,
    pub mode: String,
    pub pid: Option<i64>,
    pub outcome: Option<String>,
    pub success: Option<bool>,
    pub used_fallback: bool,
    pub killed_pids: String,
    pub started_at: String,
    pub finished_at: Option<String>,
}

/// Stored supervisor event.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredSupervisorEvent {
    pub id: i64,
    pub session_id: String,
    pub event: String,
    pub pid: Option<i64>,
    pub exit_code: Option<i64>,
    pub restart_count: i64,
    pub detail: Option<String>,
    pub at: String,
}

/// Aggregate view of one supervisor session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: String,
    pub first_at: String,
    pub last_at: String,
    pub starts: i64,
    pub exits: i64,
    pub restarts: i64,
    pub last_event: String,
    pub last_exit_code: Option<i64>,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS launches (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                command TEXT NOT NULL,
                mode TEXT NOT NULL,
                pid INTEGER,
                outcome TEXT,
                success INTEGER,
                used_fallback INTEGER NOT NULL DEFAULT 0,
                killed_pids TEXT NOT NULL DEFAULT '',
                started_at TEXT NOT NULL,
                finished_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS supervisor_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                event TEXT NOT NULL,
                pid INTEGER,
                exit_code INTEGER,
                restart_count INTEGER NOT NULL DEFAULT 0,
                detail TEXT,
                at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_launches_started ON launches(started_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_supervisor_session ON supervisor_events(session_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Launches ====================

    /// Record that a launch is starting. Returns its id.
    pub async fn record_launch_start(&self, request: &LaunchRequest) -> Result<String> {
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO launches (id, kind, host, port, command, mode, started_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&request.name)
        .bind(&request.host)
        .bind(request.port as i64)
        .bind(request.command.to_string())
        .bind(request.mode.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to record launch")?;

        Ok(id)
    }

    /// Record how a launch ended.
    pub async fn record_launch_finish(&self, id: &str, report: &LaunchReport) -> Result<()> {
        let killed = report
            .killed
            .iter()
            .map(|pid| pid.to_string())
            .collect::<Vec<_>>()
            .join(",");

        sqlx::query(
            r#"
            UPDATE launches SET
                pid = ?,
                outcome = ?,
                success = ?,
                used_fallback = ?,
                killed_pids = ?,
                finished_at = ?
            WHERE id = ?
            "#,
        )
        .bind(report.outcome.pid().map(i64::from))
        .bind(report.outcome.label())
        .bind(report.outcome.is_success())
        .bind(report.used_fallback)
        .bind(killed)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to update launch")?;

        Ok(())
    }

    /// Most recent launches, newest first.
    pub async fn recent_launches(&self, limit: i64) -> Result<Vec<StoredLaunch>> {
        sqlx::query_as::<_, StoredLaunch>(
            "SELECT * FROM launches ORDER BY started_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch launches")
    }

    /// (total, failed, used fallback) across all finished launches.
    pub async fn launch_stats(&self) -> Result<(i64, i64, i64)> {
        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM launches")
            .fetch_one(&self.pool)
            .await?;

        let (failed,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM launches WHERE success = 0")
            .fetch_one(&self.pool)
            .await?;

        let (fallbacks,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM launches WHERE used_fallback = 1")
                .fetch_one(&self.pool)
                .await?;

        Ok((total, failed, fallbacks))
    }

    // ==================== Supervisor ====================

    /// Record a supervisor event.
    pub async fn record_supervisor_event(
        &self,
        session_id: &str,
        event: &str,
        pid: Option<u32>,
        exit_code: Option<i32>,
        restart_count: u32,
        detail: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO supervisor_events (session_id, event, pid, exit_code, restart_count, detail, at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(event)
        .bind(pid.map(i64::from))
        .bind(exit_code.map(i64::from))
        .bind(restart_count as i64)
        .bind(detail)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to record supervisor event")?;

        Ok(())
    }

    /// Most recent supervisor events, newest first.
    pub async fn recent_supervisor_events(&self, limit: i64) -> Result<Vec<StoredSupervisorEvent>> {
        sqlx::query_as::<_, StoredSupervisorEvent>(
            "SELECT * FROM supervisor_events ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch supervisor events")
    }

    /// Totals for one supervisor session, or the most recent one when `session_id` is `None`.
    pub async fn supervisor_summary(&self, session_id: Option<&str>) -> Result<Option<SessionSummary>> {
        let session_id = match session_id {
            Some(id) => id.to_string(),
            None => {
                let latest: Option<(String,)> =
                    sqlx::query_as("SELECT session_id FROM supervisor_events ORDER BY id DESC LIMIT 1")
                        .fetch_optional(&self.pool)
                        .await?;
                match latest {
                    Some((id,)) => id,
                    None => return Ok(None),
                }
            }
        };

        let totals: Option<(String, String, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT
                MIN(at),
                MAX(at),
                SUM(CASE WHEN event = 'started' THEN 1 ELSE 0 END),
                SUM(CASE WHEN event IN ('exited', 'spawn_failed') THEN 1 ELSE 0 END),
                MAX(restart_count)
            FROM supervisor_events
            WHERE session_id = ?
            GROUP BY session_id
            "#,
        )
        .bind(&session_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to summarize supervisor session")?;

        let Some((first_at, last_at, starts, exits, restarts)) = totals else {
            return Ok(None);
        };

        let (last_event,): (String,) = sqlx::query_as(
            "SELECT event FROM supervisor_events WHERE session_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(&session_id)
        .fetch_one(&self.pool)
        .await?;

        let last_exit: Option<(Option<i64>,)> = sqlx::query_as(
            r#"
            SELECT exit_code FROM supervisor_events
            WHERE session_id = ? AND exit_code IS NOT NULL
            ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(&session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(Some(SessionSummary {
            session_id,
            first_at,
            last_at,
            starts,
            exits,
            restarts,
            last_event,
            last_exit_code: last_exit.and_then(|(code,)| code),
        }))
    }

    /// Events of one supervisor session in order.
    pub async fn session_events(&self, session_id: &str) -> Result<Vec<StoredSupervisorEvent>> {
        sqlx::query_as::<_, StoredSupervisorEvent>(
            "SELECT * FROM supervisor_events WHERE session_id = ? ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch session events")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::launcher::{CommandSpec, LaunchOutcome, StartMode};

    /// Fresh database in a temp file.
    pub(crate) async fn temp_db() -> Database {
        let path = std::env::temp_dir().join(format!("fxlaunch-test-{}.db", Uuid::new_v4()));
        Database::new(&format!("sqlite:{}?mode=rwc", path.display()))
            .await
            .unwrap()
    }

    fn request() -> LaunchRequest {
        LaunchRequest {
            name: "mcp-server".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8000,
            command: CommandSpec::new("python", ["mt5_server.py".to_string()]),
            fallback: None,
            install_dir: PathBuf::from("."),
            mode: StartMode::Foreground,
            require_process: None,
            clear_port: true,
        }
    }

    #[tokio::test]
    async fn test_launch_roundtrip() {
        let db = temp_db().await;
        let req = request();

        let id = db.record_launch_start(&req).await.unwrap();

        let mut report = LaunchReport::new(&req.name, req.port);
        report.killed = vec![11, 12];
        report.used_fallback = true;
        report.outcome = LaunchOutcome::Exited { code: Some(1) };
        db.record_launch_finish(&id, &report).await.unwrap();

        let launches = db.recent_launches(10).await.unwrap();
        assert_eq!(launches.len(), 1);
        let stored = &launches[0];
        assert_eq!(stored.kind, "mcp-server");
        assert_eq!(stored.host, "127.0.0.1");
        assert_eq!(stored.command, "python mt5_server.py");
        assert_eq!(stored.killed_pids, "11,12");
        assert_eq!(stored.outcome.as_deref(), Some("exited(1)"));
        assert_eq!(stored.success, Some(false));
        assert!(stored.used_fallback);
        assert!(stored.finished_at.is_some());

        tokio_test::assert_ok!(db.launch_stats().await);
        assert_eq!(db.launch_stats().await.unwrap(), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_supervisor_events_in_order() {
        let db = temp_db().await;

        db.record_supervisor_event("s1", "started", Some(100), None, 0, None).await.unwrap();
        db.record_supervisor_event("s1", "exited", Some(100), Some(1), 0, None).await.unwrap();
        db.record_supervisor_event("s2", "started", Some(200), None, 0, None).await.unwrap();

        let events = db.session_events("s1").await.unwrap();
        let names: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(names, vec!["started", "exited"]);
        assert_eq!(events[1].exit_code, Some(1));

        let recent = db.recent_supervisor_events(1).await.unwrap();
        assert_eq!(recent[0].session_id, "s2");
    }

    #[tokio::test]
    async fn test_supervisor_summary() {
        let db = temp_db().await;
        assert_eq!(db.supervisor_summary(None).await.unwrap(), None);

        db.record_supervisor_event("s1", "started", Some(100), None, 0, None).await.unwrap();
        db.record_supervisor_event("s1", "exited", Some(100), Some(1), 0, None).await.unwrap();
        db.record_supervisor_event("s1", "restarting", None, None, 1, None).await.unwrap();
        db.record_supervisor_event("s1", "spawn_failed", None, None, 1, Some("not found")).await.unwrap();
        db.record_supervisor_event("s1", "gave_up", None, Some(1), 1, None).await.unwrap();
        db.record_supervisor_event("s2", "started", Some(200), None, 0, None).await.unwrap();

        let s1 = db.supervisor_summary(Some("s1")).await.unwrap().unwrap();
        assert_eq!(s1.starts, 1);
        assert_eq!(s1.exits, 2);
        assert_eq!(s1.restarts, 1);
        assert_eq!(s1.last_event, "gave_up");
        assert_eq!(s1.last_exit_code, Some(1));

        let latest = db.supervisor_summary(None).await.unwrap().unwrap();
        assert_eq!(latest.session_id, "s2");
        assert_eq!(latest.last_event, "started");
        assert_eq!(latest.last_exit_code, None);

        assert_eq!(db.supervisor_summary(Some("missing")).await.unwrap(), None);
    }
}
