use super::models::{JobRun, RunStart, RunStatus};
use super::schema::EXECUTION_LOG_VERSIONED_SCHEMAS;
use super::ExecutionLog;
use crate::background_jobs::JobParams;
use crate::sqlite_persistence::{open_versioned_db, prepare_versioned_db};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::info;

const RUN_COLUMNS: &str =
    "id, job_name, request_id, started_at, finished_at, status, error_message, triggered_by, params";

pub struct SqliteExecutionLog {
    conn: Mutex<Connection>,
}

impl SqliteExecutionLog {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        info!("Opening execution log at {:?}", path);
        let conn = open_versioned_db(path, EXECUTION_LOG_VERSIONED_SCHEMAS, "execution log")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Non-durable log, used by tests.
    pub fn in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        prepare_versioned_db(&mut conn, EXECUTION_LOG_VERSIONED_SCHEMAS, "execution log")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Fixed-width UTC timestamps so that text ordering matches time ordering.
    fn format_datetime(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    }

    fn row_to_job_run(row: &rusqlite::Row) -> rusqlite::Result<JobRun> {
        let status_str: String = row.get("status")?;
        let started_at_str: String = row.get("started_at")?;
        let finished_at_str: Option<String> = row.get("finished_at")?;
        let params_str: String = row.get("params")?;

        Ok(JobRun {
            id: row.get("id")?,
            job_name: row.get("job_name")?,
            request_id: row.get("request_id")?,
            started_at: Self::parse_datetime(&started_at_str).unwrap_or_else(Utc::now),
            finished_at: finished_at_str.and_then(|s| Self::parse_datetime(&s)),
            status: RunStatus::parse(&status_str).unwrap_or(RunStatus::Failed),
            error_message: row.get("error_message")?,
            triggered_by: row.get("triggered_by")?,
            params: serde_json::from_str::<JobParams>(&params_str).unwrap_or_default(),
        })
    }

    fn get_run(conn: &Connection, run_id: i64) -> Result<Option<JobRun>> {
        let run = conn
            .query_row(
                &format!("SELECT {} FROM job_runs WHERE id = ?1", RUN_COLUMNS),
                params![run_id],
                Self::row_to_job_run,
            )
            .optional()?;
        Ok(run)
    }

    fn query_runs(
        &self,
        sql_filter: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<JobRun>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM job_runs {}",
            RUN_COLUMNS, sql_filter
        ))?;
        let runs = stmt
            .query_map(params, Self::row_to_job_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }
}

impl ExecutionLog for SqliteExecutionLog {
    fn begin_run(&self, start: &RunStart) -> Result<JobRun> {
        let conn = self.conn();
        let now = Utc::now();
        let params_json = serde_json::to_string(&start.params)?;

        conn.execute(
            "INSERT INTO job_runs (job_name, request_id, started_at, status, triggered_by, params)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                start.job_name,
                start.request_id,
                Self::format_datetime(&now),
                RunStatus::Running.as_str(),
                start.triggered_by,
                params_json
            ],
        )
        .with_context(|| format!("Failed to record start of {}", start.job_name))?;

        let run_id = conn.last_insert_rowid();
        Self::get_run(&conn, run_id)?.context("Run vanished right after insert")
    }

    fn finish_run(
        &self,
        run_id: i64,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> Result<JobRun> {
        if !status.is_terminal() {
            bail!("Cannot finish run {} with non-terminal status", run_id);
        }
        let conn = self.conn();
        let now = Self::format_datetime(&Utc::now());

        let updated = conn.execute(
            "UPDATE job_runs SET finished_at = ?1, status = ?2, error_message = ?3
             WHERE id = ?4 AND status = ?5",
            params![
                now,
                status.as_str(),
                error_message,
                run_id,
                RunStatus::Running.as_str()
            ],
        )?;
        if updated == 0 {
            bail!("Run {} is unknown or already finalized", run_id);
        }

        Self::get_run(&conn, run_id)?.context("Finalized run vanished")
    }

    fn append(&self, run: &JobRun) -> Result<i64> {
        let finished_at = match (run.status.is_terminal(), run.finished_at) {
            (true, Some(finished_at)) => finished_at,
            _ => bail!("Only finalized runs can be appended ({})", run.job_name),
        };
        let conn = self.conn();
        conn.execute(
            "INSERT INTO job_runs
             (job_name, request_id, started_at, finished_at, status, error_message, triggered_by, params)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run.job_name,
                run.request_id,
                Self::format_datetime(&run.started_at),
                Self::format_datetime(&finished_at),
                run.status.as_str(),
                run.error_message,
                run.triggered_by,
                serde_json::to_string(&run.params)?
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn recent(&self, limit: usize) -> Result<Vec<JobRun>> {
        self.query_runs(
            "ORDER BY started_at DESC, id DESC LIMIT ?1",
            &[&(limit as i64)],
        )
    }

    fn history(&self, job_name: &str, limit: usize) -> Result<Vec<JobRun>> {
        self.query_runs(
            "WHERE job_name = ?1 ORDER BY started_at DESC, id DESC LIMIT ?2",
            &[&job_name, &(limit as i64)],
        )
    }

    fn last_run(&self, job_name: &str) -> Result<Option<JobRun>> {
        Ok(self.history(job_name, 1)?.into_iter().next())
    }

    fn last_successful(&self, job_name: &str) -> Result<Option<JobRun>> {
        let runs = self.query_runs(
            "WHERE job_name = ?1 AND status = ?2 ORDER BY started_at DESC, id DESC LIMIT 1",
            &[&job_name, &RunStatus::Succeeded.as_str()],
        )?;
        Ok(runs.into_iter().next())
    }

    fn running(&self) -> Result<Vec<JobRun>> {
        self.query_runs(
            "WHERE status = ?1 ORDER BY started_at DESC",
            &[&RunStatus::Running.as_str()],
        )
    }

    fn mark_interrupted_runs(&self) -> Result<usize> {
        let conn = self.conn();
        let now = Self::format_datetime(&Utc::now());

        let count = conn.execute(
            "UPDATE job_runs SET status = ?1, finished_at = ?2, error_message = ?3
             WHERE status = ?4",
            params![
                RunStatus::Failed.as_str(),
                now,
                "Run was interrupted (orchestrator restart)",
                RunStatus::Running.as_str()
            ],
        )?;
        Ok(count)
    }

    fn prune_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn();
        let count = conn.execute(
            "DELETE FROM job_runs WHERE status != ?1 AND finished_at < ?2",
            params![RunStatus::Running.as_str(), Self::format_datetime(&cutoff)],
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn start(job_name: &str) -> RunStart {
        RunStart {
            job_name: job_name.to_string(),
            request_id: None,
            triggered_by: "manual".to_string(),
            params: JobParams::new(),
        }
    }

    fn finished_run(job_name: &str, status: RunStatus, started_at: DateTime<Utc>) -> JobRun {
        JobRun {
            id: 0,
            job_name: job_name.to_string(),
            request_id: None,
            started_at,
            finished_at: Some(started_at + chrono::Duration::seconds(1)),
            status,
            error_message: None,
            triggered_by: "schedule".to_string(),
            params: JobParams::new(),
        }
    }

    #[test]
    fn test_begin_and_finish_run() {
        let log = SqliteExecutionLog::in_memory().unwrap();

        let mut start = start("rss-sync");
        start.params.insert("indexer".to_string(), "all".to_string());
        start.request_id = Some("req-1".to_string());
        let run = log.begin_run(&start).unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.finished_at.is_none());
        assert_eq!(log.running().unwrap().len(), 1);

        let finished = log
            .finish_run(run.id, RunStatus::Failed, Some("indexer offline"))
            .unwrap();
        assert_eq!(finished.status, RunStatus::Failed);
        assert_eq!(finished.error_message.as_deref(), Some("indexer offline"));
        assert_eq!(finished.request_id.as_deref(), Some("req-1"));
        assert_eq!(finished.params.get("indexer").map(String::as_str), Some("all"));
        assert!(finished.finished_at.is_some());
        assert!(log.running().unwrap().is_empty());
    }

    #[test]
    fn test_finish_run_twice_fails() {
        let log = SqliteExecutionLog::in_memory().unwrap();
        let run = log.begin_run(&start("disk-scan")).unwrap();

        log.finish_run(run.id, RunStatus::Succeeded, None).unwrap();
        let result = log.finish_run(run.id, RunStatus::Failed, Some("late"));
        assert!(result.is_err());

        let last = log.last_run("disk-scan").unwrap().unwrap();
        assert_eq!(last.status, RunStatus::Succeeded);
    }

    #[test]
    fn test_finish_run_rejects_running_status() {
        let log = SqliteExecutionLog::in_memory().unwrap();
        let run = log.begin_run(&start("disk-scan")).unwrap();
        assert!(log.finish_run(run.id, RunStatus::Running, None).is_err());
    }

    #[test]
    fn test_append_requires_finalized_run() {
        let log = SqliteExecutionLog::in_memory().unwrap();
        let mut run = finished_run("rename", RunStatus::Skipped, Utc::now());
        assert!(log.append(&run).is_ok());

        run.status = RunStatus::Running;
        assert!(log.append(&run).is_err());
    }

    #[test]
    fn test_recent_is_newest_first() {
        let log = SqliteExecutionLog::in_memory().unwrap();
        let t0 = Utc::now() - chrono::Duration::minutes(10);
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            log.append(&finished_run(
                name,
                RunStatus::Succeeded,
                t0 + chrono::Duration::minutes(i as i64),
            ))
            .unwrap();
        }

        let recent = log.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].job_name, "c");
        assert_eq!(recent[1].job_name, "b");
    }

    #[test]
    fn test_last_successful_ignores_failures() {
        let log = SqliteExecutionLog::in_memory().unwrap();
        assert!(log.last_successful("rss-sync").unwrap().is_none());

        let t0 = Utc::now() - chrono::Duration::minutes(5);
        log.append(&finished_run("rss-sync", RunStatus::Succeeded, t0))
            .unwrap();
        log.append(&finished_run(
            "rss-sync",
            RunStatus::Failed,
            t0 + chrono::Duration::minutes(1),
        ))
        .unwrap();

        let last_ok = log.last_successful("rss-sync").unwrap().unwrap();
        assert_eq!(last_ok.status, RunStatus::Succeeded);
        assert_eq!(
            SqliteExecutionLog::format_datetime(&last_ok.started_at),
            SqliteExecutionLog::format_datetime(&t0)
        );
        assert_eq!(
            log.last_run("rss-sync").unwrap().unwrap().status,
            RunStatus::Failed
        );
    }

    #[test]
    fn test_mark_interrupted_runs() {
        let log = SqliteExecutionLog::in_memory().unwrap();
        log.begin_run(&start("a")).unwrap();
        log.begin_run(&start("b")).unwrap();

        assert_eq!(log.mark_interrupted_runs().unwrap(), 2);
        assert!(log.running().unwrap().is_empty());
        let run = log.last_run("a").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error_message.unwrap().contains("interrupted"));
    }

    #[test]
    fn test_prune_keeps_running_and_recent_runs() {
        let log = SqliteExecutionLog::in_memory().unwrap();
        let old = Utc::now() - chrono::Duration::days(60);
        log.append(&finished_run("a", RunStatus::Succeeded, old))
            .unwrap();
        log.append(&finished_run("a", RunStatus::Succeeded, Utc::now()))
            .unwrap();
        log.begin_run(&start("b")).unwrap();

        let pruned = log
            .prune_finished_before(Utc::now() - chrono::Duration::days(30))
            .unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(log.recent(10).unwrap().len(), 2);
    }

    #[test]
    fn test_history_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("jobs.db");

        {
            let log = SqliteExecutionLog::new(&db_path).unwrap();
            let run = log.begin_run(&start("disk-scan")).unwrap();
            log.finish_run(run.id, RunStatus::Succeeded, None).unwrap();
        }

        let log = SqliteExecutionLog::new(&db_path).unwrap();
        let history = log.history("disk-scan", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RunStatus::Succeeded);
    }
}
