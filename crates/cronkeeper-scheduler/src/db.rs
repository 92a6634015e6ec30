use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, types::Type, Connection, Row};

use crate::{
    error::Result,
    store::{DefinitionStore, HistoryStore},
    types::{
        ExecutionRecord, Outcome, RetryPolicy, RetryState, RunStats, SchedulingState, Task,
    },
};

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `tasks`, `task_state` and `executions` tables (idempotent) and
/// an index so per-task history queries stay cheap as the ledger grows.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            name            TEXT    NOT NULL PRIMARY KEY,
            trigger         TEXT    NOT NULL,
            command         TEXT    NOT NULL,
            enabled         INTEGER NOT NULL DEFAULT 1,
            timeout_ms      INTEGER NOT NULL DEFAULT 0,   -- 0 means no timeout
            max_attempts    INTEGER NOT NULL DEFAULT 0,
            retry_delay_ms  INTEGER NOT NULL DEFAULT 0,
            priority        INTEGER NOT NULL DEFAULT 5,
            working_dir     TEXT,
            environment     TEXT    NOT NULL DEFAULT '{}', -- JSON object
            description     TEXT    NOT NULL DEFAULT '',
            tags            TEXT    NOT NULL DEFAULT '[]', -- JSON array
            owner           TEXT    NOT NULL DEFAULT '',
            notify          TEXT,                 -- JSON object, NULL when unset
            created_at      TEXT    NOT NULL,
            updated_at      TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS task_state (
            name            TEXT    NOT NULL PRIMARY KEY,
            last_fired_at   TEXT,
            retry_attempt   INTEGER,            -- NULL when no retry is pending
            retry_at        TEXT,
            run_count       INTEGER NOT NULL DEFAULT 0,
            fail_count      INTEGER NOT NULL DEFAULT 0,
            last_run_at     TEXT,
            last_outcome    TEXT
        ) STRICT;

        CREATE TABLE IF NOT EXISTS executions (
            id              TEXT    NOT NULL PRIMARY KEY,
            task_name       TEXT    NOT NULL,
            attempt         INTEGER NOT NULL,
            started_at      TEXT    NOT NULL,
            finished_at     TEXT    NOT NULL,
            exit_code       INTEGER NOT NULL,
            outcome         TEXT    NOT NULL,
            stdout          TEXT    NOT NULL DEFAULT '',
            stderr          TEXT    NOT NULL DEFAULT ''
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_executions_task
            ON executions (task_name, started_at);
        ",
    )?;
    Ok(())
}

/// SQLite-backed definition and history store.
///
/// Timestamps are fixed-width RFC 3339 text (microseconds, `Z`) so that
/// `ORDER BY started_at` sorts chronologically.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DefinitionStore for SqliteStore {
    fn load_all(&self) -> Result<Vec<Task>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT name, trigger, command, enabled, timeout_ms, max_attempts,
                    retry_delay_ms, priority, working_dir, environment,
                    description, tags, owner, notify, created_at, updated_at
             FROM tasks ORDER BY created_at, name",
        )?;
        let tasks = stmt
            .query_map([], task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    fn save(&self, task: &Task) -> Result<()> {
        let environment = serde_json::to_string(&task.environment)?;
        let tags = serde_json::to_string(&task.tags)?;
        let notify = task.notify.as_ref().map(serde_json::to_string).transpose()?;
        let working_dir = task
            .working_dir
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());

        self.conn().execute(
            "INSERT INTO tasks
             (name, trigger, command, enabled, timeout_ms, max_attempts,
              retry_delay_ms, priority, working_dir, environment,
              description, tags, owner, notify, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)
             ON CONFLICT(name) DO UPDATE SET
              trigger=excluded.trigger, command=excluded.command,
              enabled=excluded.enabled, timeout_ms=excluded.timeout_ms,
              max_attempts=excluded.max_attempts,
              retry_delay_ms=excluded.retry_delay_ms,
              priority=excluded.priority, working_dir=excluded.working_dir,
              environment=excluded.environment,
              description=excluded.description, tags=excluded.tags,
              owner=excluded.owner, notify=excluded.notify,
              updated_at=excluded.updated_at",
            params![
                task.name,
                task.trigger,
                task.command,
                task.enabled,
                millis(task.timeout),
                task.retry.max_attempts,
                millis(task.retry.delay),
                task.priority,
                working_dir,
                environment,
                task.description,
                tags,
                task.owner,
                notify,
                ts(task.created_at),
                ts(task.updated_at),
            ],
        )?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM tasks WHERE name = ?1", [name])?;
        tx.execute("DELETE FROM task_state WHERE name = ?1", [name])?;
        tx.commit()?;
        Ok(())
    }

    fn load_states(&self) -> Result<Vec<(String, SchedulingState)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT name, last_fired_at, retry_attempt, retry_at,
                    run_count, fail_count, last_run_at, last_outcome
             FROM task_state",
        )?;
        let states = stmt
            .query_map([], |row| {
                let name: String = row.get(0)?;
                let last_fired_at = opt_ts(row, 1)?;
                let retry_attempt: Option<u32> = row.get(2)?;
                let retry_at = opt_ts(row, 3)?;
                let retry = match (retry_attempt, retry_at) {
                    (Some(attempt), Some(next_attempt_at)) => Some(RetryState {
                        attempt,
                        next_attempt_at,
                    }),
                    _ => None,
                };
                let stats = RunStats {
                    run_count: row.get::<_, i64>(4)?.max(0) as u64,
                    fail_count: row.get::<_, i64>(5)?.max(0) as u64,
                    last_run_at: opt_ts(row, 6)?,
                    last_outcome: row
                        .get::<_, Option<String>>(7)?
                        .map(|raw| raw.parse::<Outcome>())
                        .transpose()
                        .map_err(|e| conversion_error(7, e.into()))?,
                };
                Ok((
                    name,
                    SchedulingState {
                        last_fired_at,
                        running: false,
                        retry,
                        stats,
                    },
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(states)
    }

    fn save_state(&self, name: &str, state: &SchedulingState) -> Result<()> {
        self.conn().execute(
            "INSERT INTO task_state
             (name, last_fired_at, retry_attempt, retry_at,
              run_count, fail_count, last_run_at, last_outcome)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(name) DO UPDATE SET
              last_fired_at=excluded.last_fired_at,
              retry_attempt=excluded.retry_attempt,
              retry_at=excluded.retry_at,
              run_count=excluded.run_count,
              fail_count=excluded.fail_count,
              last_run_at=excluded.last_run_at,
              last_outcome=excluded.last_outcome",
            params![
                name,
                state.last_fired_at.map(ts),
                state.retry.map(|r| r.attempt),
                state.retry.map(|r| ts(r.next_attempt_at)),
                i64::try_from(state.stats.run_count).unwrap_or(i64::MAX),
                i64::try_from(state.stats.fail_count).unwrap_or(i64::MAX),
                state.stats.last_run_at.map(ts),
                state.stats.last_outcome.map(|o| o.to_string()),
            ],
        )?;
        Ok(())
    }
}

impl HistoryStore for SqliteStore {
    fn append(&self, record: &ExecutionRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO executions
             (id, task_name, attempt, started_at, finished_at, exit_code,
              outcome, stdout, stderr)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                record.id,
                record.task_name,
                record.attempt,
                ts(record.started_at),
                ts(record.finished_at),
                record.exit_code,
                record.outcome.to_string(),
                record.stdout,
                record.stderr,
            ],
        )?;
        Ok(())
    }

    fn query(&self, task_name: Option<&str>) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, task_name, attempt, started_at, finished_at, exit_code,
                    outcome, stdout, stderr
             FROM executions
             WHERE ?1 IS NULL OR task_name = ?1
             ORDER BY started_at DESC, attempt DESC",
        )?;
        let records = stmt
            .query_map([task_name], record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn recent(&self, per_task: usize) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, task_name, attempt, started_at, finished_at, exit_code,
                    outcome, stdout, stderr
             FROM (
                SELECT *, ROW_NUMBER() OVER (
                    PARTITION BY task_name ORDER BY started_at DESC, attempt DESC
                ) AS rn
                FROM executions
             )
             WHERE rn <= ?1
             ORDER BY started_at DESC, attempt DESC",
        )?;
        let limit = i64::try_from(per_task).unwrap_or(i64::MAX);
        let records = stmt
            .query_map([limit], record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let outcome: String = row.get(6)?;
    Ok(ExecutionRecord {
        id: row.get(0)?,
        task_name: row.get(1)?,
        attempt: row.get(2)?,
        started_at: req_ts(row, 3)?,
        finished_at: req_ts(row, 4)?,
        exit_code: row.get(5)?,
        outcome: outcome
            .parse::<Outcome>()
            .map_err(|e| conversion_error(6, e.into()))?,
        stdout: row.get(7)?,
        stderr: row.get(8)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let environment: String = row.get(9)?;
    let tags: String = row.get(11)?;
    let notify: Option<String> = row.get(13)?;
    Ok(Task {
        name: row.get(0)?,
        trigger: row.get(1)?,
        command: row.get(2)?,
        enabled: row.get(3)?,
        timeout: Duration::from_millis(row.get::<_, i64>(4)?.max(0) as u64),
        retry: RetryPolicy {
            max_attempts: row.get(5)?,
            delay: Duration::from_millis(row.get::<_, i64>(6)?.max(0) as u64),
        },
        priority: row.get(7)?,
        working_dir: row.get::<_, Option<String>>(8)?.map(PathBuf::from),
        environment: serde_json::from_str(&environment)
            .map_err(|e| conversion_error(9, Box::new(e)))?,
        description: row.get(10)?,
        tags: serde_json::from_str(&tags).map_err(|e| conversion_error(11, Box::new(e)))?,
        owner: row.get(12)?,
        notify: notify
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|e| conversion_error(13, Box::new(e)))?,
        created_at: req_ts(row, 14)?,
        updated_at: req_ts(row, 15)?,
    })
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, Box::new(e)))
}

fn req_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

fn opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| parse_ts(idx, &raw))
        .transpose()
}

fn conversion_error(
    idx: usize,
    err: Box<dyn std::error::Error + Send + Sync + 'static>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err)
}
