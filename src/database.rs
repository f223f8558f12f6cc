// SQLite implementation of the task store

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{migrate::MigrateDatabase, Row, SqliteConnection, SqlitePool};
use std::str::FromStr;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::tasks::{
    validate_traces, ClaimOutcome, ClaimToken, Run, RunStatus, StepVars, Task, TaskError,
    TaskState, TaskStore,
};
use crate::trace::TraceRecord;

/// Task store backed by a SQLite pool
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Open the database, creating it and running migrations when asked to
    pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<Self> {
        if !sqlx::Sqlite::database_exists(&config.url).await? {
            info!("Creating database at {}", config.url);
            sqlx::Sqlite::create_database(&config.url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;

        if config.auto_migrate {
            info!("Running database migrations...");
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("Database migrations completed");
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close database connections gracefully
    pub async fn shutdown(&self) {
        info!("Shutting down database connections...");
        self.pool.close().await;
    }

    async fn stale_or_missing(&self, task: &Task, token: &ClaimToken) -> Result<(), TaskError> {
        if !self.task_exists(&task.id).await? {
            return Err(TaskError::NotFound(task.id.clone()));
        }
        Err(TaskError::StaleClaim {
            task_id: task.id.clone(),
            token: token.to_string(),
        })
    }

    async fn task_exists(&self, task_id: &str) -> Result<bool, TaskError> {
        let row = sqlx::query("SELECT 1 FROM tasks WHERE id = ?1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

// Fixed-width UTC text keeps lexicographic order equal to time order.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(text: &str) -> Result<DateTime<Utc>, TaskError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TaskError::Store(anyhow::anyhow!("bad timestamp '{text}': {e}")))
}

fn parse_opt_ts(text: Option<String>) -> Result<Option<DateTime<Utc>>, TaskError> {
    text.as_deref().map(parse_ts).transpose()
}

fn parse_enum<T: FromStr<Err = String>>(text: &str) -> Result<T, TaskError> {
    T::from_str(text).map_err(|e| TaskError::Store(anyhow::anyhow!(e)))
}

fn task_from_row(row: &SqliteRow) -> Result<Task, TaskError> {
    let step_vars: String = row.try_get("step_vars_json")?;
    let lock_expires_at: Option<i64> = row.try_get("lock_expires_at")?;
    Ok(Task {
        id: row.try_get("id")?,
        board_id: row.try_get("board_id")?,
        external_task_id: row.try_get("external_task_id")?,
        workflow_id: row.try_get("workflow_id")?,
        state: parse_enum(&row.try_get::<String, _>("state")?)?,
        current_step_id: row.try_get("current_step_id")?,
        step_vars: StepVars::from_json(&step_vars)?,
        waiting_since: parse_opt_ts(row.try_get("waiting_since")?)?,
        lock_token: row.try_get("lock_token")?,
        lock_expires_at: lock_expires_at.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        last_error: row.try_get("last_error")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

async fn update_task(conn: &mut SqliteConnection, task: &Task, token: &ClaimToken) -> Result<bool, TaskError> {
    let result = sqlx::query(
        r#"
        UPDATE tasks SET state = ?1, current_step_id = ?2, step_vars_json = ?3,
                         waiting_since = ?4, last_error = ?5, updated_at = ?6
        WHERE id = ?7 AND lock_token = ?8
        "#,
    )
    .bind(task.state.as_str())
    .bind(&task.current_step_id)
    .bind(task.step_vars.to_json()?)
    .bind(task.waiting_since.map(ts))
    .bind(&task.last_error)
    .bind(ts(task.updated_at))
    .bind(&task.id)
    .bind(token.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

async fn upsert_run(conn: &mut SqliteConnection, run: &Run) -> Result<(), TaskError> {
    sqlx::query(
        r#"
        INSERT INTO runs (id, task_id, workflow_id, status, current_state_id, started_at, ended_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            current_state_id = excluded.current_state_id,
            ended_at = excluded.ended_at
        "#,
    )
    .bind(&run.id)
    .bind(&run.task_id)
    .bind(&run.workflow_id)
    .bind(run.status.as_str())
    .bind(&run.current_state_id)
    .bind(ts(run.started_at))
    .bind(run.ended_at.map(ts))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_traces(conn: &mut SqliteConnection, traces: &[TraceRecord]) -> Result<(), TaskError> {
    for trace in traces {
        sqlx::query(
            r#"
            INSERT INTO traces (id, run_id, tick_id, task_id, type, timestamp, record_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&trace.id)
        .bind(&trace.run_id)
        .bind(&trace.tick_id)
        .bind(&trace.task_id)
        .bind(trace.trace_type.as_str())
        .bind(ts(trace.timestamp))
        .bind(serde_json::to_string(trace)?)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

fn run_from_row(row: &SqliteRow) -> Result<Run, TaskError> {
    Ok(Run {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        workflow_id: row.try_get("workflow_id")?,
        status: parse_enum::<RunStatus>(&row.try_get::<String, _>("status")?)?,
        current_state_id: row.try_get("current_state_id")?,
        started_at: parse_ts(&row.try_get::<String, _>("started_at")?)?,
        ended_at: parse_opt_ts(row.try_get("ended_at")?)?,
    })
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert_task(&self, task: &Task) -> Result<(), TaskError> {
        if self.task_exists(&task.id).await? {
            return Err(TaskError::AlreadyExists(task.id.clone()));
        }
        sqlx::query(
            r#"
            INSERT INTO tasks (id, board_id, external_task_id, workflow_id, state, current_step_id,
                               step_vars_json, waiting_since, lock_token, lock_expires_at, last_error,
                               created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(&task.id)
        .bind(&task.board_id)
        .bind(&task.external_task_id)
        .bind(&task.workflow_id)
        .bind(task.state.as_str())
        .bind(&task.current_step_id)
        .bind(task.step_vars.to_json()?)
        .bind(task.waiting_since.map(ts))
        .bind(&task.lock_token)
        .bind(task.lock_expires_at.map(|t| t.timestamp_millis()))
        .bind(&task.last_error)
        .bind(ts(task.created_at))
        .bind(ts(task.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_task(&self, task_id: &str) -> Result<Task, TaskError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        task_from_row(&row)
    }

    async fn claim(
        &self,
        task_id: &str,
        token: &ClaimToken,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<ClaimOutcome, TaskError> {
        let expires_at = now + lease;
        let result = sqlx::query(
            r#"
            UPDATE tasks SET lock_token = ?1, lock_expires_at = ?2
            WHERE id = ?3
              AND state NOT IN ('done', 'blocked', 'failed')
              AND (lock_token IS NULL OR (lock_expires_at IS NOT NULL AND lock_expires_at <= ?4))
            "#,
        )
        .bind(token.as_str())
        .bind(expires_at.timestamp_millis())
        .bind(task_id)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(ClaimOutcome::Claimed {
                token: token.as_str().to_string(),
                expires_at,
            });
        }

        let task = self.load_task(task_id).await?;
        Ok(ClaimOutcome::Conflict {
            holder: task.lock_token.clone().filter(|_| task.is_locked_at(now)),
            state: task.state,
        })
    }

    async fn release(&self, task_id: &str, token: &ClaimToken) -> Result<bool, TaskError> {
        let result = sqlx::query(
            "UPDATE tasks SET lock_token = NULL, lock_expires_at = NULL WHERE id = ?1 AND lock_token = ?2",
        )
        .bind(task_id)
        .bind(token.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn save_task(&self, task: &Task, token: &ClaimToken) -> Result<(), TaskError> {
        let mut conn = self.pool.acquire().await?;
        if update_task(&mut *conn, task, token).await? {
            return Ok(());
        }
        self.stale_or_missing(task, token).await
    }

    async fn load_active_run(&self, task_id: &str) -> Result<Option<Run>, TaskError> {
        let row = sqlx::query("SELECT * FROM runs WHERE task_id = ?1 AND status = 'running'")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn save_run(&self, run: &Run) -> Result<(), TaskError> {
        let mut conn = self.pool.acquire().await?;
        upsert_run(&mut *conn, run).await
    }

    async fn append_traces(&self, traces: &[TraceRecord]) -> Result<(), TaskError> {
        validate_traces(traces)?;

        let mut tx = self.pool.begin().await?;
        insert_traces(&mut *tx, traces).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn commit_tick(
        &self,
        task: &Task,
        run: &Run,
        traces: &[TraceRecord],
        token: &ClaimToken,
    ) -> Result<(), TaskError> {
        validate_traces(traces)?;

        // the claim-guarded task update goes first; a lost claim rolls everything back
        let mut tx = self.pool.begin().await?;
        if !update_task(&mut *tx, task, token).await? {
            tx.rollback().await?;
            return self.stale_or_missing(task, token).await;
        }
        upsert_run(&mut *tx, run).await?;
        insert_traces(&mut *tx, traces).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_traces(&self, run_id: &str) -> Result<Vec<TraceRecord>, TaskError> {
        let rows = sqlx::query("SELECT record_json FROM traces WHERE run_id = ?1 ORDER BY timestamp, id")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<TraceRecord, TaskError> {
                let json: String = row.try_get("record_json")?;
                Ok(serde_json::from_str(&json)?)
            })
            .collect()
    }
}
