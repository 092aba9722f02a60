//! PostgreSQL-backed implementation of the storage contract: the production
//! reference backend. Raw `sqlx::query` (not the macro-checked form) is used
//! throughout so the schema can evolve without a compile-time database
//! connection, matching the rest of the crate's persistence layer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

use crate::model::{Event, EventData, Hook, HookStatus, Run, RunStatus, Step, StepStatus};
use crate::reliability::ClaimLease;

use super::store::{
    Pagination, RunFilter, RunPage, ScheduledWake, StorageContract, StoreError, WakeKind,
};

/// Embedded schema, applied via `sqlx::migrate!` at startup.
pub const MIGRATIONS_PATH: &str = "migrations";

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn parse_status(s: &str) -> RunStatus {
        match s {
            "pending" => RunStatus::Pending,
            "running" => RunStatus::Running,
            "suspended" => RunStatus::Suspended,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            "interrupted" => RunStatus::Interrupted,
            _ => RunStatus::Cancelled,
        }
    }

    fn status_str(status: RunStatus) -> &'static str {
        match status {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Suspended => "suspended",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Interrupted => "interrupted",
            RunStatus::Cancelled => "cancelled",
        }
    }

    fn row_to_run(row: &sqlx::postgres::PgRow) -> Result<Run, StoreError> {
        let tags: Vec<String> = row
            .try_get::<Option<Vec<String>>, _>("tags")
            .map_err(|e| StoreError::Database(e.to_string()))?
            .unwrap_or_default();
        Ok(Run {
            run_id: row.try_get("run_id").map_err(db_err)?,
            workflow_name: row.try_get("workflow_name").map_err(db_err)?,
            status: Self::parse_status(row.try_get::<String, _>("status").map_err(db_err)?.as_str()),
            input_args: row.try_get("input_args").map_err(db_err)?,
            input_kwargs: row.try_get("input_kwargs").map_err(db_err)?,
            result: row.try_get("result").map_err(db_err)?,
            error: row.try_get("error").map_err(db_err)?,
            created_at: row.try_get("created_at").map_err(db_err)?,
            started_at: row.try_get("started_at").map_err(db_err)?,
            completed_at: row.try_get("completed_at").map_err(db_err)?,
            parent_run_id: row.try_get("parent_run_id").map_err(db_err)?,
            nesting_depth: row.try_get::<i32, _>("nesting_depth").map_err(db_err)? as u32,
            idempotency_key: row.try_get("idempotency_key").map_err(db_err)?,
            recovery_attempts: row.try_get::<i32, _>("recovery_attempts").map_err(db_err)? as u32,
            max_recovery_attempts: row
                .try_get::<i32, _>("max_recovery_attempts")
                .map_err(db_err)? as u32,
            max_duration_ms: row.try_get("max_duration_ms").map_err(db_err)?,
            metadata: row.try_get("metadata").map_err(db_err)?,
            tags,
            continued_to_run_id: row.try_get("continued_to_run_id").map_err(db_err)?,
        })
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

#[async_trait]
impl StorageContract for PostgresStore {
    async fn create_run(&self, run: Run) -> Result<Run, StoreError> {
        if let Some(key) = &run.idempotency_key {
            let existing = sqlx::query(
                "SELECT * FROM durable_runs WHERE workflow_name = $1 AND idempotency_key = $2",
            )
            .bind(&run.workflow_name)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
            if let Some(row) = existing {
                return Self::row_to_run(&row);
            }
        }

        sqlx::query(
            "INSERT INTO durable_runs (
                run_id, workflow_name, status, input_args, input_kwargs, result, error,
                created_at, started_at, completed_at, parent_run_id, nesting_depth,
                idempotency_key, recovery_attempts, max_recovery_attempts, max_duration_ms,
                metadata, tags, continued_to_run_id
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19)
            ON CONFLICT (workflow_name, idempotency_key) WHERE idempotency_key IS NOT NULL
            DO NOTHING",
        )
        .bind(run.run_id)
        .bind(&run.workflow_name)
        .bind(Self::status_str(run.status))
        .bind(&run.input_args)
        .bind(&run.input_kwargs)
        .bind(&run.result)
        .bind(&run.error)
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.parent_run_id)
        .bind(run.nesting_depth as i32)
        .bind(&run.idempotency_key)
        .bind(run.recovery_attempts as i32)
        .bind(run.max_recovery_attempts as i32)
        .bind(run.max_duration_ms)
        .bind(&run.metadata)
        .bind(&run.tags)
        .bind(run.continued_to_run_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        self.get_run(run.run_id).await
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Run, StoreError> {
        let row = sqlx::query("SELECT * FROM durable_runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::RunNotFound(run_id))?;
        Self::row_to_run(&row)
    }

    async fn find_run_by_idempotency_key(
        &self,
        workflow_name: &str,
        key: &str,
    ) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM durable_runs WHERE workflow_name = $1 AND idempotency_key = $2",
        )
        .bind(workflow_name)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(Self::row_to_run).transpose()
    }

    async fn update_run_status(
        &self,
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE durable_runs SET status = $1,
                started_at = CASE WHEN $1 = 'running' AND started_at IS NULL THEN $4 ELSE started_at END,
                completed_at = CASE WHEN $1 IN ('completed','failed','cancelled','interrupted') THEN $4 ELSE completed_at END
             WHERE run_id = $2 AND status = $3",
        )
        .bind(Self::status_str(to))
        .bind(run_id)
        .bind(Self::status_str(from))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            let current = self.get_run(run_id).await?;
            return Err(StoreError::InvalidStatusTransition {
                run_id,
                expected: from,
                actual: current.status,
            });
        }
        Ok(())
    }

    async fn set_run_result(
        &self,
        run_id: Uuid,
        result: Option<Value>,
        error: Option<Value>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE durable_runs SET result = $1, error = $2 WHERE run_id = $3")
            .bind(result)
            .bind(error)
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn increment_recovery_attempts(&self, run_id: Uuid) -> Result<u32, StoreError> {
        let row = sqlx::query(
            "UPDATE durable_runs SET recovery_attempts = recovery_attempts + 1
             WHERE run_id = $1 RETURNING recovery_attempts",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::RunNotFound(run_id))?;
        Ok(row.try_get::<i32, _>("recovery_attempts").map_err(db_err)? as u32)
    }

    async fn set_continued_to(&self, run_id: Uuid, successor_run_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE durable_runs SET continued_to_run_id = $2 WHERE run_id = $1")
            .bind(run_id)
            .bind(successor_run_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(run_id));
        }
        Ok(())
    }

    async fn append_events(
        &self,
        run_id: Uuid,
        expected_next_sequence: i32,
        events: Vec<EventData>,
    ) -> Result<i32, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let current_next: i32 = sqlx::query(
            "SELECT COALESCE(MAX(sequence), 0) + 1 AS next_seq
             FROM durable_events WHERE run_id = $1 FOR UPDATE",
        )
        .bind(run_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?
        .try_get("next_seq")
        .map_err(db_err)?;

        if current_next != expected_next_sequence {
            return Err(StoreError::ConcurrencyConflict {
                run_id,
                expected: expected_next_sequence,
                actual: current_next,
            });
        }

        let mut sequence = current_next;
        for data in events {
            let payload = serde_json::to_value(&data).map_err(|e| StoreError::Serialization(e.to_string()))?;
            sqlx::query(
                "INSERT INTO durable_events (event_id, run_id, sequence, event_type, timestamp, data)
                 VALUES ($1,$2,$3,$4,$5,$6)",
            )
            .bind(Uuid::now_v7())
            .bind(run_id)
            .bind(sequence)
            .bind(format!("{:?}", data.event_type()))
            .bind(Utc::now())
            .bind(payload)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            sequence += 1;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(sequence - 1)
    }

    async fn read_events(
        &self,
        run_id: Uuid,
        from_sequence: Option<i32>,
    ) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(
            "SELECT event_id, run_id, sequence, timestamp, data FROM durable_events
             WHERE run_id = $1 AND sequence >= $2 ORDER BY sequence ASC",
        )
        .bind(run_id)
        .bind(from_sequence.unwrap_or(1))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|row| {
                let data_json: Value = row.try_get("data").map_err(db_err)?;
                let data: EventData =
                    serde_json::from_value(data_json).map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Event {
                    event_id: row.try_get("event_id").map_err(db_err)?,
                    run_id: row.try_get("run_id").map_err(db_err)?,
                    sequence: row.try_get("sequence").map_err(db_err)?,
                    timestamp: row.try_get("timestamp").map_err(db_err)?,
                    data,
                })
            })
            .collect()
    }

    async fn upsert_step(&self, step: Step) -> Result<(), StoreError> {
        let status = match step.status {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        };
        let retry_policy = serde_json::to_value(&step.retry_policy).map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            "INSERT INTO durable_steps (
                step_id, run_id, step_name, call_index, status, attempt, retry_policy,
                timeout_ms, result, error, created_at, updated_at
             ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
             ON CONFLICT (step_id) DO UPDATE SET
                status = EXCLUDED.status, attempt = EXCLUDED.attempt,
                result = EXCLUDED.result, error = EXCLUDED.error,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(&step.step_id)
        .bind(step.run_id)
        .bind(&step.step_name)
        .bind(step.call_index as i32)
        .bind(status)
        .bind(step.attempt as i32)
        .bind(&retry_policy)
        .bind(step.timeout_ms.map(|ms| ms as i64))
        .bind(&step.result)
        .bind(&step.error)
        .bind(step.created_at)
        .bind(step.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_step(&self, step_id: &str) -> Result<Option<Step>, StoreError> {
        let row = sqlx::query("SELECT * FROM durable_steps WHERE step_id = $1")
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        let Some(row) = row else { return Ok(None) };
        let status = match row.try_get::<String, _>("status").map_err(db_err)?.as_str() {
            "pending" => StepStatus::Pending,
            "running" => StepStatus::Running,
            "completed" => StepStatus::Completed,
            _ => StepStatus::Failed,
        };
        let retry_policy = serde_json::from_value(row.try_get("retry_policy").map_err(db_err)?)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Some(Step {
            step_id: row.try_get("step_id").map_err(db_err)?,
            run_id: row.try_get("run_id").map_err(db_err)?,
            step_name: row.try_get("step_name").map_err(db_err)?,
            call_index: row.try_get::<i32, _>("call_index").map_err(db_err)? as u32,
            status,
            attempt: row.try_get::<i32, _>("attempt").map_err(db_err)? as u32,
            retry_policy,
            timeout_ms: row.try_get::<Option<i64>, _>("timeout_ms").map_err(db_err)?.map(|ms| ms as u64),
            result: row.try_get("result").map_err(db_err)?,
            error: row.try_get("error").map_err(db_err)?,
            created_at: row.try_get("created_at").map_err(db_err)?,
            updated_at: row.try_get("updated_at").map_err(db_err)?,
        }))
    }

    async fn upsert_hook(&self, hook: Hook) -> Result<(), StoreError> {
        let status = match hook.status {
            HookStatus::Pending => "pending",
            HookStatus::Received => "received",
            HookStatus::Expired => "expired",
            HookStatus::Disposed => "disposed",
        };
        sqlx::query(
            "INSERT INTO durable_hooks (
                hook_id, run_id, name, call_index, schema, status, payload, expires_at, created_at
             ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
             ON CONFLICT (hook_id) DO UPDATE SET
                status = EXCLUDED.status, payload = EXCLUDED.payload",
        )
        .bind(&hook.hook_id)
        .bind(hook.run_id)
        .bind(&hook.name)
        .bind(hook.call_index as i32)
        .bind(&hook.schema)
        .bind(status)
        .bind(&hook.payload)
        .bind(hook.expires_at)
        .bind(hook.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_hook(&self, hook_id: &str) -> Result<Option<Hook>, StoreError> {
        let row = sqlx::query("SELECT * FROM durable_hooks WHERE hook_id = $1")
            .bind(hook_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        let Some(row) = row else { return Ok(None) };
        let status = match row.try_get::<String, _>("status").map_err(db_err)?.as_str() {
            "pending" => HookStatus::Pending,
            "received" => HookStatus::Received,
            "expired" => HookStatus::Expired,
            _ => HookStatus::Disposed,
        };
        Ok(Some(Hook {
            hook_id: row.try_get("hook_id").map_err(db_err)?,
            run_id: row.try_get("run_id").map_err(db_err)?,
            name: row.try_get("name").map_err(db_err)?,
            call_index: row.try_get::<i32, _>("call_index").map_err(db_err)? as u32,
            schema: row.try_get("schema").map_err(db_err)?,
            status,
            payload: row.try_get("payload").map_err(db_err)?,
            expires_at: row.try_get("expires_at").map_err(db_err)?,
            created_at: row.try_get("created_at").map_err(db_err)?,
        }))
    }

    async fn resolve_hook(&self, hook_id: &str, payload: Value) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE durable_hooks SET status = 'received', payload = $1
             WHERE hook_id = $2 AND status = 'pending'",
        )
        .bind(payload)
        .bind(hook_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim_run(
        &self,
        run_id: Uuid,
        worker_id: Uuid,
        ttl: std::time::Duration,
    ) -> Result<ClaimLease, StoreError> {
        let now = Utc::now();
        let lease = ClaimLease::new(worker_id, ttl, now);
        let result = sqlx::query(
            "WITH claimable AS (
                SELECT run_id FROM durable_runs
                WHERE run_id = $1 AND (claim_holder IS NULL OR claim_expires_at <= $3 OR claim_holder = $2)
                FOR UPDATE SKIP LOCKED
             )
             UPDATE durable_runs SET claim_holder = $2, claim_expires_at = $4
             FROM claimable WHERE durable_runs.run_id = claimable.run_id",
        )
        .bind(run_id)
        .bind(worker_id)
        .bind(now)
        .bind(lease.expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyClaimed(run_id));
        }
        Ok(lease)
    }

    async fn renew_claim(
        &self,
        run_id: Uuid,
        worker_id: Uuid,
        ttl: std::time::Duration,
    ) -> Result<ClaimLease, StoreError> {
        let now = Utc::now();
        let lease = ClaimLease::new(worker_id, ttl, now);
        let result = sqlx::query(
            "UPDATE durable_runs SET claim_expires_at = $1
             WHERE run_id = $2 AND claim_holder = $3",
        )
        .bind(lease.expires_at)
        .bind(run_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ClaimNotHeld(run_id));
        }
        Ok(lease)
    }

    async fn release_claim(&self, run_id: Uuid, worker_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE durable_runs SET claim_holder = NULL, claim_expires_at = NULL
             WHERE run_id = $1 AND claim_holder = $2",
        )
        .bind(run_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_expired_claims(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            "SELECT run_id FROM durable_runs
             WHERE claim_holder IS NOT NULL AND claim_expires_at <= $1
               AND status NOT IN ('completed','failed','cancelled','interrupted')",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter()
            .map(|r| r.try_get("run_id").map_err(db_err))
            .collect()
    }

    async fn schedule_wake(&self, wake: ScheduledWake) -> Result<(), StoreError> {
        let kind = match wake.kind {
            WakeKind::SleepElapsed => "sleep_elapsed",
            WakeKind::HookExpiry => "hook_expiry",
            WakeKind::MaxDuration => "max_duration",
        };
        sqlx::query(
            "INSERT INTO durable_wakes (wake_id, run_id, wake_at, kind, subject_id)
             VALUES ($1,$2,$3,$4,$5)",
        )
        .bind(wake.wake_id)
        .bind(wake.run_id)
        .bind(wake.wake_at)
        .bind(kind)
        .bind(&wake.subject_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn pop_due_wakes(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledWake>, StoreError> {
        let rows = sqlx::query(
            "WITH due AS (
                SELECT wake_id FROM durable_wakes WHERE wake_at <= $1
                FOR UPDATE SKIP LOCKED
             )
             DELETE FROM durable_wakes USING due
             WHERE durable_wakes.wake_id = due.wake_id
             RETURNING durable_wakes.wake_id, durable_wakes.run_id, durable_wakes.wake_at,
                       durable_wakes.kind, durable_wakes.subject_id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|row| {
                let kind = match row.try_get::<String, _>("kind").map_err(db_err)?.as_str() {
                    "sleep_elapsed" => WakeKind::SleepElapsed,
                    "hook_expiry" => WakeKind::HookExpiry,
                    _ => WakeKind::MaxDuration,
                };
                Ok(ScheduledWake {
                    wake_id: row.try_get("wake_id").map_err(db_err)?,
                    run_id: row.try_get("run_id").map_err(db_err)?,
                    wake_at: row.try_get("wake_at").map_err(db_err)?,
                    kind,
                    subject_id: row.try_get("subject_id").map_err(db_err)?,
                })
            })
            .collect()
    }

    async fn cancel_wakes_for_run(&self, run_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM durable_wakes WHERE run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_runs(&self, filter: RunFilter, pagination: Pagination) -> Result<RunPage, StoreError> {
        let mut sql = String::from("SELECT * FROM durable_runs WHERE 1=1");
        if filter.workflow_name.is_some() {
            sql.push_str(" AND workflow_name = $1");
        }
        sql.push_str(" ORDER BY created_at ASC OFFSET $2 LIMIT $3");

        let mut query = sqlx::query(&sql);
        if let Some(name) = &filter.workflow_name {
            query = query.bind(name);
        }
        query = query
            .bind(pagination.cursor.unwrap_or(0))
            .bind(pagination.limit as i64 + 1);

        let mut rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        let has_more = rows.len() as u32 > pagination.limit;
        if has_more {
            rows.truncate(pagination.limit as usize);
        }
        let runs = rows.iter().map(Self::row_to_run).collect::<Result<Vec<_>, _>>()?;
        let next_cursor = if has_more {
            Some(pagination.cursor.unwrap_or(0) + pagination.limit as i64)
        } else {
            None
        };
        Ok(RunPage { runs, next_cursor })
    }

    async fn list_outstanding_children(&self, run_id: Uuid) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM durable_runs WHERE parent_run_id = $1
             AND status NOT IN ('completed','failed','cancelled','interrupted')",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(Self::row_to_run).collect()
    }
}
