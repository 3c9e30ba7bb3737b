//! PostgreSQL-backed [`StateStore`]: a connection-pooled implementation
//! using runtime `sqlx::query` (not the `query!` macro, so this crate
//! compiles without a live database to check queries against at build
//! time), against two tables, `workflow_instances` and
//! `workflow_step_executions`. The `version` column drives the
//! optimistic-concurrency `UPDATE ... WHERE version = $expected` statement,
//! a compare-and-swap idiom applied to this crate's simpler
//! (non-event-sourced) instance model.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::model::{Context, Instance, InstanceStatus, StepExecutionRecord, StepStatus};

use super::store::{StateStore, StoreError};

/// PostgreSQL implementation of [`StateStore`].
///
/// # Example
///
/// ```ignore
/// use workflow_engine::PostgresStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/workflow_engine").await?;
/// let store = PostgresStore::new(pool);
/// store.run_migrations().await?;
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply this crate's embedded migrations (`migrations/`). Idempotent.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

fn instance_status_str(status: InstanceStatus) -> &'static str {
    match status {
        InstanceStatus::Pending => "pending",
        InstanceStatus::Running => "running",
        InstanceStatus::Paused => "paused",
        InstanceStatus::Completed => "completed",
        InstanceStatus::Failed => "failed",
        InstanceStatus::Cancelled => "cancelled",
        InstanceStatus::Compensating => "compensating",
        InstanceStatus::Compensated => "compensated",
    }
}

fn parse_instance_status(s: &str) -> Result<InstanceStatus, StoreError> {
    Ok(match s {
        "pending" => InstanceStatus::Pending,
        "running" => InstanceStatus::Running,
        "paused" => InstanceStatus::Paused,
        "completed" => InstanceStatus::Completed,
        "failed" => InstanceStatus::Failed,
        "cancelled" => InstanceStatus::Cancelled,
        "compensating" => InstanceStatus::Compensating,
        "compensated" => InstanceStatus::Compensated,
        other => return Err(StoreError::Database(format!("unknown instance status: {other}"))),
    })
}

fn step_status_str(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Pending => "pending",
        StepStatus::Running => "running",
        StepStatus::Succeeded => "succeeded",
        StepStatus::Failed => "failed",
        StepStatus::TimedOut => "timed_out",
        StepStatus::Skipped => "skipped",
        StepStatus::Compensating => "compensating",
        StepStatus::Compensated => "compensated",
    }
}

fn parse_step_status(s: &str) -> Result<StepStatus, StoreError> {
    Ok(match s {
        "pending" => StepStatus::Pending,
        "running" => StepStatus::Running,
        "succeeded" => StepStatus::Succeeded,
        "failed" => StepStatus::Failed,
        "timed_out" => StepStatus::TimedOut,
        "skipped" => StepStatus::Skipped,
        "compensating" => StepStatus::Compensating,
        "compensated" => StepStatus::Compensated,
        other => return Err(StoreError::Database(format!("unknown step status: {other}"))),
    })
}

fn instance_from_row(row: &sqlx::postgres::PgRow) -> Result<Instance, StoreError> {
    let status_str: String = row.try_get("status").map_err(db_err)?;
    let context_json: Value = row.try_get("context").map_err(db_err)?;
    let context: Context = serde_json::from_value(context_json).map_err(ser_err)?;
    let step_ids_json: Value = row.try_get("step_ids").map_err(db_err)?;
    let step_ids: Vec<String> = serde_json::from_value(step_ids_json).map_err(ser_err)?;

    Ok(Instance {
        id: row.try_get("id").map_err(db_err)?,
        definition_name: row.try_get("definition_name").map_err(db_err)?,
        step_ids,
        status: parse_instance_status(&status_str)?,
        context,
        version: row.try_get("version").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        finished_at: row.try_get("finished_at").map_err(db_err)?,
        cancel_requested: row.try_get("cancel_requested").map_err(db_err)?,
        error: row.try_get("error").map_err(db_err)?,
    })
}

fn step_execution_from_row(row: &sqlx::postgres::PgRow) -> Result<StepExecutionRecord, StoreError> {
    let status_str: String = row.try_get("status").map_err(db_err)?;
    let input: Value = row.try_get("input").map_err(db_err)?;
    Ok(StepExecutionRecord {
        id: row.try_get("id").map_err(db_err)?,
        instance_id: row.try_get("instance_id").map_err(db_err)?,
        step_id: row.try_get("step_id").map_err(db_err)?,
        status: parse_step_status(&status_str)?,
        attempt: row.try_get::<i32, _>("attempt").map_err(db_err)? as u32,
        input,
        output: row.try_get("output").map_err(db_err)?,
        error: row.try_get("error").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        finished_at: row.try_get("finished_at").map_err(db_err)?,
    })
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn ser_err(e: serde_json::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

#[async_trait]
impl StateStore for PostgresStore {
    #[instrument(skip(self, instance))]
    async fn create_instance(&self, instance: Instance) -> Result<(), StoreError> {
        let context_json = serde_json::to_value(&instance.context).map_err(ser_err)?;
        let step_ids_json = serde_json::to_value(&instance.step_ids).map_err(ser_err)?;

        sqlx::query(
            r#"
            INSERT INTO workflow_instances
                (id, definition_name, step_ids, status, context, version, created_at, updated_at,
                 started_at, finished_at, cancel_requested, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(instance.id)
        .bind(&instance.definition_name)
        .bind(&step_ids_json)
        .bind(instance_status_str(instance.status))
        .bind(&context_json)
        .bind(instance.version)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .bind(instance.started_at)
        .bind(instance.finished_at)
        .bind(instance.cancel_requested)
        .bind(&instance.error)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(error = %e, "failed to create instance");
            db_err(e)
        })?;

        debug!(instance_id = %instance.id, "created instance");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_instance(&self, id: Uuid) -> Result<Option<Instance>, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_instances WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(instance_from_row).transpose()
    }

    #[instrument(skip(self, instance))]
    async fn save_instance(&self, instance: Instance) -> Result<(), StoreError> {
        let context_json = serde_json::to_value(&instance.context).map_err(ser_err)?;
        let expected_prior_version = instance.version - 1;

        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = $1, context = $2, version = $3, updated_at = $4,
                started_at = $5, finished_at = $6, cancel_requested = $7, error = $8
            WHERE id = $9 AND version = $10
            "#,
        )
        .bind(instance_status_str(instance.status))
        .bind(&context_json)
        .bind(instance.version)
        .bind(instance.updated_at)
        .bind(instance.started_at)
        .bind(instance.finished_at)
        .bind(instance.cancel_requested)
        .bind(&instance.error)
        .bind(instance.id)
        .bind(expected_prior_version)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            let current = self
                .load_instance(instance.id)
                .await?
                .ok_or(StoreError::InstanceNotFound(instance.id))?;
            return Err(StoreError::ConcurrencyConflict {
                id: instance.id,
                expected: expected_prior_version,
                actual: current.version,
            });
        }

        Ok(())
    }

    #[instrument(skip(self, record))]
    async fn append_step_execution(&self, record: StepExecutionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_step_executions
                (id, instance_id, step_id, status, attempt, input, output, error,
                 started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id)
        .bind(record.instance_id)
        .bind(&record.step_id)
        .bind(step_status_str(record.status))
        .bind(record.attempt as i32)
        .bind(&record.input)
        .bind(&record.output)
        .bind(&record.error)
        .bind(record.started_at)
        .bind(record.finished_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self, record))]
    async fn update_step_execution(&self, record: StepExecutionRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_step_executions
            SET status = $1, output = $2, error = $3, finished_at = $4
            WHERE id = $5
            "#,
        )
        .bind(step_status_str(record.status))
        .bind(&record.output)
        .bind(&record.error)
        .bind(record.finished_at)
        .bind(record.id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::StepExecutionNotFound(record.id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_step_executions(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<StepExecutionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM workflow_step_executions
            WHERE instance_id = $1
            ORDER BY step_id, attempt
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(step_execution_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn list_by_status(&self, status: InstanceStatus) -> Result<Vec<Instance>, StoreError> {
        let rows = sqlx::query("SELECT * FROM workflow_instances WHERE status = $1")
            .bind(instance_status_str(status))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter().map(instance_from_row).collect()
    }
}
