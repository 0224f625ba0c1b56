//! SQLite workflow journal implementation.
//!
//! Implements `WorkflowJournal` from `waypoint-core` using sqlx with split
//! read/write pools. The definition snapshot, arguments, context and result
//! are stored as JSON text; step results live in their own table keyed by
//! `(workflow_id, step_index)`.
//!
//! Every state-machine mutation is a single guarded statement on the
//! single-connection writer pool (`UPDATE ... WHERE <guard> RETURNING`), so
//! the guard and the write happen atomically.
//!
//! Driver lease expiries are stored as fixed-width UTC timestamps so the
//! lease guard can compare them as text.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use uuid::Uuid;
use waypoint_core::repository::workflow::{
    CancelOutcome, StepBoundary, WorkflowJournal, lease_deadline,
};
use waypoint_types::error::RepositoryError;
use waypoint_types::workflow::{
    DeliveryState, HandlerRef, StepOutcome, StepResult, WorkflowInstance, WorkflowResult,
    WorkflowStatus,
};

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowJournal`.
#[derive(Clone)]
pub struct SqliteWorkflowJournal {
    pool: DatabasePool,
}

impl SqliteWorkflowJournal {
    /// Create a new journal backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    async fn load_step_results(&self, id: &str) -> Result<Vec<StepResult>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT step_index, step_name, outcome, recorded_at FROM workflow_step_results WHERE workflow_id = ? ORDER BY step_index ASC",
        )
        .bind(id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = StepResultRow::from_row(row).map_err(query_error)?;
            results.push(r.into_step_result()?);
        }
        Ok(results)
    }

    async fn hydrate(
        &self,
        rows: Vec<sqlx::sqlite::SqliteRow>,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut instances = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = InstanceRow::from_row(row).map_err(query_error)?;
            let step_results = self.load_step_results(&r.id).await?;
            instances.push(r.into_instance(step_results)?);
        }
        Ok(instances)
    }

    /// Current `(status, cancel_requested)` of a record, used to explain why
    /// a guarded statement matched no row.
    async fn current_state(&self, id: &Uuid) -> Result<Option<(WorkflowStatus, bool)>, RepositoryError> {
        let row = sqlx::query("SELECT status, cancel_requested FROM workflow_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let status: String = row.try_get("status").map_err(query_error)?;
                let cancel_requested: bool = row.try_get("cancel_requested").map_err(query_error)?;
                Ok(Some((parse_status(&status)?, cancel_requested)))
            }
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

const INSTANCE_COLUMNS: &str = "id, definition, args, current_step_index, status, cancel_requested, on_complete, context, result, delivery, callback_error, lease_owner, lease_expires_at, created_at, updated_at";

struct InstanceRow {
    id: String,
    definition: String,
    args: String,
    current_step_index: i64,
    status: String,
    cancel_requested: bool,
    on_complete: String,
    context: String,
    result: Option<String>,
    delivery: String,
    callback_error: Option<String>,
    lease_owner: Option<String>,
    lease_expires_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            definition: row.try_get("definition")?,
            args: row.try_get("args")?,
            current_step_index: row.try_get("current_step_index")?,
            status: row.try_get("status")?,
            cancel_requested: row.try_get("cancel_requested")?,
            on_complete: row.try_get("on_complete")?,
            context: row.try_get("context")?,
            result: row.try_get("result")?,
            delivery: row.try_get("delivery")?,
            callback_error: row.try_get("callback_error")?,
            lease_owner: row.try_get("lease_owner")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_instance(
        self,
        step_results: Vec<StepResult>,
    ) -> Result<WorkflowInstance, RepositoryError> {
        let definition = serde_json::from_str(&self.definition)
            .map_err(|e| RepositoryError::Query(format!("invalid definition JSON: {e}")))?;
        let args = serde_json::from_str(&self.args)
            .map_err(|e| RepositoryError::Query(format!("invalid args JSON: {e}")))?;
        let context = serde_json::from_str(&self.context)
            .map_err(|e| RepositoryError::Query(format!("invalid context JSON: {e}")))?;
        let result = self
            .result
            .as_deref()
            .map(|s| {
                serde_json::from_str::<WorkflowResult>(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid result JSON: {e}")))
            })
            .transpose()?;
        let delivery = self
            .delivery
            .parse::<DeliveryState>()
            .map_err(RepositoryError::Query)?;
        let lease_expires_at = self
            .lease_expires_at
            .as_deref()
            .map(parse_datetime)
            .transpose()?;

        Ok(WorkflowInstance {
            id: parse_uuid(&self.id)?,
            definition,
            args,
            current_step_index: self.current_step_index as u32,
            status: parse_status(&self.status)?,
            step_results,
            cancel_requested: self.cancel_requested,
            on_complete: HandlerRef::new(self.on_complete),
            context,
            result,
            delivery,
            callback_error: self.callback_error,
            lease_owner: self.lease_owner,
            lease_expires_at,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct StepResultRow {
    step_index: i64,
    step_name: String,
    outcome: String,
    recorded_at: String,
}

impl StepResultRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            step_index: row.try_get("step_index")?,
            step_name: row.try_get("step_name")?,
            outcome: row.try_get("outcome")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }

    fn into_step_result(self) -> Result<StepResult, RepositoryError> {
        let outcome: StepOutcome = serde_json::from_str(&self.outcome)
            .map_err(|e| RepositoryError::Query(format!("invalid step outcome JSON: {e}")))?;

        Ok(StepResult {
            index: self.step_index as u32,
            step_name: self.step_name,
            outcome,
            recorded_at: parse_datetime(&self.recorded_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize: {e}")))
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_status(s: &str) -> Result<WorkflowStatus, RepositoryError> {
    s.parse::<WorkflowStatus>().map_err(RepositoryError::Query)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// `2026-01-01T00:00:00.000000Z`: same width for every instant, so text
/// order is time order.
fn format_lease_time(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// SQL list of statuses that may move to `target`, e.g. `'running', 'cancelling'`.
fn source_statuses(target: WorkflowStatus) -> String {
    [
        WorkflowStatus::Pending,
        WorkflowStatus::Running,
        WorkflowStatus::Cancelling,
        WorkflowStatus::Completed,
        WorkflowStatus::Failed,
        WorkflowStatus::Cancelled,
    ]
    .into_iter()
    .filter(|s| s.can_transition_to(target))
    .map(|s| format!("'{}'", s.as_str()))
    .collect::<Vec<_>>()
    .join(", ")
}

// ---------------------------------------------------------------------------
// WorkflowJournal impl
// ---------------------------------------------------------------------------

impl WorkflowJournal for SqliteWorkflowJournal {
    async fn create(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let result_json = instance.result.as_ref().map(to_json).transpose()?;

        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        sqlx::query(
            r#"INSERT INTO workflow_instances
               (id, workflow_name, definition, args, current_step_index, status, cancel_requested,
                on_complete, context, result, delivery, callback_error, lease_owner, lease_expires_at,
                created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(instance.id.to_string())
        .bind(&instance.definition.name)
        .bind(to_json(&instance.definition)?)
        .bind(to_json(&instance.args)?)
        .bind(instance.current_step_index as i64)
        .bind(instance.status.as_str())
        .bind(instance.cancel_requested)
        .bind(instance.on_complete.as_str())
        .bind(to_json(&instance.context)?)
        .bind(&result_json)
        .bind(instance.delivery.as_str())
        .bind(&instance.callback_error)
        .bind(&instance.lease_owner)
        .bind(instance.lease_expires_at.as_ref().map(format_lease_time))
        .bind(format_datetime(&instance.created_at))
        .bind(format_datetime(&instance.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("workflow {} already exists", instance.id))
            }
            other => query_error(other),
        })?;

        for result in &instance.step_results {
            sqlx::query(
                "INSERT INTO workflow_step_results (workflow_id, step_index, step_name, outcome, recorded_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(instance.id.to_string())
            .bind(result.index as i64)
            .bind(&result.step_name)
            .bind(to_json(&result.outcome)?)
            .bind(format_datetime(&result.recorded_at))
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
        }

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => Ok(self.hydrate(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn list(&self, limit: u32) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances ORDER BY created_at DESC, id DESC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        self.hydrate(rows).await
    }

    async fn list_unfinished(&self) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances
             WHERE status IN ('pending', 'running', 'cancelling') OR delivery = 'undelivered'
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        self.hydrate(rows).await
    }

    async fn delete(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        // Step results go with it (ON DELETE CASCADE).
        let result = sqlx::query("DELETE FROM workflow_instances WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn begin_step(&self, id: &Uuid, index: u32) -> Result<StepBoundary, RepositoryError> {
        let row = sqlx::query(
            r#"UPDATE workflow_instances
               SET current_step_index = ?,
                   status = CASE WHEN status = 'cancelling' THEN 'cancelling' ELSE 'running' END,
                   updated_at = ?
               WHERE id = ?
                 AND status IN ('pending', 'running', 'cancelling')
                 AND current_step_index <= ?
               RETURNING status, cancel_requested"#,
        )
        .bind(index as i64)
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .bind(index as i64)
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if let Some(row) = row {
            let status: String = row.try_get("status").map_err(query_error)?;
            let cancel_requested: bool = row.try_get("cancel_requested").map_err(query_error)?;
            return Ok(StepBoundary {
                status: parse_status(&status)?,
                cancel_requested,
            });
        }

        match self.current_state(id).await? {
            None => Err(RepositoryError::NotFound),
            Some((status, _)) if status.is_terminal() => Err(RepositoryError::Conflict(format!(
                "workflow {id} is already {status}"
            ))),
            Some(_) => Err(RepositoryError::Conflict(format!(
                "step index cannot move backward to {index}"
            ))),
        }
    }

    async fn append_step_result(
        &self,
        id: &Uuid,
        result: &StepResult,
    ) -> Result<(), RepositoryError> {
        let id_str = id.to_string();
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let inserted = sqlx::query(
            r#"INSERT INTO workflow_step_results (workflow_id, step_index, step_name, outcome, recorded_at)
               SELECT ?, ?, ?, ?, ?
               WHERE EXISTS (SELECT 1 FROM workflow_instances WHERE id = ?)
                 AND (SELECT COUNT(*) FROM workflow_step_results WHERE workflow_id = ?) = ?"#,
        )
        .bind(&id_str)
        .bind(result.index as i64)
        .bind(&result.step_name)
        .bind(to_json(&result.outcome)?)
        .bind(format_datetime(&result.recorded_at))
        .bind(&id_str)
        .bind(&id_str)
        .bind(result.index as i64)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        if inserted.rows_affected() == 0 {
            let exists: Option<(i64,)> = sqlx::query_as(
                "SELECT (SELECT COUNT(*) FROM workflow_step_results WHERE workflow_id = ?) FROM workflow_instances WHERE id = ?",
            )
            .bind(&id_str)
            .bind(&id_str)
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_error)?;

            return match exists {
                None => Err(RepositoryError::NotFound),
                Some((count,)) => Err(RepositoryError::Conflict(format!(
                    "expected step result {count}, got {}",
                    result.index
                ))),
            };
        }

        sqlx::query("UPDATE workflow_instances SET updated_at = ? WHERE id = ?")
            .bind(format_datetime(&Utc::now()))
            .bind(&id_str)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn finish(
        &self,
        id: &Uuid,
        status: WorkflowStatus,
        result: &WorkflowResult,
    ) -> Result<(), RepositoryError> {
        if !status.is_terminal() {
            return Err(RepositoryError::Conflict(format!(
                "{status} is not a terminal status"
            )));
        }

        let sql = format!(
            "UPDATE workflow_instances SET status = ?, result = ?, updated_at = ? WHERE id = ? AND status IN ({})",
            source_statuses(status)
        );
        let updated = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(to_json(result)?)
            .bind(format_datetime(&Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        if updated.rows_affected() > 0 {
            return Ok(());
        }

        match self.current_state(id).await? {
            None => Err(RepositoryError::NotFound),
            Some((current, _)) => Err(RepositoryError::Conflict(format!(
                "cannot move workflow {id} from {current} to {status}"
            ))),
        }
    }

    async fn request_cancel(&self, id: &Uuid) -> Result<CancelOutcome, RepositoryError> {
        let row = sqlx::query(
            r#"UPDATE workflow_instances
               SET cancel_requested = 1,
                   status = CASE WHEN status = 'running' THEN 'cancelling' ELSE status END,
                   updated_at = ?
               WHERE id = ?
                 AND cancel_requested = 0
                 AND status IN ('pending', 'running', 'cancelling')
               RETURNING id"#,
        )
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if row.is_some() {
            return Ok(CancelOutcome::Recorded);
        }

        Ok(match self.current_state(id).await? {
            None => CancelOutcome::NotFound,
            Some((status, _)) if status.is_terminal() => CancelOutcome::AlreadyTerminal,
            Some(_) => CancelOutcome::AlreadyRequested,
        })
    }

    async fn claim_delivery(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let updated = sqlx::query(
            r#"UPDATE workflow_instances
               SET delivery = 'dispatching', updated_at = ?
               WHERE id = ?
                 AND delivery = 'undelivered'
                 AND status IN ('completed', 'failed', 'cancelled')"#,
        )
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(updated.rows_affected() > 0)
    }

    async fn record_callback_failure(&self, id: &Uuid, error: &str) -> Result<(), RepositoryError> {
        let updated = sqlx::query(
            "UPDATE workflow_instances SET delivery = 'callback_failed', callback_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if updated.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn claim_driver(
        &self,
        id: &Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, RepositoryError> {
        let now = Utc::now();
        let expires_at = lease_deadline(now, ttl)?;

        let updated = sqlx::query(
            r#"UPDATE workflow_instances
               SET lease_owner = ?, lease_expires_at = ?
               WHERE id = ?
                 AND (lease_owner IS NULL
                      OR lease_owner = ?
                      OR lease_expires_at IS NULL
                      OR lease_expires_at <= ?)"#,
        )
        .bind(owner)
        .bind(format_lease_time(&expires_at))
        .bind(id.to_string())
        .bind(owner)
        .bind(format_lease_time(&now))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if updated.rows_affected() > 0 {
            return Ok(true);
        }
        match self.current_state(id).await? {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn release_driver(&self, id: &Uuid, owner: &str) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE workflow_instances SET lease_owner = NULL, lease_expires_at = NULL WHERE id = ? AND lease_owner = ?",
        )
        .bind(id.to_string())
        .bind(owner)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
