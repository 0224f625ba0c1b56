//! Workflow journal trait definition.
//!
//! Defines the storage interface for workflow instances and their step
//! results. The infrastructure layer (waypoint-infra) implements this trait
//! with SQLite persistence; [`super::memory::MemoryJournal`] is the
//! in-process implementation.
//!
//! Every mutating method is a single atomic read-modify-write of one
//! instance record. Callers never read a record, change it, and write it
//! back, so a cancellation flag set concurrently with a step boundary can
//! never be lost.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;
use waypoint_types::error::RepositoryError;
use waypoint_types::workflow::{StepResult, WorkflowInstance, WorkflowResult, WorkflowStatus};

/// State observed while crossing a step boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepBoundary {
    /// Status after the boundary was recorded (`Running` or `Cancelling`).
    pub status: WorkflowStatus,
    /// Whether cancellation intent had been recorded at that moment.
    pub cancel_requested: bool,
}

/// Result of recording cancellation intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Intent recorded for the first time.
    Recorded,
    /// Intent was already recorded; nothing changed.
    AlreadyRequested,
    /// The workflow already reached a terminal status; nothing changed.
    AlreadyTerminal,
    /// No record exists (never started or already cleaned up).
    NotFound,
}

/// Expiry of a driver lease taken at `now` for `ttl`.
pub fn lease_deadline(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, RepositoryError> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| RepositoryError::Query(format!("lease ttl out of range: {ttl:?}")))
}

/// Repository trait for workflow instance persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowJournal: Send + Sync {
    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    /// Persist a new instance record.
    fn create(
        &self,
        instance: &WorkflowInstance,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Load an instance with its step results.
    fn get(
        &self,
        id: &Uuid,
    ) -> impl Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// Most recently created instances first.
    fn list(
        &self,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    /// Instances that need a driver after a restart, oldest first: every
    /// non-terminal instance plus terminal instances whose completion was
    /// never claimed.
    fn list_unfinished(
        &self,
    ) -> impl Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    /// Delete an instance and its step results. Returns `true` if it existed.
    fn delete(&self, id: &Uuid) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    /// Record that the driver is at the boundary before step `index`.
    ///
    /// Sets `current_step_index` and moves `Pending`/`Running` to `Running`
    /// (`Cancelling` is kept), returning the cancellation flag read in the
    /// same operation. Fails with `Conflict` if the index would move
    /// backward or the instance is already terminal.
    fn begin_step(
        &self,
        id: &Uuid,
        index: u32,
    ) -> impl Future<Output = Result<StepBoundary, RepositoryError>> + Send;

    /// Append a step result. Fails with `Conflict` unless `result.index` is
    /// exactly the next index in the log.
    fn append_step_result(
        &self,
        id: &Uuid,
        result: &StepResult,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Move to a terminal status and store the classification. Fails with
    /// `Conflict` if the transition is not allowed.
    fn finish(
        &self,
        id: &Uuid,
        status: WorkflowStatus,
        result: &WorkflowResult,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Set the cancellation flag (and `Running -> Cancelling`).
    fn request_cancel(
        &self,
        id: &Uuid,
    ) -> impl Future<Output = Result<CancelOutcome, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Completion delivery
    // -----------------------------------------------------------------------

    /// Claim the right to deliver the completion (`undelivered ->
    /// dispatching`). Returns `false` if it was already claimed, the record
    /// is gone, or the instance is not terminal.
    fn claim_delivery(&self, id: &Uuid)
    -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Record that the completion handler failed; the record is retained.
    fn record_callback_failure(
        &self,
        id: &Uuid,
        error: &str,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Driver lease
    // -----------------------------------------------------------------------

    /// Take or renew the driver lease for `owner` until `ttl` from now.
    ///
    /// Succeeds when the lease is free, already held by `owner`, or has
    /// lapsed; returns `false` while another owner holds a live lease.
    /// Fails with `NotFound` if the record is gone.
    fn claim_driver(
        &self,
        id: &Uuid,
        owner: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Give up the driver lease. No-op unless `owner` holds it or the
    /// record is gone.
    fn release_driver(
        &self,
        id: &Uuid,
        owner: &str,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;
}
