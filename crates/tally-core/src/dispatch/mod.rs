//! Pull-based task dispatch.
//!
//! There is no in-process scheduler: the `(is_processing, updated_at)` pair
//! persisted on each task IS the dispatch state. A worker that vanishes is
//! recovered implicitly -- once the redistribution delay elapses the task
//! re-enters the candidate set on the next fetch. Two concurrent fetches may
//! hand the same task to two workers; the guarded completion write makes the
//! first submission win and rejects the rest.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, info};

use tally_db::models::Task;
use tally_db::queries::{expressions as expr_db, tasks as task_db};

/// Errors surfaced over the worker RPC channel.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("task not found")]
    NotFound,

    #[error("task already completed")]
    AlreadyCompleted,

    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

/// A task handed to a worker: operands resolved, delay attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchedTask {
    pub id: String,
    pub arg1: f64,
    pub arg2: f64,
    pub operation: String,
    pub operation_time: i64,
}

/// A worker's computed result for a previously fetched task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub id: String,
    pub result: f64,
}

/// Hand out one dispatchable task, or `None` when nothing is ready.
///
/// Walks the candidate set in store order, skipping tasks whose
/// dependencies have not all completed. The first ready task gets its
/// missing operands filled from dependency results, is marked in flight
/// (refreshing `updated_at`, which arms the redistribution timer), and is
/// returned. The in-flight mark is a best-effort lock, not a hard one.
pub async fn fetch_ready(
    pool: &SqlitePool,
    redistribution_delay_secs: i64,
) -> Result<Option<DispatchedTask>, DispatchError> {
    let candidates = task_db::get_dispatch_candidates(pool, redistribution_delay_secs).await?;

    for mut task in candidates {
        if !resolve_dependencies(pool, &mut task).await? {
            debug!(task_id = %task.id, "dependencies not yet completed, skipping");
            continue;
        }

        let (Some(arg1), Some(arg2)) = (task.arg1, task.arg2) else {
            return Err(DispatchError::Db(anyhow::anyhow!(
                "task {} is ready but still missing an operand",
                task.id
            )));
        };

        task.is_processing = true;
        task_db::update_task(pool, &task).await?;
        info!(task_id = %task.id, operation = %task.operation, "task dispatched");

        return Ok(Some(DispatchedTask {
            id: task.id,
            arg1,
            arg2,
            operation: task.operation,
            operation_time: task.operation_time,
        }));
    }

    Ok(None)
}

/// Check a candidate's dependencies and, when all have completed, fill the
/// task's missing operand slots from their results in dependency order.
async fn resolve_dependencies(pool: &SqlitePool, task: &mut Task) -> Result<bool, DispatchError> {
    if task.dependencies.is_empty() {
        return Ok(true);
    }

    let deps = task_db::get_tasks_by_ids(pool, &task.dependencies).await?;
    if deps.iter().any(|dep| !dep.completed) {
        return Ok(false);
    }

    for dep in &deps {
        fill_operand(task, dep.result);
    }
    Ok(true)
}

/// Place a dependency's value into the first empty operand slot.
///
/// The decomposer leaves exactly the owed slots empty and orders the
/// dependency list left-operand-first, so first-empty-slot reproduces the
/// original operand positions. Slot choice is by absence alone; a static
/// operand that happens to be zero stays where it is.
fn fill_operand(task: &mut Task, value: Option<f64>) {
    if task.arg1.is_none() {
        task.arg1 = value;
    } else if task.arg2.is_none() {
        task.arg2 = value;
    }
}

/// Accept a worker's result for a task.
///
/// Idempotent in its outward effect: the first submission sets the result
/// and completes the task, every later one gets [`DispatchError::AlreadyCompleted`]
/// and mutates nothing. When the submission empties the expression's pending
/// set, the expression is finalized from its root task.
pub async fn submit_result(
    pool: &SqlitePool,
    task_id: &str,
    value: f64,
) -> Result<(), DispatchError> {
    let task = task_db::get_task(pool, task_id)
        .await?
        .ok_or(DispatchError::NotFound)?;
    if task.completed {
        return Err(DispatchError::AlreadyCompleted);
    }

    // Guarded write: of two racing submissions only one flips the row.
    let accepted = task_db::complete_task(pool, task_id, value).await?;
    if !accepted {
        return Err(DispatchError::AlreadyCompleted);
    }
    info!(task_id = %task.id, value, "task result accepted");

    finalize_if_done(pool, &task.expression_id).await
}

/// Complete the expression once its last task has finished.
///
/// The result is read from the root task (the last-emitted one) rather than
/// from whichever task happened to complete last: under redistribution a
/// stale duplicate of an inner task may be the final submission.
async fn finalize_if_done(pool: &SqlitePool, expression_id: &str) -> Result<(), DispatchError> {
    let pending = task_db::count_pending(pool, expression_id).await?;
    if pending > 0 {
        return Ok(());
    }

    let root = task_db::get_root_task(pool, expression_id)
        .await?
        .with_context(|| format!("expression {expression_id} has no tasks"))?;
    let result = root
        .result
        .with_context(|| format!("root task {} completed without a result", root.id))?;

    if expr_db::finalize_expression(pool, expression_id, result).await? {
        info!(expression_id, result, "expression completed");
    }
    Ok(())
}
