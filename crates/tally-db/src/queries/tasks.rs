//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use sqlx::{Sqlite, SqlitePool};

use crate::models::Task;

/// Insert a full task row.
///
/// Generic over the executor so a whole task batch lands in one transaction
/// together with its parent expression.
pub async fn insert_task<'e, E>(executor: E, task: &Task) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO tasks (id, expression_id, seq, operation, operation_time, arg1, arg2, \
                            dependencies, result, completed, is_processing, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
    )
    .bind(&task.id)
    .bind(&task.expression_id)
    .bind(task.seq)
    .bind(&task.operation)
    .bind(task.operation_time)
    .bind(task.arg1)
    .bind(task.arg2)
    .bind(&task.dependencies)
    .bind(task.result)
    .bind(task.completed)
    .bind(task.is_processing)
    .bind(task.created_at)
    .bind(task.updated_at)
    .execute(executor)
    .await
    .context("failed to insert task")?;

    Ok(())
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &SqlitePool, id: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Fetch tasks by id, preserving the order of the input slice.
///
/// Dependency lists are ordered (index 0 feeds the left operand), so
/// callers rely on getting rows back in exactly the order they asked.
/// Errors if any id is missing: dependencies are inserted in the same
/// batch as their dependents, so absence means a corrupted graph.
pub async fn get_tasks_by_ids(pool: &SqlitePool, ids: &[String]) -> Result<Vec<Task>> {
    let mut tasks = Vec::with_capacity(ids.len());
    for id in ids {
        let task = get_task(pool, id)
            .await?
            .with_context(|| format!("dependency task {id} not found"))?;
        tasks.push(task);
    }
    Ok(tasks)
}

/// List all tasks of an expression in emission order.
pub async fn list_tasks_for_expression(
    pool: &SqlitePool,
    expression_id: &str,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE expression_id = $1 ORDER BY seq ASC",
    )
    .bind(expression_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for expression")?;

    Ok(tasks)
}

/// Write back a task's mutable fields, refreshing `updated_at`.
///
/// The refreshed timestamp is what arms the redistribution timer when the
/// dispatcher flips `is_processing` on.
pub async fn update_task(pool: &SqlitePool, task: &Task) -> Result<()> {
    let outcome = sqlx::query(
        "UPDATE tasks \
         SET arg1 = $1, arg2 = $2, result = $3, completed = $4, is_processing = $5, \
             updated_at = $6 \
         WHERE id = $7",
    )
    .bind(task.arg1)
    .bind(task.arg2)
    .bind(task.result)
    .bind(task.completed)
    .bind(task.is_processing)
    .bind(Utc::now())
    .bind(&task.id)
    .execute(pool)
    .await
    .context("failed to update task")?;

    if outcome.rows_affected() == 0 {
        anyhow::bail!("task {} not found", task.id);
    }

    Ok(())
}

/// Record a task's result and mark it completed.
///
/// Optimistic guard on `completed = 0`: a duplicate submission (late worker
/// after redistribution, or a double-dispatch race) observes `false` and the
/// stored result is never overwritten.
pub async fn complete_task(pool: &SqlitePool, id: &str, result: f64) -> Result<bool> {
    let outcome = sqlx::query(
        "UPDATE tasks \
         SET result = $1, completed = 1, updated_at = $2 \
         WHERE id = $3 AND completed = 0",
    )
    .bind(result)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to complete task")?;

    Ok(outcome.rows_affected() > 0)
}

/// Tasks eligible for dispatch: not completed, and either idle or in flight
/// long enough that the redistribution delay has elapsed.
///
/// Dependency completion is NOT checked here; the dispatcher verifies it
/// per candidate so operand fill-in can happen in the same pass.
pub async fn get_dispatch_candidates(
    pool: &SqlitePool,
    redistribution_delay_secs: i64,
) -> Result<Vec<Task>> {
    let stale_before = Utc::now() - Duration::seconds(redistribution_delay_secs);

    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE completed = 0 AND (is_processing = 0 OR updated_at < $1) \
         ORDER BY created_at ASC, seq ASC",
    )
    .bind(stale_before)
    .fetch_all(pool)
    .await
    .context("failed to get dispatch candidates")?;

    Ok(tasks)
}

/// Count an expression's tasks that have not yet completed.
pub async fn count_pending(pool: &SqlitePool, expression_id: &str) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks WHERE expression_id = $1 AND completed = 0",
    )
    .bind(expression_id)
    .fetch_one(pool)
    .await
    .context("failed to count pending tasks")?;

    Ok(row.0)
}

/// Fetch the root task of an expression: the last-emitted one (max `seq`).
///
/// Its result is the expression's result, regardless of which task happens
/// to complete last under redistribution.
pub async fn get_root_task(pool: &SqlitePool, expression_id: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE expression_id = $1 ORDER BY seq DESC LIMIT 1",
    )
    .bind(expression_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch root task")?;

    Ok(task)
}
