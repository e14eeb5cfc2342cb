//! Database query functions for the `expressions` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Sqlite, SqlitePool};

use crate::models::Expression;

/// Insert a full expression row.
///
/// Generic over the executor so it can run inside the same transaction as
/// the expression's task batch.
pub async fn insert_expression<'e, E>(executor: E, expression: &Expression) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO expressions (id, user_id, expression, status, result, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(&expression.id)
    .bind(expression.user_id)
    .bind(&expression.expression)
    .bind(expression.status)
    .bind(expression.result)
    .bind(expression.created_at)
    .bind(expression.updated_at)
    .execute(executor)
    .await
    .context("failed to insert expression")?;

    Ok(())
}

/// Fetch an expression by its ID.
pub async fn get_expression(pool: &SqlitePool, id: &str) -> Result<Option<Expression>> {
    let expression =
        sqlx::query_as::<_, Expression>("SELECT * FROM expressions WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch expression")?;

    Ok(expression)
}

/// Fetch an expression by ID, scoped to its owner.
///
/// Returns `None` both for unknown ids and for expressions owned by someone
/// else, so the HTTP layer can answer 404 without leaking existence.
pub async fn get_expression_for_user(
    pool: &SqlitePool,
    id: &str,
    user_id: i64,
) -> Result<Option<Expression>> {
    let expression = sqlx::query_as::<_, Expression>(
        "SELECT * FROM expressions WHERE id = $1 AND user_id = $2",
    )
    .bind(id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch expression for user")?;

    Ok(expression)
}

/// List all expressions belonging to a user, newest first.
pub async fn list_expressions_for_user(
    pool: &SqlitePool,
    user_id: i64,
) -> Result<Vec<Expression>> {
    let expressions = sqlx::query_as::<_, Expression>(
        "SELECT * FROM expressions WHERE user_id = $1 ORDER BY created_at DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("failed to list expressions for user")?;

    Ok(expressions)
}

/// List all expressions across users, newest first (operator view).
pub async fn list_expressions(pool: &SqlitePool) -> Result<Vec<Expression>> {
    let expressions =
        sqlx::query_as::<_, Expression>("SELECT * FROM expressions ORDER BY created_at DESC")
            .fetch_all(pool)
            .await
            .context("failed to list expressions")?;

    Ok(expressions)
}

/// Mark an expression completed with its final result.
///
/// Optimistic guard on `status = 'pending'`: of several racing submitters
/// only one observes `true`, so the pending -> completed transition happens
/// exactly once.
pub async fn finalize_expression(pool: &SqlitePool, id: &str, result: f64) -> Result<bool> {
    let outcome = sqlx::query(
        "UPDATE expressions \
         SET status = 'completed', result = $1, updated_at = $2 \
         WHERE id = $3 AND status = 'pending'",
    )
    .bind(result)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to finalize expression")?;

    Ok(outcome.rows_affected() > 0)
}
