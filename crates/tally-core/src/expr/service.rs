//! Transactional persistence of a decomposed expression.

use anyhow::Context;
use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use tally_db::models::{Expression, ExpressionStatus};
use tally_db::queries::{expressions as expr_db, tasks as task_db};

use super::parser::{DelayTable, ExpressionParseError, TaskGraph, decompose};

/// Errors surfaced by [`submit_expression`].
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The expression text was rejected before anything was written.
    #[error(transparent)]
    Parse(#[from] ExpressionParseError),

    /// The store failed; the transaction was rolled back.
    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

/// Decompose `text` and persist the expression together with its task batch
/// in a single transaction.
///
/// A literal-only expression has no tasks to run, so it is inserted already
/// completed with the literal as its result; everything else starts
/// `pending` and is driven to completion by worker submissions.
pub async fn submit_expression(
    pool: &SqlitePool,
    user_id: i64,
    text: &str,
    delays: &DelayTable,
) -> Result<Expression, SubmitError> {
    let text = text.trim();
    let id = Uuid::new_v4().to_string();
    let graph = decompose(&id, text, delays)?;

    let (status, result) = match &graph {
        TaskGraph::Literal(value) => (ExpressionStatus::Completed, Some(*value)),
        TaskGraph::Operators(_) => (ExpressionStatus::Pending, None),
    };

    let now = Utc::now();
    let expression = Expression {
        id,
        user_id,
        expression: text.to_owned(),
        status,
        result,
        created_at: now,
        updated_at: now,
    };

    // One transaction for the expression and the whole batch; dropping the
    // handle on an early return rolls everything back.
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    expr_db::insert_expression(&mut *tx, &expression).await?;

    let task_count = match &graph {
        TaskGraph::Literal(_) => 0,
        TaskGraph::Operators(tasks) => {
            for task in tasks {
                task_db::insert_task(&mut *tx, task).await?;
            }
            tasks.len()
        }
    };

    tx.commit()
        .await
        .context("failed to commit expression insert")?;

    info!(
        expression_id = %expression.id,
        user_id,
        tasks = task_count,
        "expression decomposed and stored"
    );

    Ok(expression)
}
