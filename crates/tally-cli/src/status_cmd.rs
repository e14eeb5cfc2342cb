//! `tally status`: operator read-back of expressions and task progress.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use tally_db::queries::{expressions as expr_db, tasks as task_db};

pub async fn run_status(pool: &SqlitePool, expression_id: Option<&str>) -> Result<()> {
    match expression_id {
        Some(id) => show_expression(pool, id).await,
        None => list_all(pool).await,
    }
}

async fn list_all(pool: &SqlitePool) -> Result<()> {
    let expressions = expr_db::list_expressions(pool).await?;
    if expressions.is_empty() {
        println!("No expressions found.");
        return Ok(());
    }

    println!("{:<36}  {:<9}  {:>12}  EXPRESSION", "ID", "STATUS", "RESULT");
    for expression in &expressions {
        let result = expression
            .result
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_owned());
        println!(
            "{:<36}  {:<9}  {:>12}  {}",
            expression.id, expression.status, result, expression.expression
        );
    }
    Ok(())
}

async fn show_expression(pool: &SqlitePool, id: &str) -> Result<()> {
    let expression = expr_db::get_expression(pool, id)
        .await?
        .with_context(|| format!("expression {id} not found"))?;
    let tasks = task_db::list_tasks_for_expression(pool, id).await?;
    let pending = task_db::count_pending(pool, id).await?;

    println!("Expression: {}", expression.expression);
    println!("Status:     {}", expression.status);
    match expression.result {
        Some(result) => println!("Result:     {result}"),
        None => println!("Result:     - ({pending} task(s) pending)"),
    }

    if tasks.is_empty() {
        println!("No operator tasks (literal-only expression).");
        return Ok(());
    }

    println!();
    println!(
        "{:<4}  {:<2}  {:>8}  {:>8}  {:>10}  {:<10}  DEPS",
        "SEQ", "OP", "ARG1", "ARG2", "RESULT", "STATE"
    );
    for task in &tasks {
        let fmt = |v: Option<f64>| v.map(|x| x.to_string()).unwrap_or_else(|| "-".to_owned());
        let state = if task.completed {
            "done"
        } else if task.is_processing {
            "in-flight"
        } else {
            "pending"
        };
        println!(
            "{:<4}  {:<2}  {:>8}  {:>8}  {:>10}  {:<10}  {}",
            task.seq,
            task.operation,
            fmt(task.arg1),
            fmt(task.arg2),
            fmt(task.result),
            state,
            task.dependencies.len()
        );
    }
    Ok(())
}
