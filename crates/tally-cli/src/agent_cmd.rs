//! `tally agent`: a pool of computation workers that pull tasks over the
//! worker RPC surface, honour the per-operation delay, and push results
//! back. Workers are fully stateless; a crashed worker is recovered by the
//! dispatcher's redistribution timeout alone.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use tracing::{info, warn};

use tally_core::dispatch::{DispatchedTask, TaskResult};

/// How long an idle worker sleeps before polling again.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// How long a worker backs off after a transport error.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct AgentOptions {
    /// Base URL of the dispatcher's worker RPC listener.
    pub server: String,
    /// Number of concurrent pull loops.
    pub workers: usize,
}

pub async fn run_agent(options: AgentOptions) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build HTTP client")?;

    let server = options.server.trim_end_matches('/').to_owned();
    info!(server = %server, workers = options.workers, "agent started");

    let mut handles = Vec::with_capacity(options.workers);
    for worker_id in 0..options.workers {
        handles.push(tokio::spawn(worker_loop(
            client.clone(),
            server.clone(),
            worker_id,
        )));
    }
    for handle in handles {
        handle.await.context("worker loop panicked")?;
    }
    Ok(())
}

async fn worker_loop(client: reqwest::Client, server: String, worker_id: usize) {
    loop {
        match fetch_task(&client, &server).await {
            Ok(Some(task)) => {
                let value = compute(&task).await;
                if let Err(err) = push_result(&client, &server, &task.id, value).await {
                    warn!(worker_id, task_id = %task.id, error = %err, "failed to submit result");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
            Ok(None) => tokio::time::sleep(IDLE_POLL).await,
            Err(err) => {
                warn!(worker_id, error = %err, "task fetch failed");
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }
    }
}

async fn fetch_task(client: &reqwest::Client, server: &str) -> Result<Option<DispatchedTask>> {
    let response = client
        .post(format!("{server}/worker/task/fetch"))
        .send()
        .await
        .context("task fetch request failed")?;

    match response.status() {
        StatusCode::OK => {
            let task = response
                .json::<DispatchedTask>()
                .await
                .context("failed to decode dispatched task")?;
            Ok(Some(task))
        }
        StatusCode::NOT_FOUND => Ok(None),
        status => bail!("unexpected status {status} from task fetch"),
    }
}

/// Honour the operation's artificial delay, then apply it. Division by
/// zero follows IEEE-754: the result is an infinity or NaN, not an error.
async fn compute(task: &DispatchedTask) -> f64 {
    if task.operation_time > 0 {
        tokio::time::sleep(Duration::from_millis(task.operation_time as u64)).await;
    }

    match task.operation.as_str() {
        "+" => task.arg1 + task.arg2,
        "-" => task.arg1 - task.arg2,
        "*" => task.arg1 * task.arg2,
        "/" => task.arg1 / task.arg2,
        _ => 0.0,
    }
}

async fn push_result(
    client: &reqwest::Client,
    server: &str,
    task_id: &str,
    value: f64,
) -> Result<()> {
    let response = client
        .post(format!("{server}/worker/task/result"))
        .json(&TaskResult {
            id: task_id.to_owned(),
            result: value,
        })
        .send()
        .await
        .context("result submit request failed")?;

    match response.status() {
        StatusCode::OK => {
            info!(task_id, value, "result accepted");
            Ok(())
        }
        // Someone else finished this task first; drop our copy.
        StatusCode::CONFLICT => {
            info!(task_id, "task already completed elsewhere, result discarded");
            Ok(())
        }
        status => bail!("unexpected status {status} from result submit"),
    }
}
