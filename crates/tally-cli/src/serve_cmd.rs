use std::future::IntoFuture;
use std::net::SocketAddr;

use anyhow::Result;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;

use tally_core::auth::{hash_password, verify_password};
use tally_core::dispatch::{self, DispatchError, TaskResult};
use tally_core::expr::{DelayTable, SubmitError, submit_expression};
use tally_core::token::{TokenConfig, issue_token, validate_token};
use tally_db::models::User;
use tally_db::queries::{expressions as expr_db, users as user_db};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub token_config: TokenConfig,
    pub delays: DelayTable,
    pub redistribution_delay_secs: i64,
    pub token_ttl_hours: i64,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "unauthorized".to_owned(),
        }
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: msg.into(),
        }
    }

    pub fn unprocessable(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NotFound => Self::not_found("task not found"),
            DispatchError::AlreadyCompleted => Self::conflict("task already completed"),
            DispatchError::Db(inner) => Self::internal(inner),
        }
    }
}

// ---------------------------------------------------------------------------
// Bearer authentication
// ---------------------------------------------------------------------------

/// Extractor for the authenticated user behind `Authorization: Bearer ...`.
pub struct AuthUser(pub User);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(AppError::unauthorized)?;

        let token = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
            .ok_or_else(AppError::unauthorized)?;

        let claims = validate_token(&state.token_config, token, Utc::now())
            .map_err(|_| AppError::unauthorized())?;

        let user = user_db::get_user_by_id(&state.pool, claims.user_id)
            .await
            .map_err(AppError::internal)?
            .ok_or_else(AppError::unauthorized)?;

        Ok(AuthUser(user))
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CalculateRequest {
    pub expression: String,
}

// ---------------------------------------------------------------------------
// Routers
// ---------------------------------------------------------------------------

/// User-facing API: registration, login, and the expression surface.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/register", post(register))
        .route("/api/login", post(login))
        .route("/api/calculate", post(calculate))
        .route("/api/expressions", get(list_expressions))
        .route("/api/expressions/{id}", get(get_expression))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Worker-facing RPC: task pull and result push. Served on its own
/// listener so workers never touch the authenticated surface.
pub fn worker_router(state: AppState) -> Router {
    Router::new()
        .route("/worker/task/fetch", post(fetch_task))
        .route("/worker/task/result", post(submit_task_result))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(
    state: AppState,
    bind: &str,
    api_port: u16,
    worker_port: u16,
) -> Result<()> {
    let api = api_router(state.clone());
    let worker = worker_router(state);

    let api_addr: SocketAddr = format!("{bind}:{api_port}").parse()?;
    let worker_addr: SocketAddr = format!("{bind}:{worker_port}").parse()?;

    let api_listener = tokio::net::TcpListener::bind(api_addr).await?;
    let worker_listener = tokio::net::TcpListener::bind(worker_addr).await?;
    tracing::info!("user API listening on http://{api_addr}");
    tracing::info!("worker RPC listening on http://{worker_addr}");

    let api_server = axum::serve(api_listener, api).with_graceful_shutdown(shutdown_signal());
    let worker_server =
        axum::serve(worker_listener, worker).with_graceful_shutdown(shutdown_signal());

    tokio::try_join!(api_server.into_future(), worker_server.into_future())?;
    tracing::info!("tally serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Account handlers
// ---------------------------------------------------------------------------

async fn register(
    State(state): State<AppState>,
    Json(body): Json<CredentialsRequest>,
) -> Result<axum::response::Response, AppError> {
    if !body.email.contains('@') {
        return Err(AppError::unprocessable("invalid email address"));
    }
    if body.password.chars().count() < 3 {
        return Err(AppError::unprocessable("password too short"));
    }

    let existing = user_db::get_user_by_email(&state.pool, &body.email)
        .await
        .map_err(AppError::internal)?;
    if existing.is_some() {
        return Err(AppError::unprocessable("email already exists"));
    }

    let user = user_db::insert_user(&state.pool, &body.email, &hash_password(&body.password))
        .await
        .map_err(AppError::internal)?;
    tracing::info!(user_id = user.id, "user registered");

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": user.id })),
    )
        .into_response())
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<CredentialsRequest>,
) -> Result<axum::response::Response, AppError> {
    let user = user_db::get_user_by_email(&state.pool, &body.email)
        .await
        .map_err(AppError::internal)?;

    let Some(user) = user else {
        return Err(AppError::forbidden("incorrect credentials"));
    };
    if !verify_password(&user.password_hash, &body.password) {
        return Err(AppError::forbidden("incorrect credentials"));
    }

    let expires_at = Utc::now() + Duration::hours(state.token_ttl_hours);
    let access_token = issue_token(&state.token_config, user.id, expires_at);

    Ok(Json(TokenResponse {
        access_token,
        expires_at,
    })
    .into_response())
}

// ---------------------------------------------------------------------------
// Expression handlers
// ---------------------------------------------------------------------------

async fn calculate(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(body): Json<CalculateRequest>,
) -> Result<axum::response::Response, AppError> {
    let expression = submit_expression(&state.pool, user.id, &body.expression, &state.delays)
        .await
        .map_err(|err| match err {
            SubmitError::Parse(parse) => AppError::unprocessable(parse.to_string()),
            SubmitError::Db(db) => AppError::internal(db),
        })?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": expression.id })),
    )
        .into_response())
}

async fn list_expressions(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<axum::response::Response, AppError> {
    let expressions = expr_db::list_expressions_for_user(&state.pool, user.id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(serde_json::json!({ "expressions": expressions })).into_response())
}

async fn get_expression(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<axum::response::Response, AppError> {
    let expression = expr_db::get_expression_for_user(&state.pool, &id, user.id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("expression {id} not found")))?;

    Ok(Json(expression).into_response())
}

// ---------------------------------------------------------------------------
// Worker handlers
// ---------------------------------------------------------------------------

async fn fetch_task(
    State(state): State<AppState>,
) -> Result<axum::response::Response, AppError> {
    let task = dispatch::fetch_ready(&state.pool, state.redistribution_delay_secs).await?;

    match task {
        Some(task) => Ok(Json(task).into_response()),
        None => Err(AppError::not_found("no task ready for dispatch")),
    }
}

async fn submit_task_result(
    State(state): State<AppState>,
    Json(body): Json<TaskResult>,
) -> Result<axum::response::Response, AppError> {
    dispatch::submit_result(&state.pool, &body.id, body.result).await?;
    Ok(Json(serde_json::json!({ "status": "ok" })).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use sqlx::SqlitePool;
    use tower::ServiceExt;

    use tally_core::expr::DelayTable;
    use tally_core::token::TokenConfig;
    use tally_test_utils::create_test_db;

    use super::AppState;

    fn test_state(pool: SqlitePool) -> AppState {
        AppState {
            pool,
            token_config: TokenConfig::new(b"serve-test-secret".to_vec()),
            delays: DelayTable::default(),
            redistribution_delay_secs: 60,
            token_ttl_hours: 24,
        }
    }

    // -----------------------------------------------------------------------
    // HTTP helpers
    // -----------------------------------------------------------------------

    async fn send_json(
        app: Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&json).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        app.oneshot(request).await.unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Register + login a user, returning a valid bearer token.
    async fn register_and_login(state: &AppState, email: &str) -> String {
        let creds = serde_json::json!({ "email": email, "password": "hunter2" });

        let resp = send_json(
            super::api_router(state.clone()),
            "POST",
            "/api/register",
            None,
            Some(creds.clone()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = send_json(
            super::api_router(state.clone()),
            "POST",
            "/api/login",
            None,
            Some(creds),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        json["access_token"]
            .as_str()
            .expect("login should return a token")
            .to_owned()
    }

    // -----------------------------------------------------------------------
    // Account tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_register_rejects_invalid_email() {
        let (pool, _guard) = create_test_db().await;
        let state = test_state(pool.clone());

        let resp = send_json(
            super::api_router(state),
            "POST",
            "/api/register",
            None,
            Some(serde_json::json!({ "email": "not-an-email", "password": "hunter2" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_register_rejects_short_password() {
        let (pool, _guard) = create_test_db().await;
        let state = test_state(pool.clone());

        let resp = send_json(
            super::api_router(state),
            "POST",
            "/api/register",
            None,
            Some(serde_json::json!({ "email": "a@b.c", "password": "xy" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_email() {
        let (pool, _guard) = create_test_db().await;
        let state = test_state(pool.clone());
        let creds = serde_json::json!({ "email": "dup@example.com", "password": "hunter2" });

        let resp = send_json(
            super::api_router(state.clone()),
            "POST",
            "/api/register",
            None,
            Some(creds.clone()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = send_json(
            super::api_router(state),
            "POST",
            "/api/register",
            None,
            Some(creds),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_login_rejects_wrong_password() {
        let (pool, _guard) = create_test_db().await;
        let state = test_state(pool.clone());
        let _token = register_and_login(&state, "login@example.com").await;

        let resp = send_json(
            super::api_router(state),
            "POST",
            "/api/login",
            None,
            Some(serde_json::json!({ "email": "login@example.com", "password": "wrong" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        pool.close().await;
    }

    // -----------------------------------------------------------------------
    // Expression surface tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_calculate_requires_auth() {
        let (pool, _guard) = create_test_db().await;
        let state = test_state(pool.clone());

        let resp = send_json(
            super::api_router(state),
            "POST",
            "/api/calculate",
            None,
            Some(serde_json::json!({ "expression": "1+1" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_calculate_rejects_garbage_token() {
        let (pool, _guard) = create_test_db().await;
        let state = test_state(pool.clone());

        let resp = send_json(
            super::api_router(state),
            "POST",
            "/api/calculate",
            Some("tally_st_bogus"),
            Some(serde_json::json!({ "expression": "1+1" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_calculate_rejects_empty_expression() {
        let (pool, _guard) = create_test_db().await;
        let state = test_state(pool.clone());
        let token = register_and_login(&state, "empty@example.com").await;

        let resp = send_json(
            super::api_router(state),
            "POST",
            "/api/calculate",
            Some(&token),
            Some(serde_json::json!({ "expression": "   " })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_calculate_rejects_malformed_expression() {
        let (pool, _guard) = create_test_db().await;
        let state = test_state(pool.clone());
        let token = register_and_login(&state, "bad@example.com").await;

        let resp = send_json(
            super::api_router(state),
            "POST",
            "/api/calculate",
            Some(&token),
            Some(serde_json::json!({ "expression": "1+banana" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_expressions_are_scoped_to_owner() {
        let (pool, _guard) = create_test_db().await;
        let state = test_state(pool.clone());
        let owner = register_and_login(&state, "owner@example.com").await;
        let other = register_and_login(&state, "other@example.com").await;

        let resp = send_json(
            super::api_router(state.clone()),
            "POST",
            "/api/calculate",
            Some(&owner),
            Some(serde_json::json!({ "expression": "1+1" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let id = body_json(resp).await["id"].as_str().unwrap().to_owned();

        let resp = send_json(
            super::api_router(state.clone()),
            "GET",
            &format!("/api/expressions/{id}"),
            Some(&other),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = send_json(
            super::api_router(state),
            "GET",
            &format!("/api/expressions/{id}"),
            Some(&owner),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        pool.close().await;
    }

    // -----------------------------------------------------------------------
    // Worker surface tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_worker_fetch_404_when_idle() {
        let (pool, _guard) = create_test_db().await;
        let state = test_state(pool.clone());

        let resp = send_json(
            super::worker_router(state),
            "POST",
            "/worker/task/fetch",
            None,
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_worker_result_404_for_unknown_task() {
        let (pool, _guard) = create_test_db().await;
        let state = test_state(pool.clone());

        let resp = send_json(
            super::worker_router(state),
            "POST",
            "/worker/task/result",
            None,
            Some(serde_json::json!({ "id": "no-such-task", "result": 1.0 })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_full_evaluation_through_both_surfaces() {
        let (pool, _guard) = create_test_db().await;
        let state = test_state(pool.clone());
        let token = register_and_login(&state, "flow@example.com").await;

        // Submit through the user API.
        let resp = send_json(
            super::api_router(state.clone()),
            "POST",
            "/api/calculate",
            Some(&token),
            Some(serde_json::json!({ "expression": "2+2*2" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let id = body_json(resp).await["id"].as_str().unwrap().to_owned();

        // Drain the worker surface: fetch, compute, submit, until 404.
        let mut executed = 0;
        loop {
            let resp = send_json(
                super::worker_router(state.clone()),
                "POST",
                "/worker/task/fetch",
                None,
                None,
            )
            .await;
            if resp.status() == StatusCode::NOT_FOUND {
                break;
            }
            assert_eq!(resp.status(), StatusCode::OK);
            let task = body_json(resp).await;

            let (arg1, arg2) = (task["arg1"].as_f64().unwrap(), task["arg2"].as_f64().unwrap());
            let value = match task["operation"].as_str().unwrap() {
                "+" => arg1 + arg2,
                "-" => arg1 - arg2,
                "*" => arg1 * arg2,
                "/" => arg1 / arg2,
                other => panic!("unexpected operation {other:?}"),
            };

            let resp = send_json(
                super::worker_router(state.clone()),
                "POST",
                "/worker/task/result",
                None,
                Some(serde_json::json!({ "id": task["id"], "result": value })),
            )
            .await;
            assert_eq!(resp.status(), StatusCode::OK);

            executed += 1;
            assert!(executed < 10, "worker drain is not converging");
        }
        assert_eq!(executed, 2);

        // Read back the finished expression.
        let resp = send_json(
            super::api_router(state.clone()),
            "GET",
            &format!("/api/expressions/{id}"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "completed");
        assert_eq!(json["result"], 6.0);
        assert!(json.get("user_id").is_none(), "owner id stays private");

        // Listing includes it too.
        let resp = send_json(
            super::api_router(state),
            "GET",
            "/api/expressions",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["expressions"].as_array().unwrap().len(), 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_worker_duplicate_result_conflicts() {
        let (pool, _guard) = create_test_db().await;
        let state = test_state(pool.clone());
        let token = register_and_login(&state, "conflict@example.com").await;

        let resp = send_json(
            super::api_router(state.clone()),
            "POST",
            "/api/calculate",
            Some(&token),
            Some(serde_json::json!({ "expression": "3*3" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = send_json(
            super::worker_router(state.clone()),
            "POST",
            "/worker/task/fetch",
            None,
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let task_id = body_json(resp).await["id"].as_str().unwrap().to_owned();

        let submit = serde_json::json!({ "id": task_id, "result": 9.0 });
        let resp = send_json(
            super::worker_router(state.clone()),
            "POST",
            "/worker/task/result",
            None,
            Some(submit.clone()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = send_json(
            super::worker_router(state),
            "POST",
            "/worker/task/result",
            None,
            Some(submit),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_literal_expression_is_complete_immediately() {
        let (pool, _guard) = create_test_db().await;
        let state = test_state(pool.clone());
        let token = register_and_login(&state, "lit@example.com").await;

        let resp = send_json(
            super::api_router(state.clone()),
            "POST",
            "/api/calculate",
            Some(&token),
            Some(serde_json::json!({ "expression": "42" })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let id = body_json(resp).await["id"].as_str().unwrap().to_owned();

        let resp = send_json(
            super::api_router(state),
            "GET",
            &format!("/api/expressions/{id}"),
            Some(&token),
            None,
        )
        .await;
        let json = body_json(resp).await;
        assert_eq!(json["status"], "completed");
        assert_eq!(json["result"], 42.0);

        pool.close().await;
    }
}
