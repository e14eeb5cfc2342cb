//! Shared test utilities for tally integration tests.
//!
//! Each test gets its own throwaway SQLite database in a temp directory,
//! with all migrations applied. The returned [`tempfile::TempDir`] guard
//! must be kept alive for the duration of the test; dropping it deletes
//! the database file.

use sqlx::SqlitePool;
use tempfile::TempDir;

use tally_db::config::DbConfig;
use tally_db::models::User;
use tally_db::pool;
use tally_db::queries::users;

/// Create a temporary database with migrations applied.
///
/// Returns `(pool, guard)`. The pool points at a fresh database file inside
/// the guard's directory.
pub async fn create_test_db() -> (SqlitePool, TempDir) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let url = format!("sqlite://{}/tally-test.db", dir.path().display());

    let pool = pool::create_pool(&DbConfig::new(url))
        .await
        .expect("failed to open test database");

    pool::run_migrations(&pool, pool::default_migrations_path())
        .await
        .expect("migrations should succeed");

    (pool, dir)
}

/// Insert a user row so expressions have an owner to reference.
pub async fn seed_user(pool: &SqlitePool, email: &str) -> User {
    users::insert_user(pool, email, "0000$0000")
        .await
        .expect("seed user insert should succeed")
}
