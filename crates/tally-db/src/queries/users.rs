//! Database query functions for the `users` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::User;

/// Insert a new user row. Returns the inserted user with its generated id.
pub async fn insert_user(pool: &SqlitePool, email: &str, password_hash: &str) -> Result<User> {
    let now = Utc::now();
    let user = sqlx::query_as::<_, User>(
        "INSERT INTO users (email, password_hash, created_at, updated_at) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(email)
    .bind(password_hash)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to insert user")?;

    Ok(user)
}

/// Fetch a user by email.
pub async fn get_user_by_email(pool: &SqlitePool, email: &str) -> Result<Option<User>> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1")
        .bind(email)
        .fetch_optional(pool)
        .await
        .context("failed to fetch user by email")?;

    Ok(user)
}

/// Fetch a user by id.
pub async fn get_user_by_id(pool: &SqlitePool, id: i64) -> Result<Option<User>> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch user by id")?;

    Ok(user)
}
