use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of an expression.
///
/// There is no failure terminal: malformed input is rejected before anything
/// is inserted, and non-finite arithmetic results are still results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ExpressionStatus {
    Pending,
    Completed,
}

impl fmt::Display for ExpressionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

impl FromStr for ExpressionStatus {
    type Err = ExpressionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            other => Err(ExpressionStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ExpressionStatus`] string.
#[derive(Debug, Clone)]
pub struct ExpressionStatusParseError(pub String);

impl fmt::Display for ExpressionStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid expression status: {:?}", self.0)
    }
}

impl std::error::Error for ExpressionStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A registered account. Only the HTTP front door touches this table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A user-submitted expression and the lifecycle of its evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Expression {
    pub id: String,
    #[serde(skip_serializing)]
    pub user_id: i64,
    pub expression: String,
    pub status: ExpressionStatus,
    pub result: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A node in an expression's task DAG: one binary operation.
///
/// `arg1`/`arg2` are `None` while the corresponding operand is still owed by
/// a dependency; absence is distinct from a literal zero. `seq` records
/// emission order within the expression -- the root task has the maximum
/// `seq`. `dependencies` holds the ids whose results fill missing operands,
/// left slot first.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: String,
    pub expression_id: String,
    pub seq: i64,
    pub operation: String,
    pub operation_time: i64,
    pub arg1: Option<f64>,
    pub arg2: Option<f64>,
    pub dependencies: Json<Vec<String>>,
    pub result: Option<f64>,
    pub completed: bool,
    pub is_processing: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
