//! Persistence layer for tally: SQLite models, pool construction,
//! migrations, and narrow query modules for expressions, tasks, and users.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
