use std::env;

/// Database configuration.
///
/// Reads from the `TALLY_DATABASE_URL` environment variable, falling back to
/// `sqlite://tally.db` (a file in the working directory) when unset.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full SQLite connection URL.
    pub database_url: String,
}

impl DbConfig {
    /// The default connection URL used when no environment variable is set.
    pub const DEFAULT_URL: &str = "sqlite://tally.db";

    /// Build a config from the environment.
    ///
    /// Priority: `TALLY_DATABASE_URL` env var, then the compile-time default.
    pub fn from_env() -> Self {
        let database_url =
            env::var("TALLY_DATABASE_URL").unwrap_or_else(|_| Self::DEFAULT_URL.to_owned());
        Self { database_url }
    }

    /// Build a config from an explicit URL (useful for tests and CLI flags).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// Extract the filesystem path from the URL.
    ///
    /// Returns `None` if the URL does not use the `sqlite:` scheme.
    pub fn database_path(&self) -> Option<&str> {
        self.database_url
            .strip_prefix("sqlite://")
            .or_else(|| self.database_url.strip_prefix("sqlite:"))
            .filter(|s| !s.is_empty())
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
