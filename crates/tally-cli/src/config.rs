//! Configuration file management for tally.
//!
//! Provides a TOML-based config file at `~/.config/tally/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default. The
//! operation-delay and redistribution knobs are plain env vars consumed at
//! serve time.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use tally_core::expr::DelayTable;
use tally_core::token::TokenConfig;
use tally_db::config::DbConfig;

/// Default redistribution delay, in seconds, when the env var is unset or
/// unparsable.
pub const DEFAULT_REDISTRIBUTION_DELAY_SECS: i64 = 60;

/// Default session token lifetime, in hours.
pub const DEFAULT_TOKEN_TTL_HOURS: i64 = 24;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub auth: AuthSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded token secret (64 hex chars = 32 bytes).
    pub token_secret: String,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the tally config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/tally` or `~/.config/tally`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("tally");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("tally")
}

/// Return the path to the tally config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Token secret generation
// -----------------------------------------------------------------------

/// Generate a random token secret: 32 random bytes, hex-encoded (64 chars).
pub fn generate_token_secret() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Env-driven evaluation knobs
// -----------------------------------------------------------------------

fn env_i64(key: &str) -> Option<i64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Per-operation worker delays. Missing or unparsable keys cost nothing.
pub fn delay_table_from_env() -> DelayTable {
    DelayTable {
        addition_ms: env_i64("TIME_ADDITION_MS").unwrap_or(0),
        subtraction_ms: env_i64("TIME_SUBTRACTION_MS").unwrap_or(0),
        multiplication_ms: env_i64("TIME_MULTIPLICATIONS_MS").unwrap_or(0),
        division_ms: env_i64("TIME_DIVISIONS_MS").unwrap_or(0),
    }
}

/// Seconds an in-flight task may sit silent before it is re-dispatched.
pub fn redistribution_delay_from_env() -> i64 {
    env_i64("TIME_TASK_IN_PROGRESS_REDISTRIBUTE").unwrap_or(DEFAULT_REDISTRIBUTION_DELAY_SECS)
}

/// Session token lifetime in hours.
pub fn token_ttl_hours_from_env() -> i64 {
    env_i64("TALLY_TOKEN_TTL_HOURS").unwrap_or(DEFAULT_TOKEN_TTL_HOURS)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct TallyConfig {
    pub db_config: DbConfig,
    pub token_config: TokenConfig,
}

impl TallyConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - DB URL: `cli_db_url` > `TALLY_DATABASE_URL` env > `config_file.database.url` > `DbConfig::DEFAULT_URL`
    /// - Token secret: `TALLY_TOKEN_SECRET` env > `config_file.auth.token_secret` (hex-decoded) > error
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("TALLY_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };
        let db_config = DbConfig::new(db_url);

        let token_config = if let Ok(secret_hex) = std::env::var("TALLY_TOKEN_SECRET") {
            let bytes = hex::decode(&secret_hex)
                .context("TALLY_TOKEN_SECRET env var is not valid hex")?;
            TokenConfig::new(bytes)
        } else if let Some(ref cfg) = file_config {
            let bytes = hex::decode(&cfg.auth.token_secret)
                .context("invalid hex in config file token_secret")?;
            TokenConfig::new(bytes)
        } else {
            bail!(
                "token secret not found; set TALLY_TOKEN_SECRET or run `tally init` to create a config file"
            );
        };

        Ok(Self {
            db_config,
            token_config,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
