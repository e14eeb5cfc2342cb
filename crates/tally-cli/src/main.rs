mod agent_cmd;
mod config;
mod serve_cmd;
mod status_cmd;
#[cfg(test)]
mod test_util;

use clap::{Parser, Subcommand};

use config::TallyConfig;
use tally_db::pool;

#[derive(Parser)]
#[command(name = "tally", about = "Distributed arithmetic expression evaluator")]
struct Cli {
    /// Database URL (overrides TALLY_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a tally config file (no database required)
    Init {
        /// SQLite connection URL
        #[arg(long, default_value = "sqlite://tally.db")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the database and run migrations
    DbInit,
    /// Run the user API and the worker RPC listener
    Serve {
        /// Address to bind both listeners to
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port for the user-facing API
        #[arg(long, default_value_t = 8080)]
        api_port: u16,
        /// Port for the worker RPC surface
        #[arg(long, default_value_t = 8090)]
        worker_port: u16,
    },
    /// Run a pool of computation workers against a dispatcher
    Agent {
        /// Base URL of the dispatcher's worker RPC listener
        #[arg(long, default_value = "http://127.0.0.1:8090")]
        server: String,
        /// Number of concurrent workers
        #[arg(long, default_value_t = 2)]
        workers: usize,
    },
    /// Show expressions and task progress (omit the id to list all)
    Status {
        /// Expression ID to inspect
        expression_id: Option<String>,
    },
}

/// Execute the `tally init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let token_secret = config::generate_token_secret();

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        auth: config::AuthSection {
            token_secret: token_secret.clone(),
        },
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!(
        "  auth.token_secret = {}...{}",
        &token_secret[..8],
        &token_secret[56..]
    );
    println!();
    println!("Next: run `tally db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `tally db-init` command: create the database file and run
/// migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = TallyConfig::resolve(cli_db_url)?;

    println!("Initializing tally database...");

    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("tally db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve {
            bind,
            api_port,
            worker_port,
        } => {
            let resolved = TallyConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            // The schema is ensured at startup so a fresh deployment can go
            // straight to `tally serve`.
            pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

            let state = serve_cmd::AppState {
                pool: db_pool.clone(),
                token_config: resolved.token_config,
                delays: config::delay_table_from_env(),
                redistribution_delay_secs: config::redistribution_delay_from_env(),
                token_ttl_hours: config::token_ttl_hours_from_env(),
            };

            let result = serve_cmd::run_serve(state, &bind, api_port, worker_port).await;
            db_pool.close().await;
            result?;
        }
        Commands::Agent { server, workers } => {
            agent_cmd::run_agent(agent_cmd::AgentOptions { server, workers }).await?;
        }
        Commands::Status { expression_id } => {
            let resolved = TallyConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool, expression_id.as_deref()).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
