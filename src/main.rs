//! sqlgate CLI Entry Point
//!
//! Subcommands:
//! - `serve` (default) - MCP server on stdin/stdout
//! - `tools` - print the tool catalogue as JSON
//!
//! Stdout carries protocol output only. Logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sqlgate::backend::Backend;
use sqlgate::config::GatewayConfig;
use sqlgate::dispatch::{Dispatcher, Tool};
use sqlgate::DatabaseType;

/// sqlgate - SQL database tools for AI agents over MCP
#[derive(Parser)]
#[command(name = "sqlgate")]
#[command(about = "Expose a SQL database as MCP tools with pooled, parameterized execution")]
#[command(version)]
struct Cli {
    /// Config file (default: .sqlgate/config.json, then the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter for stderr, e.g. `info` or `sqlgate=debug`
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve MCP over stdio (default)
    Serve,

    /// Print the tool catalogue as JSON
    Tools,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Tools => {
            println!("{}", serde_json::to_string_pretty(&Tool::catalogue())?);
            Ok(())
        }
        Commands::Serve => {
            let config = GatewayConfig::load(cli.config.as_deref())
                .context("could not load configuration")?;
            run(config).await
        }
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_env("SQLGATE_LOG")
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

async fn run(config: GatewayConfig) -> Result<()> {
    info!(
        engine = %config.engine,
        address = %config.endpoint.address,
        pool_size = config.pool_size,
        "starting sqlgate"
    );

    match config.engine {
        #[cfg(feature = "postgres")]
        DatabaseType::Postgres => {
            serve(sqlgate::backend::postgres::PostgresBackend::new(), &config).await
        }
        #[cfg(feature = "mysql")]
        DatabaseType::MySQL => serve(sqlgate::backend::mysql::MySqlBackend::new(), &config).await,
        #[cfg(feature = "mssql")]
        DatabaseType::MsSql => serve(sqlgate::backend::mssql::MsSqlBackend::new(), &config).await,
        #[cfg(feature = "sqlite")]
        DatabaseType::SQLite => {
            serve(sqlgate::backend::sqlite::SqliteBackend::new(), &config).await
        }
        #[allow(unreachable_patterns)]
        other => bail!("{other} support was not compiled into this build"),
    }
}

async fn serve<B: Backend>(backend: B, config: &GatewayConfig) -> Result<()> {
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(backend), config));
    let served = sqlgate::mcp::serve(Arc::clone(&dispatcher)).await;
    dispatcher.shutdown().await;
    info!("sqlgate stopped");
    served
}
