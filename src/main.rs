//! PostgreSQL MCP server - main entry point.
//!
//! Loads configuration (defaults → `--config` file → environment → flags),
//! verifies the database is reachable, then serves MCP over stdio or TCP
//! until the client disconnects or the process is interrupted.

use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use humantime_serde::re::humantime;
use postgres_mcp_server::dispatch::{Dispatcher, Redactor};
use postgres_mcp_server::pool::{ConnectionPool, PgConnector};
use postgres_mcp_server::tools::ToolRegistry;
use postgres_mcp_server::transport::McpServer;
use postgres_mcp_server::types::TransportMode;
use postgres_mcp_server::{Config, Error, Result};

/// How long the runtime waits for blocked stdin reads on exit.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(
    name = "postgres-mcp-server",
    about = "Model Context Protocol server for PostgreSQL",
    disable_version_flag = true
)]
struct Cli {
    /// Print version information and exit
    #[arg(long)]
    version: bool,

    /// Print the MCP client configuration as JSON and exit
    #[arg(long)]
    json: bool,

    /// PostgreSQL connection string
    #[arg(long, env = "POSTGRES_CONNECTION_STRING")]
    connection_string: Option<String>,

    /// JSON configuration file
    #[arg(long, env = "PG_MCP_CONFIG")]
    config: Option<PathBuf>,

    /// Protocol transport
    #[arg(long, value_enum)]
    transport: Option<TransportMode>,

    /// Bind address in tcp mode
    #[arg(long)]
    listen_addr: Option<String>,

    /// Number of pooled database sessions
    #[arg(long)]
    pool_size: Option<usize>,

    /// How long a request waits for a session (e.g. "5s")
    #[arg(long, value_parser = humantime::parse_duration)]
    acquire_timeout: Option<Duration>,

    /// Per-request execution limit, "0s" to disable
    #[arg(long, value_parser = humantime::parse_duration)]
    query_timeout: Option<Duration>,

    /// How long shutdown waits for busy sessions
    #[arg(long, value_parser = humantime::parse_duration)]
    shutdown_grace: Option<Duration>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// Overlay flags and environment onto the file (or default) config.
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if let Some(connection_string) = &self.connection_string {
            config.database.connection_string = connection_string.clone();
        }
        if let Some(mode) = self.transport {
            config.transport.mode = mode;
        }
        if let Some(addr) = &self.listen_addr {
            config.transport.listen_addr = addr.clone();
        }
        if let Some(size) = self.pool_size {
            config.pool.max_size = size;
        }
        if let Some(timeout) = self.acquire_timeout {
            config.pool.acquire_timeout = timeout;
        }
        if let Some(timeout) = self.query_timeout {
            config.database.query_timeout = (!timeout.is_zero()).then_some(timeout);
        }
        if let Some(grace) = self.shutdown_grace {
            config.pool.shutdown_grace = grace;
        }
        if let Some(level) = &self.log_level {
            config.observability.log_level = level.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

/// Entry for an MCP client's server list. `args` is present only when a
/// connection string was supplied.
fn client_config(connection_string: Option<&str>) -> Result<serde_json::Value> {
    let exe = std::env::current_exe()
        .map_err(|e| Error::config(format!("cannot locate executable: {}", e)))?;
    let mut entry = json!({
        "type": "stdio",
        "command": exe.to_string_lossy(),
    });
    if let Some(connection_string) = connection_string.filter(|s| !s.is_empty()) {
        entry["args"] = json!(["--connection-string", connection_string]);
    }
    Ok(entry)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.version {
        println!("PostgreSQL MCP Server");
        println!("Version: {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    if cli.json {
        let rendered = client_config(cli.connection_string.as_deref())
            .and_then(|entry| Ok(serde_json::to_string(&entry)?));
        return match rendered {
            Ok(rendered) => {
                println!("{}", rendered);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    postgres_mcp_server::observability::init_tracing(&config.observability);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: cannot start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let outcome = runtime.block_on(run(config));
    // stdin reads block a runtime thread; do not wait on them forever.
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server exited with error");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let secrets = config.database.secrets();
    let connector = PgConnector::new(&config.database)?;
    let pool = ConnectionPool::new(Arc::new(connector), config.pool.clone());

    tracing::info!(max_size = config.pool.max_size, "connecting to database");
    if let Err(e) = pool.warm_up().await {
        let redactor = Redactor::new(secrets);
        return Err(Error::database(format!(
            "failed to connect to database: {}",
            redactor.redact(&e.detail())
        )));
    }
    tracing::info!("database connection verified");

    let registry = ToolRegistry::with_builtin_tools()?;
    let dispatcher = Dispatcher::new(registry, pool.clone())
        .with_query_timeout(config.database.query_timeout)
        .with_secrets(secrets);
    tracing::info!(tools = dispatcher.registry().len(), "tool registry ready");

    let server = McpServer::new(Arc::new(dispatcher), config.transport.clone());
    let serve = async {
        match config.transport.mode {
            TransportMode::Stdio => server.serve_stdio().await,
            TransportMode::Tcp => server.serve_tcp().await,
        }
    };
    tokio::pin!(serve);

    let outcome = tokio::select! {
        result = &mut serve => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            server.shutdown();
            serve.await
        }
    };

    let report = pool.shutdown(config.pool.shutdown_grace).await;
    tracing::info!(
        closed = report.closed,
        outstanding = report.outstanding,
        "server stopped"
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"{"pool": {"max_size": 3, "acquire_timeout": "2s", "shutdown_grace": "1s"}}"#,
        )
        .unwrap();

        let cli = Cli::parse_from([
            "postgres-mcp-server",
            "--config",
            file.path().to_str().unwrap(),
            "--connection-string",
            "postgresql://u:p@db:5432/app",
            "--pool-size",
            "8",
            "--query-timeout",
            "0s",
            "--transport",
            "tcp",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.pool.max_size, 8);
        assert_eq!(config.pool.acquire_timeout, Duration::from_secs(2));
        assert_eq!(config.database.connection_string, "postgresql://u:p@db:5432/app");
        assert_eq!(config.database.query_timeout, None);
        assert_eq!(config.transport.mode, TransportMode::Tcp);
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let cli = Cli::parse_from(["postgres-mcp-server", "--pool-size", "0"]);
        assert!(cli.load_config().is_err());
    }

    #[test]
    fn test_client_config_carries_connection_string() {
        let value = client_config(Some("postgresql://u:p@db/app")).unwrap();
        assert_eq!(value["type"], "stdio");
        assert_eq!(value["args"], json!(["--connection-string", "postgresql://u:p@db/app"]));
        assert!(!serde_json::to_string(&value).unwrap().contains('\n'));
    }

    #[test]
    fn test_client_config_omits_args_without_connection_string() {
        for supplied in [None, Some("")] {
            let value = client_config(supplied).unwrap();
            assert_eq!(value["type"], "stdio");
            assert!(value.get("args").is_none());
        }
    }
}
