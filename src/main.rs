//! sqlgate CLI Entry Point
//!
//! Subcommands:
//! - `serve` - MCP server over stdio (default)
//! - `sources` - resolved sources and their effective tools, without connecting
//! - `sample-dsns` - sample DSN of every registered connector
//!
//! stdout carries protocol messages and JSON output only. Logs go to stderr.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sqlgate::{
    discover, ConnectorRegistry, McpServer, SourceManager, TomlConfig, ToolRegistry, ToolRegistryHandle,
};

/// sqlgate - uniform, agent-addressable access to SQL databases
#[derive(Parser)]
#[command(name = "sqlgate")]
#[command(version)]
struct Cli {
    /// Configuration file (default: ./sqlgate.toml, then the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Single-source DSN, used when no configuration file is found
    #[arg(long, env = "SQLGATE_DSN", global = true, hide_env_values = true)]
    dsn: Option<String>,

    /// Read-only policy for sources that do not set `readonly`
    #[arg(long, global = true)]
    readonly: Option<bool>,

    /// Row cap for sources that do not set `max_rows`
    #[arg(long, global = true)]
    max_rows: Option<usize>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the MCP server on stdio
    Serve,

    /// Print configured sources and their effective tools
    Sources,

    /// Print the sample DSN of every registered connector
    SampleDsns,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sqlgate=info,warn"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<TomlConfig> {
    let (mut config, origin) = discover(cli.config.as_deref(), cli.dsn.as_deref())?;
    config.apply_defaults(cli.readonly, cli.max_rows);
    info!(origin = %origin, sources = config.sources.len(), "Configuration loaded");
    Ok(config)
}

async fn serve(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    let registry = ConnectorRegistry::with_default_connectors()?;

    let tools = ToolRegistryHandle::new();
    tools.initialize(ToolRegistry::new(&config));

    let sources = Arc::new(
        SourceManager::connect_all(&config, &registry)
            .await
            .context("Failed to connect configured sources")?,
    );

    let server = McpServer::new(tools, Arc::clone(&sources));
    let result = server.serve().await;
    sources.disconnect_all().await;
    result
}

fn print_sources(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    let tools = ToolRegistry::new(&config);

    let sources: Vec<_> = config
        .sources
        .iter()
        .map(|source| {
            json!({
                "id": source.id,
                "dsn": source.redacted_dsn(),
                "readonly": source.execute_options().is_readonly(),
                "max_rows": source.max_rows,
                "ssh": source.ssh.as_ref().map(|ssh| &ssh.host),
                "tools": tools.get_tools_for_source(&source.id),
            })
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&json!({ "sources": sources }))?);
    Ok(())
}

fn print_sample_dsns() -> anyhow::Result<()> {
    let registry = ConnectorRegistry::with_default_connectors()?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "connectors": registry.get_all_sample_dsns() }))?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match &cli.command {
        None | Some(Commands::Serve) => serve(&cli).await,
        Some(Commands::Sources) => print_sources(&cli),
        Some(Commands::SampleDsns) => print_sample_dsns(),
    }
}
