//! Clogs CLI
//!
//! Operator tool over the Clogs server query API: container status, stacks,
//! log and metric history, agents and uptime.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use commands::{agents, history, status};

const DEFAULT_SERVER_URL: &str = "http://localhost:8080";

/// Clogs CLI
#[derive(Parser)]
#[command(name = "clogs")]
#[command(author, version, about = "CLI for the Clogs log and health server", long_about = None)]
pub struct Cli {
    /// Server URL (can also be set via CLOGS_SERVER env var)
    #[arg(long, env = "CLOGS_SERVER", global = true)]
    pub server: Option<String>,

    /// Output format
    #[arg(long, short, global = true)]
    pub format: Option<output::OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show container health status
    Status {
        /// Only containers of this stack
        #[arg(long, short)]
        stack: Option<String>,

        /// A single container (`stack/name` or `name`)
        container: Option<String>,
    },

    /// Show containers grouped by stack
    Services,

    /// Show recent log lines of a container
    Logs {
        /// Container id (`stack/name` or `name`)
        container: String,

        /// Number of most recent lines
        #[arg(long, short = 'n', default_value_t = 50)]
        limit: usize,

        /// Only lines with this level
        #[arg(long)]
        level: Option<String>,
    },

    /// Show metric history of a container
    Metrics {
        /// Container id (`stack/name` or `name`)
        container: String,

        /// Metric name; lists the container's metrics when omitted
        #[arg(long, short)]
        metric: Option<String>,

        /// Only samples from the last N seconds
        #[arg(long)]
        since: Option<i64>,
    },

    /// Show registered agents and their liveness
    Agents,

    /// Show accumulated container uptime
    Uptime,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;

    let server = cli
        .server
        .or(config.server_url)
        .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
    let format = cli
        .format
        .or_else(|| {
            config
                .default_format
                .and_then(|f| output::OutputFormat::from_str(&f, true).ok())
        })
        .unwrap_or_default();

    // Initialize client
    let client = client::ApiClient::new(&server)?;

    // Execute command
    match cli.command {
        Commands::Status { stack, container } => {
            status::show_status(&client, stack, container, format).await?;
        }
        Commands::Services => {
            status::show_services(&client, format).await?;
        }
        Commands::Logs {
            container,
            limit,
            level,
        } => {
            history::show_logs(&client, &container, limit, level, format).await?;
        }
        Commands::Metrics {
            container,
            metric,
            since,
        } => {
            history::show_metrics(&client, &container, metric, since, format).await?;
        }
        Commands::Agents => {
            agents::show_agents(&client, format).await?;
        }
        Commands::Uptime => {
            agents::show_uptime(&client, format).await?;
        }
    }

    Ok(())
}
