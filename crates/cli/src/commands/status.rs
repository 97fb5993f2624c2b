//! Container and stack status commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{ApiClient, ContainerStatus};
use crate::output::{color_status, format_timestamp, print_json, print_rows, print_warning, OutputFormat};

/// Row for container status table
#[derive(Tabled)]
struct ContainerRow {
    #[tabled(rename = "Container")]
    container: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Since")]
    since: String,
    #[tabled(rename = "Last Signal")]
    last_signal: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

impl From<&ContainerStatus> for ContainerRow {
    fn from(c: &ContainerStatus) -> Self {
        Self {
            container: c.container.clone(),
            status: color_status(&c.status),
            since: format_timestamp(c.since),
            last_signal: c.last_signal_at.map(format_timestamp).unwrap_or_else(|| "-".to_string()),
            reason: c.reason.clone().unwrap_or_default(),
        }
    }
}

/// Show status of all containers, one stack, or one container
pub async fn show_status(
    client: &ApiClient,
    stack: Option<String>,
    container: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    if let Some(id) = container {
        let status = client.container(&id).await?;
        return print_rows(vec![ContainerRow::from(&status)], &status, format);
    }

    let containers = client.containers(stack.as_deref()).await?;
    let rows = containers.iter().map(ContainerRow::from).collect();
    print_rows(rows, &containers, format)?;

    if format == OutputFormat::Table && !containers.is_empty() {
        println!("\nTotal: {} containers", containers.len());
    }
    Ok(())
}

/// Show containers grouped by stack, followed by containers without one
pub async fn show_services(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let services = client.services().await?;
    let orphans = client.orphans().await?;

    if format == OutputFormat::Json {
        return print_json(&serde_json::json!({
            "services": services,
            "orphans": orphans,
        }));
    }

    if services.is_empty() && orphans.is_empty() {
        print_warning("No containers reported yet");
        return Ok(());
    }

    for service in &services {
        println!(
            "{} {} ({} containers)",
            service.stack.bold(),
            color_status(&service.status),
            service.containers.len()
        );
        let rows = service.containers.iter().map(ContainerRow::from).collect();
        print_rows(rows, &service.containers, format)?;
        println!();
    }

    if !orphans.is_empty() {
        println!("{}", "Standalone containers".bold());
        let rows = orphans.iter().map(ContainerRow::from).collect();
        print_rows(rows, &orphans, format)?;
    }
    Ok(())
}
