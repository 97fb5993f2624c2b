//! Agent liveness and uptime commands

use anyhow::Result;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{color_percent, color_status, format_duration, format_timestamp, print_rows, OutputFormat};

#[derive(Tabled)]
struct AgentRow {
    #[tabled(rename = "Agent")]
    agent: String,
    #[tabled(rename = "Host")]
    host: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Live")]
    live: String,
    #[tabled(rename = "Last Seen")]
    last_seen: String,
    #[tabled(rename = "Containers")]
    containers: usize,
}

#[derive(Tabled)]
struct UptimeRow {
    #[tabled(rename = "Container")]
    container: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Tracked Since")]
    first_seen: String,
    #[tabled(rename = "Uptime")]
    uptime: String,
    #[tabled(rename = "%")]
    percent: String,
}

/// Show registered agents and whether they are live
pub async fn show_agents(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let agents = client.agents().await?;

    let rows = agents
        .iter()
        .map(|a| AgentRow {
            agent: if a.implicit {
                format!("{} (implicit)", a.agent_id)
            } else {
                a.agent_id.clone()
            },
            host: a.hostname.clone().unwrap_or_else(|| "-".to_string()),
            state: color_status(&a.state),
            live: if a.live { "yes" } else { "no" }.to_string(),
            last_seen: format_timestamp(a.last_seen),
            containers: a.containers.len(),
        })
        .collect();
    print_rows(rows, &agents, format)
}

/// Show accumulated uptime per container
pub async fn show_uptime(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let reports = client.uptime().await?;

    let rows = reports
        .iter()
        .map(|r| UptimeRow {
            container: r.container.clone(),
            status: color_status(&r.status),
            first_seen: format_timestamp(r.first_seen),
            uptime: format_duration(r.uptime_secs),
            percent: color_percent(r.uptime_percent),
        })
        .collect();
    print_rows(rows, &reports, format)
}
