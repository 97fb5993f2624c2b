//! Log and metric history commands

use anyhow::Result;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{format_timestamp, print_info, print_json, print_rows, OutputFormat};

#[derive(Tabled)]
struct LogRow {
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Level")]
    level: String,
    #[tabled(rename = "Message")]
    text: String,
    #[tabled(rename = "x")]
    repeat: String,
}

#[derive(Tabled)]
struct SampleRow {
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Agent")]
    agent: String,
}

/// Show the most recent log lines of a container
pub async fn show_logs(
    client: &ApiClient,
    container: &str,
    limit: usize,
    level: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let lines = client.logs(container, Some(limit), level.as_deref()).await?;

    let rows = lines
        .iter()
        .map(|line| LogRow {
            time: format_timestamp(line.timestamp),
            level: line.level.clone().unwrap_or_else(|| "-".to_string()),
            text: line.text.clone(),
            repeat: if line.repeat > 1 {
                line.repeat.to_string()
            } else {
                String::new()
            },
        })
        .collect();
    print_rows(rows, &lines, format)
}

/// Show a metric's history, or the container's metric names when none is given
pub async fn show_metrics(
    client: &ApiClient,
    container: &str,
    metric: Option<String>,
    since_secs: Option<i64>,
    format: OutputFormat,
) -> Result<()> {
    let Some(metric) = metric else {
        let names = client.metric_names(container).await?;
        if format == OutputFormat::Json {
            return print_json(&names);
        }
        if names.metrics.is_empty() {
            print_info(&format!("No metrics recorded for {}", names.container));
        } else {
            println!("{}", names.metrics.join("\n"));
        }
        return Ok(());
    };

    let from = since_secs.map(|secs| chrono::Utc::now().timestamp_millis() - secs * 1_000);
    let samples = client.metric_history(container, &metric, from, None).await?;

    let rows = samples
        .iter()
        .map(|s| SampleRow {
            time: format_timestamp(s.timestamp),
            value: if s.out_of_order {
                format!("{} (late)", s.value)
            } else {
                s.value.to_string()
            },
            agent: s.agent_id.clone(),
        })
        .collect();
    print_rows(rows, &samples, format)
}
