//! API client for the Clogs server query routes

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use url::Url;

/// API client for the Clogs server
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid server URL")?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Invalid server URL: {}", base_url);
        }

        Ok(Self { client, base_url })
    }

    /// Build a URL from path segments. Each segment is percent-encoded, so a
    /// `stack/name` container id stays a single segment.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Invalid server URL: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Make a GET request
    async fn get<T: DeserializeOwned>(&self, segments: &[&str], query: &[(&str, String)]) -> Result<T> {
        let url = self.url(segments)?;

        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        response.json().await.context("Failed to parse response")
    }

    pub async fn containers(&self, stack: Option<&str>) -> Result<Vec<ContainerStatus>> {
        let query: Vec<(&str, String)> = stack.map(|s| ("stack", s.to_string())).into_iter().collect();
        self.get(&["api", "web", "containers"], &query).await
    }

    pub async fn container(&self, id: &str) -> Result<ContainerStatus> {
        self.get(&["api", "web", "containers", id], &[]).await
    }

    pub async fn services(&self) -> Result<Vec<StackSummary>> {
        self.get(&["api", "web", "services"], &[]).await
    }

    pub async fn orphans(&self) -> Result<Vec<ContainerStatus>> {
        self.get(&["api", "web", "orphans"], &[]).await
    }

    pub async fn logs(&self, id: &str, limit: Option<usize>, level: Option<&str>) -> Result<Vec<LogLine>> {
        let mut query = Vec::new();
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        if let Some(level) = level {
            query.push(("level", level.to_string()));
        }
        self.get(&["api", "web", "containers", id, "logs"], &query).await
    }

    pub async fn metric_history(
        &self,
        id: &str,
        metric: &str,
        from: Option<i64>,
        to: Option<i64>,
    ) -> Result<Vec<MetricSample>> {
        let mut query = vec![("metric", metric.to_string())];
        if let Some(from) = from {
            query.push(("from", from.to_string()));
        }
        if let Some(to) = to {
            query.push(("to", to.to_string()));
        }
        self.get(&["api", "web", "containers", id, "metrics"], &query).await
    }

    pub async fn metric_names(&self, id: &str) -> Result<MetricNames> {
        self.get(&["api", "web", "containers", id, "metrics"], &[]).await
    }

    pub async fn agents(&self) -> Result<Vec<AgentInfo>> {
        self.get(&["api", "web", "agents"], &[]).await
    }

    pub async fn uptime(&self) -> Result<Vec<UptimeReport>> {
        self.get(&["api", "web", "uptime"], &[]).await
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub container: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub name: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub since: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_signal_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackSummary {
    pub stack: String,
    pub status: String,
    pub containers: Vec<ContainerStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric: String,
    pub value: f64,
    pub timestamp: i64,
    pub agent_id: String,
    #[serde(default)]
    pub out_of_order: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricNames {
    pub container: String,
    pub metrics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: i64,
    pub text: String,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    #[serde(default = "one")]
    pub repeat: u32,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub registered_at: i64,
    pub last_seen: i64,
    pub state: String,
    pub live: bool,
    #[serde(default)]
    pub implicit: bool,
    #[serde(default)]
    pub containers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UptimeReport {
    pub container: String,
    pub status: String,
    pub first_seen: i64,
    pub uptime_secs: i64,
    pub uptime_percent: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[test]
    fn test_container_id_is_one_segment() {
        let client = ApiClient::new("http://localhost:8080/").unwrap();
        let url = client.url(&["api", "web", "containers", "shop/web", "logs"]).unwrap();
        assert_eq!(url.path(), "/api/web/containers/shop%2Fweb/logs");
    }

    #[test]
    fn test_base_path_is_kept() {
        let client = ApiClient::new("http://proxy.local/clogs").unwrap();
        let url = client.url(&["api", "web", "agents"]).unwrap();
        assert_eq!(url.as_str(), "http://proxy.local/clogs/api/web/agents");
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(ApiClient::new("not a url").is_err());
        assert!(ApiClient::new("mailto:ops@example.com").is_err());
    }

    #[tokio::test]
    async fn test_containers_with_stack_filter() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/web/containers")
            .match_query(Matcher::UrlEncoded("stack".into(), "shop".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{"container":"shop/web","stack":"shop","name":"web","status":"degraded","reason":"cpu > 90 -> degraded","since":1700000000000}]"#,
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let containers = client.containers(Some("shop")).await.unwrap();

        mock.assert_async().await;
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].status, "degraded");
        assert_eq!(containers[0].stack.as_deref(), Some("shop"));
    }

    #[tokio::test]
    async fn test_logs_query_parameters() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/web/containers/shop%2Fapi/logs")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("limit".into(), "20".into()),
                Matcher::UrlEncoded("level".into(), "error".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"[{"timestamp":1700000000000,"text":"FATAL: db down","agent_id":"a1","level":"error","repeat":3}]"#,
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let lines = client.logs("shop/api", Some(20), Some("error")).await.unwrap();

        mock.assert_async().await;
        assert_eq!(lines[0].repeat, 3);
        assert_eq!(lines[0].level.as_deref(), Some("error"));
    }

    #[tokio::test]
    async fn test_api_error_surfaces_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/web/agents")
            .with_status(503)
            .with_body("draining")
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let err = client.agents().await.unwrap_err().to_string();
        assert!(err.contains("503"));
        assert!(err.contains("draining"));
    }
}
