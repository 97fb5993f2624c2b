//! Core data models for the Clogs server

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unix epoch milliseconds. Every timestamp in the server and on the wire uses this unit.
pub type Timestamp = i64;

/// Current wall-clock time in Unix milliseconds
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// Identity of a monitored container.
///
/// Containers are deduplicated by this key across agents: two agents reporting
/// `web` in stack `shop` feed the same container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerKey {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub name: String,
}

impl ContainerKey {
    pub fn new(stack: Option<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            stack: stack.filter(|s| !s.is_empty()),
            name: name.trim_start_matches('/').to_string(),
        }
    }

    pub fn standalone(name: impl Into<String>) -> Self {
        Self::new(None, name)
    }

    pub fn in_stack(stack: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(Some(stack.into()), name)
    }

    /// Parse the `stack/name` (or bare `name`) rendering back into a key
    pub fn parse(id: &str) -> Self {
        let id = id.trim_start_matches('/');
        match id.split_once('/') {
            Some((stack, name)) if !stack.is_empty() && !name.is_empty() => {
                Self::in_stack(stack, name)
            }
            _ => Self::standalone(id),
        }
    }

    pub fn id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ContainerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stack {
            Some(stack) => write!(f, "{}/{}", stack, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Containers an agent declares it is responsible for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// An explicit container list
    Containers(Vec<String>),
    /// Every container of a compose-style stack
    Stack(String),
}

impl Default for Scope {
    fn default() -> Self {
        Scope::Containers(Vec::new())
    }
}

impl Scope {
    /// Stack name when the agent is an integrated stack agent
    pub fn stack(&self) -> Option<&str> {
        match self {
            Scope::Stack(stack) => Some(stack),
            Scope::Containers(_) => None,
        }
    }

    /// Containers explicitly named by the scope
    pub fn declared_containers(&self) -> Vec<ContainerKey> {
        match self {
            Scope::Containers(ids) => ids.iter().map(|id| ContainerKey::parse(id)).collect(),
            Scope::Stack(_) => Vec::new(),
        }
    }

    /// Whether a container falls under this scope
    pub fn covers(&self, key: &ContainerKey) -> bool {
        match self {
            Scope::Stack(stack) => key.stack.as_deref() == Some(stack.as_str()),
            Scope::Containers(ids) => ids.iter().any(|id| &ContainerKey::parse(id) == key),
        }
    }
}

/// A stored metric sample. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub container: ContainerKey,
    pub metric: String,
    pub value: f64,
    pub timestamp: Timestamp,
    pub agent_id: String,
    /// Set by the store when the sample arrived after a newer one in the same series
    #[serde(default)]
    pub out_of_order: bool,
}

/// Output stream a log line was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// A stored log line. Immutable once appended, except for repeat folding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub container: ContainerKey,
    pub timestamp: Timestamp,
    pub text: String,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<LogStream>,
    /// Number of identical consecutive lines folded into this entry
    #[serde(default = "default_repeat")]
    pub repeat: u32,
}

fn default_repeat() -> u32 {
    1
}

/// Derived health classification of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
    Stale,
}

impl HealthStatus {
    pub const ALL: [HealthStatus; 5] = [
        HealthStatus::Unknown,
        HealthStatus::Healthy,
        HealthStatus::Degraded,
        HealthStatus::Unhealthy,
        HealthStatus::Stale,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Stale => "stale",
        }
    }

    /// Rank used when combining rule outcomes; higher is worse
    fn severity_rank(&self) -> u8 {
        match self {
            HealthStatus::Unknown => 0,
            HealthStatus::Healthy => 1,
            HealthStatus::Degraded => 2,
            HealthStatus::Unhealthy => 3,
            HealthStatus::Stale => 4,
        }
    }

    /// The more severe of two statuses
    pub fn worst(self, other: HealthStatus) -> HealthStatus {
        if other.severity_rank() > self.severity_rank() {
            other
        } else {
            self
        }
    }

    /// Running, even if impaired. Used for uptime accounting.
    pub fn is_up(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Active,
    Stale,
    /// Deregistered; kept for historical attribution
    Retired,
}

/// Runtime state of a container as reported by its agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRunState {
    Created,
    Running,
    Restarting,
    Paused,
    Removing,
    Exited,
    Dead,
}

impl ContainerRunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerRunState::Created => "created",
            ContainerRunState::Running => "running",
            ContainerRunState::Restarting => "restarting",
            ContainerRunState::Paused => "paused",
            ContainerRunState::Removing => "removing",
            ContainerRunState::Exited => "exited",
            ContainerRunState::Dead => "dead",
        }
    }

    /// Health floor implied by the state; `None` when the state says nothing bad
    pub fn impairment(&self) -> Option<HealthStatus> {
        match self {
            ContainerRunState::Created | ContainerRunState::Running => None,
            ContainerRunState::Restarting | ContainerRunState::Paused => Some(HealthStatus::Degraded),
            ContainerRunState::Removing | ContainerRunState::Exited | ContainerRunState::Dead => {
                Some(HealthStatus::Unhealthy)
            }
        }
    }
}

impl fmt::Display for ContainerRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent registration payload
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub agent_id: String,
    pub scope: Scope,
    pub hostname: Option<String>,
    pub heartbeat_interval_secs: Option<u64>,
    pub discovery_interval_secs: Option<u64>,
    pub on_host: bool,
    pub timestamp: Timestamp,
}

impl Registration {
    pub fn new(agent_id: impl Into<String>, scope: Scope, timestamp: Timestamp) -> Self {
        Self {
            agent_id: agent_id.into(),
            scope,
            hostname: None,
            heartbeat_interval_secs: None,
            discovery_interval_secs: None,
            on_host: false,
            timestamp,
        }
    }
}

/// A metric reading as reported by an agent, before container resolution
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub container: String,
    pub stack: Option<String>,
    pub metric: String,
    pub value: f64,
    pub timestamp: Timestamp,
}

/// A log line as reported by an agent, before container resolution
#[derive(Debug, Clone, PartialEq)]
pub struct LogPoint {
    pub container: String,
    pub stack: Option<String>,
    pub timestamp: Timestamp,
    pub text: String,
    pub level: Option<String>,
    pub stream: Option<LogStream>,
}

/// Container metadata and/or runtime state, before container resolution
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerStatePoint {
    pub container: String,
    pub stack: Option<String>,
    pub state: Option<ContainerRunState>,
    /// When the container entered `state`
    pub since: Timestamp,
    pub image: Option<String>,
    pub created_at: Option<Timestamp>,
}

/// A container an agent stopped reporting, before container resolution
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerRef {
    pub container: String,
    pub stack: Option<String>,
}

/// A decoded, validated agent event
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Heartbeat {
        agent_id: String,
        timestamp: Timestamp,
    },
    Registration(Registration),
    MetricBatch {
        agent_id: String,
        timestamp: Timestamp,
        samples: Vec<MetricPoint>,
    },
    LogBatch {
        agent_id: String,
        timestamp: Timestamp,
        lines: Vec<LogPoint>,
    },
    ContainerState {
        agent_id: String,
        timestamp: Timestamp,
        states: Vec<ContainerStatePoint>,
    },
    ContainerRemoved {
        agent_id: String,
        timestamp: Timestamp,
        containers: Vec<ContainerRef>,
    },
}

impl Event {
    pub fn agent_id(&self) -> &str {
        match self {
            Event::Heartbeat { agent_id, .. }
            | Event::MetricBatch { agent_id, .. }
            | Event::LogBatch { agent_id, .. }
            | Event::ContainerState { agent_id, .. }
            | Event::ContainerRemoved { agent_id, .. } => agent_id,
            Event::Registration(reg) => &reg.agent_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::Heartbeat { .. } => "heartbeat",
            Event::Registration(_) => "registration",
            Event::MetricBatch { .. } => "metric_batch",
            Event::LogBatch { .. } => "log_batch",
            Event::ContainerState { .. } => "container_state",
            Event::ContainerRemoved { .. } => "container_removed",
        }
    }
}

/// Inclusive time range for history queries; open ends are unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: Option<Timestamp>,
    pub to: Option<Timestamp>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(from: Timestamp, to: Timestamp) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.from.map_or(true, |from| ts >= from) && self.to.map_or(true, |to| ts <= to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_key_rendering() {
        assert_eq!(ContainerKey::in_stack("shop", "web").to_string(), "shop/web");
        assert_eq!(ContainerKey::standalone("/redis").to_string(), "redis");
        assert_eq!(ContainerKey::parse("shop/web"), ContainerKey::in_stack("shop", "web"));
        assert_eq!(ContainerKey::parse("web"), ContainerKey::standalone("web"));
        assert_eq!(ContainerKey::new(Some(String::new()), "db"), ContainerKey::standalone("db"));
    }

    #[test]
    fn test_scope_covers() {
        let stack = Scope::Stack("shop".to_string());
        assert!(stack.covers(&ContainerKey::in_stack("shop", "web")));
        assert!(!stack.covers(&ContainerKey::standalone("web")));

        let list = Scope::Containers(vec!["web".to_string(), "shop/db".to_string()]);
        assert!(list.covers(&ContainerKey::standalone("web")));
        assert!(list.covers(&ContainerKey::in_stack("shop", "db")));
        assert!(!list.covers(&ContainerKey::in_stack("shop", "web")));
    }

    #[test]
    fn test_health_status_worst() {
        assert_eq!(
            HealthStatus::Healthy.worst(HealthStatus::Degraded),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::Unhealthy.worst(HealthStatus::Degraded),
            HealthStatus::Unhealthy
        );
        assert_eq!(HealthStatus::Stale.worst(HealthStatus::Unhealthy), HealthStatus::Stale);
        assert!(HealthStatus::Degraded.is_up());
        assert!(!HealthStatus::Stale.is_up());
    }

    #[test]
    fn test_run_state_impairment() {
        assert_eq!(ContainerRunState::Running.impairment(), None);
        assert_eq!(ContainerRunState::Paused.impairment(), Some(HealthStatus::Degraded));
        assert_eq!(ContainerRunState::Exited.impairment(), Some(HealthStatus::Unhealthy));
        let parsed: ContainerRunState = serde_json::from_str("\"dead\"").unwrap();
        assert_eq!(parsed, ContainerRunState::Dead);
    }

    #[test]
    fn test_time_range_contains() {
        let range = TimeRange::between(100, 200);
        assert!(range.contains(100));
        assert!(range.contains(200));
        assert!(!range.contains(201));
        assert!(TimeRange::all().contains(i64::MIN));
    }
}
