//! Agent wire envelope
//!
//! Agents push JSON envelopes of the form
//!
//! ```json
//! {"version": 1, "type": "MetricBatch", "agentId": "a1", "timestamp": 1700000000000,
//!  "payload": [{"containerId": "web", "metric": "cpu", "value": 95.0, "timestamp": 1700000000000}]}
//! ```
//!
//! Envelopes are decoded into the closed [`Event`] type here and nowhere else;
//! nothing downstream ever sees untyped payload data.

use crate::error::DecodeError;
use crate::models::{
    ContainerRef, ContainerRunState, ContainerStatePoint, Event, LogPoint, LogStream, MetricPoint,
    Registration, Scope, Timestamp,
};
use serde::{Deserialize, Serialize};

/// Envelope version understood by this server
pub const ENVELOPE_VERSION: u32 = 1;

/// Upper bound on items in a single batch
pub const MAX_BATCH_ITEMS: usize = 10_000;

/// Envelope kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeType {
    Heartbeat,
    MetricBatch,
    LogBatch,
    Registration,
    /// Container metadata and runtime state
    ContainerState,
    ContainerRemoved,
}

/// Scope as accepted on the wire: a bare container list or a tagged scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScopeSpec {
    List(Vec<String>),
    Tagged(Scope),
}

impl From<ScopeSpec> for Scope {
    fn from(spec: ScopeSpec) -> Self {
        match spec {
            ScopeSpec::List(ids) => Scope::Containers(ids),
            ScopeSpec::Tagged(scope) => scope,
        }
    }
}

/// Raw envelope as it arrives from an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

fn default_version() -> u32 {
    ENVELOPE_VERSION
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricItem {
    container_id: String,
    #[serde(default)]
    stack: Option<String>,
    metric: String,
    value: f64,
    #[serde(default)]
    timestamp: Option<Timestamp>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogItem {
    container_id: String,
    #[serde(default)]
    stack: Option<String>,
    #[serde(default)]
    timestamp: Option<Timestamp>,
    #[serde(alias = "message", alias = "log")]
    text: String,
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    stream: Option<LogStream>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateItem {
    #[serde(alias = "id", alias = "name")]
    container_id: String,
    #[serde(default)]
    stack: Option<String>,
    #[serde(default, alias = "status")]
    state: Option<ContainerRunState>,
    #[serde(default)]
    since: Option<Timestamp>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    created_at: Option<Timestamp>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemovedItem {
    #[serde(alias = "id", alias = "name")]
    container_id: String,
    #[serde(default)]
    stack: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationDetails {
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    heartbeat_interval_secs: Option<u64>,
    #[serde(default)]
    discovery_interval_secs: Option<u64>,
    #[serde(default)]
    on_host: bool,
}

impl Envelope {
    pub fn new(kind: EnvelopeType, agent_id: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            kind,
            agent_id: Some(agent_id.into()),
            scope: None,
            timestamp: Some(timestamp),
            payload: None,
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(ScopeSpec::Tagged(scope));
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Validate and convert into a typed event.
    ///
    /// `received_at` fills in timestamps the agent left out.
    pub fn into_event(self, received_at: Timestamp) -> Result<Event, DecodeError> {
        if self.version != ENVELOPE_VERSION {
            return Err(DecodeError::UnsupportedVersion(self.version));
        }

        let agent_id = self
            .agent_id
            .map(|id| id.trim().to_string())
            .ok_or(DecodeError::MissingField("agentId"))?;
        if agent_id.is_empty() {
            return Err(DecodeError::invalid("agentId", "must not be empty"));
        }

        let timestamp = self.timestamp.unwrap_or(received_at);
        if timestamp < 0 {
            return Err(DecodeError::invalid("timestamp", "must not be negative"));
        }

        match self.kind {
            EnvelopeType::Heartbeat => Ok(Event::Heartbeat {
                agent_id,
                timestamp,
            }),
            EnvelopeType::Registration => {
                let details: RegistrationDetails = match self.payload {
                    Some(value) if !value.is_null() => serde_json::from_value(value)?,
                    _ => RegistrationDetails::default(),
                };
                if details.heartbeat_interval_secs == Some(0) {
                    return Err(DecodeError::invalid(
                        "heartbeatIntervalSecs",
                        "must be greater than zero",
                    ));
                }
                Ok(Event::Registration(Registration {
                    agent_id,
                    scope: self.scope.map(Scope::from).unwrap_or_default(),
                    hostname: details.hostname,
                    heartbeat_interval_secs: details.heartbeat_interval_secs,
                    discovery_interval_secs: details.discovery_interval_secs,
                    on_host: details.on_host,
                    timestamp,
                }))
            }
            EnvelopeType::MetricBatch => {
                let payload = self.payload.ok_or(DecodeError::MissingField("payload"))?;
                let items: Vec<MetricItem> = serde_json::from_value(payload)?;
                check_batch_size(items.len())?;

                let samples = items
                    .into_iter()
                    .map(|item| {
                        let container = non_empty("containerId", item.container_id)?;
                        let metric = non_empty("metric", item.metric)?;
                        if !item.value.is_finite() {
                            return Err(DecodeError::invalid("value", "must be finite"));
                        }
                        Ok(MetricPoint {
                            container,
                            stack: item.stack.filter(|s| !s.is_empty()),
                            metric,
                            value: item.value,
                            timestamp: item.timestamp.unwrap_or(timestamp),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(Event::MetricBatch {
                    agent_id,
                    timestamp,
                    samples,
                })
            }
            EnvelopeType::LogBatch => {
                let payload = self.payload.ok_or(DecodeError::MissingField("payload"))?;
                let items: Vec<LogItem> = serde_json::from_value(payload)?;
                check_batch_size(items.len())?;

                let lines = items
                    .into_iter()
                    .map(|item| {
                        Ok(LogPoint {
                            container: non_empty("containerId", item.container_id)?,
                            stack: item.stack.filter(|s| !s.is_empty()),
                            timestamp: item.timestamp.unwrap_or(timestamp),
                            text: item.text,
                            level: item.level.filter(|l| !l.is_empty()),
                            stream: item.stream,
                        })
                    })
                    .collect::<Result<Vec<_>, DecodeError>>()?;

                Ok(Event::LogBatch {
                    agent_id,
                    timestamp,
                    lines,
                })
            }
            EnvelopeType::ContainerState => {
                let payload = self.payload.ok_or(DecodeError::MissingField("payload"))?;
                let items: Vec<StateItem> = serde_json::from_value(payload)?;
                check_batch_size(items.len())?;

                let states = items
                    .into_iter()
                    .map(|item| {
                        Ok(ContainerStatePoint {
                            container: non_empty("containerId", item.container_id)?,
                            stack: item.stack.filter(|s| !s.is_empty()),
                            state: item.state,
                            since: item.since.unwrap_or(timestamp),
                            image: item.image.filter(|i| !i.is_empty()),
                            created_at: item.created_at,
                        })
                    })
                    .collect::<Result<Vec<_>, DecodeError>>()?;

                Ok(Event::ContainerState {
                    agent_id,
                    timestamp,
                    states,
                })
            }
            EnvelopeType::ContainerRemoved => {
                let payload = self.payload.ok_or(DecodeError::MissingField("payload"))?;
                let items: Vec<RemovedItem> = serde_json::from_value(payload)?;
                check_batch_size(items.len())?;

                let containers = items
                    .into_iter()
                    .map(|item| {
                        Ok(ContainerRef {
                            container: non_empty("containerId", item.container_id)?,
                            stack: item.stack.filter(|s| !s.is_empty()),
                        })
                    })
                    .collect::<Result<Vec<_>, DecodeError>>()?;

                Ok(Event::ContainerRemoved {
                    agent_id,
                    timestamp,
                    containers,
                })
            }
        }
    }
}

fn non_empty(field: &'static str, value: String) -> Result<String, DecodeError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(DecodeError::invalid(field, "must not be empty"))
    } else {
        Ok(trimmed.to_string())
    }
}

fn check_batch_size(len: usize) -> Result<(), DecodeError> {
    if len > MAX_BATCH_ITEMS {
        Err(DecodeError::invalid(
            "payload",
            format!("batch of {} items exceeds limit of {}", len, MAX_BATCH_ITEMS),
        ))
    } else {
        Ok(())
    }
}

/// Decode a raw JSON body into a typed event
pub fn decode(body: &[u8], received_at: Timestamp) -> Result<Event, DecodeError> {
    let envelope: Envelope = serde_json::from_slice(body)?;
    envelope.into_event(received_at)
}
