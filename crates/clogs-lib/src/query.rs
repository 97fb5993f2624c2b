//! Read side
//!
//! Serves container status, history and agent liveness. Never mutates core
//! state; every read takes only a single container's lock, briefly.

use crate::engine::{ContainerHealth, HealthEngine};
use crate::models::{ContainerKey, HealthStatus, LogLine, MetricSample, TimeRange, Timestamp};
use crate::registry::{AgentInfo, AgentRegistry, ContainerInfo};
use crate::store::{LogQuery, Store};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Containers of one stack and their combined status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackSummary {
    pub stack: String,
    /// Worst status among the stack's containers
    pub status: HealthStatus,
    pub containers: Vec<ContainerHealth>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UptimeReport {
    pub container: String,
    pub status: HealthStatus,
    pub first_seen: Timestamp,
    pub uptime_secs: i64,
    pub uptime_percent: f64,
}

#[derive(Clone)]
pub struct QueryService {
    registry: Arc<AgentRegistry>,
    store: Arc<dyn Store>,
    engine: Arc<HealthEngine>,
}

impl QueryService {
    pub fn new(registry: Arc<AgentRegistry>, store: Arc<dyn Store>, engine: Arc<HealthEngine>) -> Self {
        Self {
            registry,
            store,
            engine,
        }
    }

    /// Status of every known container, optionally restricted to one stack
    pub async fn container_statuses(&self, stack: Option<&str>, now: Timestamp) -> Vec<ContainerHealth> {
        let mut out = Vec::new();
        for container in self.registry.containers() {
            if stack.map_or(true, |s| container.key.stack.as_deref() == Some(s)) {
                out.push(self.engine.health(&container.key, now).await);
            }
        }
        out
    }

    /// Status of one container. Unknown containers read as Unknown.
    pub async fn container_status(&self, key: &ContainerKey, now: Timestamp) -> ContainerHealth {
        self.engine.health(key, now).await
    }

    /// Containers grouped by stack
    pub async fn services(&self, now: Timestamp) -> Vec<StackSummary> {
        let mut stacks: BTreeMap<String, Vec<ContainerHealth>> = BTreeMap::new();
        for health in self.container_statuses(None, now).await {
            if let Some(stack) = health.stack.clone() {
                stacks.entry(stack).or_default().push(health);
            }
        }

        stacks
            .into_iter()
            .map(|(stack, containers)| StackSummary {
                stack,
                status: containers
                    .iter()
                    .fold(HealthStatus::Unknown, |acc, c| acc.worst(c.status)),
                containers,
            })
            .collect()
    }

    /// Containers that belong to no stack
    pub async fn orphans(&self, now: Timestamp) -> Vec<ContainerHealth> {
        self.container_statuses(None, now)
            .await
            .into_iter()
            .filter(|c| c.stack.is_none())
            .collect()
    }

    pub async fn metric_history(
        &self,
        key: &ContainerKey,
        metric: &str,
        range: TimeRange,
    ) -> Vec<MetricSample> {
        self.store.query_metrics(key, metric, range).await
    }

    pub async fn metric_names(&self, key: &ContainerKey) -> Vec<String> {
        self.store.metric_names(key).await
    }

    pub async fn recent_logs(&self, key: &ContainerKey, query: &LogQuery) -> Vec<LogLine> {
        self.store.query_logs(key, query).await
    }

    /// Agent list with liveness
    pub fn agents(&self, now: Timestamp) -> Vec<AgentInfo> {
        self.registry.agents(now)
    }

    pub fn agent(&self, agent_id: &str, now: Timestamp) -> Option<AgentInfo> {
        self.registry.agent(agent_id, now)
    }

    /// Containers an agent declared or reported, with their metadata
    pub fn agent_containers(&self, agent_id: &str) -> Vec<ContainerInfo> {
        self.registry.agent_containers(agent_id)
    }

    pub async fn uptime(&self, now: Timestamp) -> Vec<UptimeReport> {
        let mut out = Vec::new();
        for container in self.registry.containers() {
            let Some(uptime) = self.engine.uptime(&container.key).await else {
                continue;
            };
            out.push(UptimeReport {
                container: container.key.id(),
                status: self.engine.status(&container.key).await,
                first_seen: uptime.first_seen,
                uptime_secs: uptime.up_ms / 1000,
                uptime_percent: uptime.percentage(now),
            });
        }
        out
    }
}
