//! Agent registry
//!
//! Tracks known agents, their declared scope and last-seen time, and the
//! containers they report on. Containers are keyed by identity, not by agent:
//! each container carries the set of contributing agent ids (a relation, not
//! ownership), and stays live while *any* contributor is live.
//!
//! Lock discipline: a guard on one map is never held while touching the other.

use crate::models::{
    AgentState, ContainerKey, ContainerRunState, ContainerStatePoint, Registration, Scope, Timestamp,
};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default heartbeat timeout before an agent is marked stale
const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default window after which a container without live contributors is stale
const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(90);

/// Multiple of a declared heartbeat interval tolerated before an agent is stale
const DECLARED_INTERVAL_FACTOR: f64 = 2.0 * 1.05;

/// Configuration for liveness tracking
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub heartbeat_timeout: Duration,
    pub liveness_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
struct AgentRecord {
    agent_id: String,
    hostname: Option<String>,
    registered_at: Timestamp,
    last_seen: Timestamp,
    scope: Scope,
    state: AgentState,
    heartbeat_interval_secs: Option<u64>,
    discovery_interval_secs: Option<u64>,
    on_host: bool,
    implicit: bool,
    /// Containers added to the registry because the scope named them
    declared: BTreeSet<ContainerKey>,
    /// Containers this agent has sent data for
    reported: BTreeSet<ContainerKey>,
}

impl AgentRecord {
    fn new(agent_id: &str, now: Timestamp, implicit: bool) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            hostname: None,
            registered_at: now,
            last_seen: now,
            scope: Scope::default(),
            state: AgentState::Active,
            heartbeat_interval_secs: None,
            discovery_interval_secs: None,
            on_host: false,
            implicit,
            declared: BTreeSet::new(),
            reported: BTreeSet::new(),
        }
    }

    fn see(&mut self, now: Timestamp) {
        self.last_seen = self.last_seen.max(now);
        self.state = AgentState::Active;
    }
}

#[derive(Debug, Clone)]
struct ContainerRecord {
    first_seen: Timestamp,
    last_data_at: Option<Timestamp>,
    contributors: BTreeSet<String>,
    image: Option<String>,
    created_at: Option<Timestamp>,
    run_state: Option<ContainerRunState>,
    state_since: Option<Timestamp>,
}

impl ContainerRecord {
    fn new(now: Timestamp) -> Self {
        Self {
            first_seen: now,
            last_data_at: None,
            contributors: BTreeSet::new(),
            image: None,
            created_at: None,
            run_state: None,
            state_since: None,
        }
    }

    fn info(&self, key: &ContainerKey) -> ContainerInfo {
        ContainerInfo {
            id: key.id(),
            key: key.clone(),
            first_seen: self.first_seen,
            last_data_at: self.last_data_at,
            contributors: self.contributors.iter().cloned().collect(),
            image: self.image.clone(),
            created_at: self.created_at,
            run_state: self.run_state,
            state_since: self.state_since,
        }
    }
}

/// Snapshot of an agent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentInfo {
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub registered_at: Timestamp,
    pub last_seen: Timestamp,
    pub scope: Scope,
    pub state: AgentState,
    /// Whether the agent currently vouches for its containers
    pub live: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovery_interval_secs: Option<u64>,
    pub on_host: bool,
    pub implicit: bool,
    pub containers: Vec<String>,
}

/// Handle returned from registration
pub type AgentHandle = AgentInfo;

/// Snapshot of a container's registry entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerInfo {
    pub id: String,
    pub key: ContainerKey,
    pub first_seen: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_data_at: Option<Timestamp>,
    pub contributors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_state: Option<ContainerRunState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_since: Option<Timestamp>,
}

/// Agents that went stale during a sweep
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrySweep {
    /// `(agent_id, silent_for_ms)` for each agent newly marked stale
    pub newly_stale: Vec<(String, i64)>,
    pub active: usize,
    pub stale: usize,
    pub retired: usize,
}

/// Registry of agents and the containers they report on
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: DashMap<String, AgentRecord>,
    containers: DashMap<ContainerKey, ContainerRecord>,
    config: RegistryConfig,
}

impl AgentRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            agents: DashMap::new(),
            containers: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register or re-register an agent. Idempotent: re-registering with the
    /// same scope leaves the registry unchanged apart from last-seen.
    pub fn register(&self, registration: &Registration, now: Timestamp) -> AgentHandle {
        let new_declared: BTreeSet<ContainerKey> =
            registration.scope.declared_containers().into_iter().collect();

        let (dropped, created) = {
            let mut created = false;
            let mut entry = self
                .agents
                .entry(registration.agent_id.clone())
                .or_insert_with(|| {
                    created = true;
                    AgentRecord::new(&registration.agent_id, now, false)
                });

            let record = entry.value_mut();
            record.see(now);
            record.implicit = false;
            record.scope = registration.scope.clone();
            record.hostname = registration.hostname.clone().or(record.hostname.take());
            record.heartbeat_interval_secs = registration.heartbeat_interval_secs;
            record.discovery_interval_secs = registration.discovery_interval_secs;
            record.on_host = registration.on_host;

            let dropped: Vec<ContainerKey> = record
                .declared
                .difference(&new_declared)
                .filter(|key| !record.reported.contains(*key))
                .cloned()
                .collect();
            record.declared = new_declared.clone();
            (dropped, created)
        };

        for key in &dropped {
            if let Some(mut container) = self.containers.get_mut(key) {
                container.contributors.remove(&registration.agent_id);
            }
        }

        for key in &new_declared {
            self.link(key, &registration.agent_id, now);
        }

        if let Scope::Stack(stack) = &registration.scope {
            let in_stack: Vec<ContainerKey> = self
                .containers
                .iter()
                .filter(|c| c.key().stack.as_deref() == Some(stack.as_str()))
                .map(|c| c.key().clone())
                .collect();
            for key in &in_stack {
                self.link(key, &registration.agent_id, now);
            }
        }

        if created {
            info!(agent_id = %registration.agent_id, scope = ?registration.scope, "Agent registered");
        } else {
            debug!(agent_id = %registration.agent_id, scope = ?registration.scope, "Agent re-registered");
        }

        self.snapshot_agent(&registration.agent_id, now)
            .unwrap_or_else(|| self.placeholder(&registration.agent_id, now))
    }

    /// Record a heartbeat. Unknown agents are registered implicitly with an
    /// empty scope; returns `true` when the agent was already known.
    pub fn heartbeat(&self, agent_id: &str, now: Timestamp) -> bool {
        let known = self.touch(agent_id, now);
        if !known {
            warn!(agent_id = %agent_id, "Heartbeat from unknown agent, registering implicitly");
        }
        known
    }

    /// Mark an agent as seen, creating it on first contact.
    /// Returns `true` when the agent was already known.
    pub fn touch(&self, agent_id: &str, now: Timestamp) -> bool {
        if let Some(mut record) = self.agents.get_mut(agent_id) {
            if record.state == AgentState::Stale {
                info!(agent_id = %agent_id, "Stale agent is reporting again");
            }
            record.see(now);
            return true;
        }
        self.agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentRecord::new(agent_id, now, true))
            .see(now);
        false
    }

    /// Soft-retire an agent. It stays listed but no longer keeps containers live.
    pub fn deregister(&self, agent_id: &str) -> bool {
        match self.agents.get_mut(agent_id) {
            Some(mut record) => {
                record.state = AgentState::Retired;
                info!(agent_id = %agent_id, "Agent retired");
                true
            }
            None => false,
        }
    }

    /// Key of a container as named by an agent. Items without an explicit
    /// stack inherit the stack of a stack-scoped agent.
    pub fn container_key(&self, agent_id: &str, name: &str, stack: Option<&str>) -> ContainerKey {
        let agent_stack = self
            .agents
            .get(agent_id)
            .and_then(|a| a.scope.stack().map(str::to_string));
        ContainerKey::new(stack.map(str::to_string).or(agent_stack), name)
    }

    /// Resolve (creating if needed) the container an agent reports on.
    ///
    /// An agent not seen before is registered implicitly, so every
    /// contributor refers to a known agent.
    pub fn resolve_container(
        &self,
        agent_id: &str,
        name: &str,
        stack: Option<&str>,
        now: Timestamp,
    ) -> ContainerKey {
        let key = self.container_key(agent_id, name, stack);

        let created = self.link(&key, agent_id, now);

        self.agents
            .entry(agent_id.to_string())
            .or_insert_with(|| {
                warn!(agent_id = %agent_id, "Container reported by unknown agent, registering implicitly");
                AgentRecord::new(agent_id, now, true)
            })
            .reported
            .insert(key.clone());

        if created && key.stack.is_some() {
            let covering: Vec<String> = self
                .agents
                .iter()
                .filter(|a| a.agent_id != agent_id && a.scope.covers(&key))
                .map(|a| a.agent_id.clone())
                .collect();
            for other in &covering {
                self.link(&key, other, now);
            }
        }

        key
    }

    /// Add an agent to a container's contributors. Returns `true` if the container was created.
    fn link(&self, key: &ContainerKey, agent_id: &str, now: Timestamp) -> bool {
        let mut created = false;
        self.containers
            .entry(key.clone())
            .or_insert_with(|| {
                created = true;
                ContainerRecord::new(now)
            })
            .contributors
            .insert(agent_id.to_string());
        if created {
            debug!(container = %key, agent_id = %agent_id, "Container discovered");
        }
        created
    }

    /// Record that data for a container was durably stored
    pub fn record_data(&self, key: &ContainerKey, timestamp: Timestamp) {
        if let Some(mut record) = self.containers.get_mut(key) {
            record.last_data_at = Some(record.last_data_at.map_or(timestamp, |t| t.max(timestamp)));
        }
    }

    /// Record metadata and runtime state reported for a container
    pub fn record_state(&self, key: &ContainerKey, point: &ContainerStatePoint) {
        if let Some(mut record) = self.containers.get_mut(key) {
            if point.image.is_some() {
                record.image = point.image.clone();
            }
            if point.created_at.is_some() {
                record.created_at = point.created_at;
            }
            if let Some(state) = point.state {
                if record.run_state != Some(state) {
                    debug!(container = %key, state = %state, "Container state changed");
                }
                record.run_state = Some(state);
                record.state_since = Some(point.since);
            }
        }
    }

    /// Withdraw an agent from a container. The container itself is removed
    /// once no contributor is left; returns `true` in that case.
    pub fn release_container(&self, agent_id: &str, key: &ContainerKey) -> bool {
        if let Some(mut record) = self.agents.get_mut(agent_id) {
            record.reported.remove(key);
            record.declared.remove(key);
        }

        let orphaned = match self.containers.get_mut(key) {
            Some(mut record) => {
                record.contributors.remove(agent_id);
                record.contributors.is_empty()
            }
            None => return false,
        };

        if orphaned {
            self.containers
                .remove_if(key, |_, record| record.contributors.is_empty());
            info!(container = %key, agent_id = %agent_id, "Container removed");
        }
        orphaned
    }

    /// Heartbeat and liveness deadlines for an agent, in milliseconds
    fn deadlines(&self, record: &AgentRecord) -> (i64, i64) {
        let heartbeat = self.config.heartbeat_timeout.as_millis() as i64;
        let liveness = self.config.liveness_timeout.as_millis() as i64;
        match record.heartbeat_interval_secs {
            Some(interval) => {
                let declared = (interval as f64 * 1000.0 * DECLARED_INTERVAL_FACTOR) as i64;
                (heartbeat.max(declared), liveness.max(declared))
            }
            None => (heartbeat, liveness),
        }
    }

    fn is_live(&self, record: &AgentRecord, now: Timestamp) -> bool {
        let (_, liveness) = self.deadlines(record);
        record.state == AgentState::Active && now - record.last_seen <= liveness
    }

    /// Whether an agent currently vouches for its containers
    pub fn is_agent_live(&self, agent_id: &str, now: Timestamp) -> bool {
        self.agents
            .get(agent_id)
            .map(|record| self.is_live(&record, now))
            .unwrap_or(false)
    }

    /// A container is live if any contributing agent is live
    pub fn is_container_live(&self, key: &ContainerKey, now: Timestamp) -> bool {
        let contributors = self.contributors(key);
        contributors
            .iter()
            .any(|agent_id| self.is_agent_live(agent_id, now))
    }

    /// Mark agents that missed their heartbeat deadline as stale
    pub fn sweep(&self, now: Timestamp) -> RegistrySweep {
        let mut report = RegistrySweep::default();

        for mut entry in self.agents.iter_mut() {
            let (heartbeat_deadline, _) = self.deadlines(entry.value());
            let record = entry.value_mut();
            let silent_for = now - record.last_seen;

            if record.state == AgentState::Active && silent_for > heartbeat_deadline {
                record.state = AgentState::Stale;
                report.newly_stale.push((record.agent_id.clone(), silent_for));
            }

            match record.state {
                AgentState::Active => report.active += 1,
                AgentState::Stale => report.stale += 1,
                AgentState::Retired => report.retired += 1,
            }
        }

        report.newly_stale.sort();
        report
    }

    pub fn contributors(&self, key: &ContainerKey) -> Vec<String> {
        self.containers
            .get(key)
            .map(|c| c.contributors.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Containers an agent contributes to
    pub fn containers_of(&self, agent_id: &str) -> Vec<ContainerKey> {
        let mut keys: Vec<ContainerKey> = self
            .containers
            .iter()
            .filter(|c| c.contributors.contains(agent_id))
            .map(|c| c.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn container(&self, key: &ContainerKey) -> Option<ContainerInfo> {
        self.containers.get(key).map(|c| c.info(key))
    }

    pub fn containers(&self) -> Vec<ContainerInfo> {
        let mut all: Vec<ContainerInfo> = self
            .containers
            .iter()
            .map(|c| c.info(c.key()))
            .collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Registry entries of the containers an agent contributes to
    pub fn agent_containers(&self, agent_id: &str) -> Vec<ContainerInfo> {
        self.containers_of(agent_id)
            .iter()
            .filter_map(|key| self.container(key))
            .collect()
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    pub fn agent(&self, agent_id: &str, now: Timestamp) -> Option<AgentInfo> {
        self.snapshot_agent(agent_id, now)
    }

    pub fn agents(&self, now: Timestamp) -> Vec<AgentInfo> {
        let mut ids: Vec<String> = self.agents.iter().map(|a| a.key().clone()).collect();
        ids.sort();
        ids.iter()
            .filter_map(|id| self.snapshot_agent(id, now))
            .collect()
    }

    fn snapshot_agent(&self, agent_id: &str, now: Timestamp) -> Option<AgentInfo> {
        let record = self.agents.get(agent_id)?.value().clone();
        let live = self.is_live(&record, now);
        let containers = self
            .containers_of(agent_id)
            .iter()
            .map(ContainerKey::id)
            .collect();

        Some(AgentInfo {
            agent_id: record.agent_id,
            hostname: record.hostname,
            registered_at: record.registered_at,
            last_seen: record.last_seen,
            scope: record.scope,
            state: record.state,
            live,
            heartbeat_interval_secs: record.heartbeat_interval_secs,
            discovery_interval_secs: record.discovery_interval_secs,
            on_host: record.on_host,
            implicit: record.implicit,
            containers,
        })
    }

    fn placeholder(&self, agent_id: &str, now: Timestamp) -> AgentInfo {
        AgentInfo {
            agent_id: agent_id.to_string(),
            hostname: None,
            registered_at: now,
            last_seen: now,
            scope: Scope::default(),
            state: AgentState::Active,
            live: true,
            heartbeat_interval_secs: None,
            discovery_interval_secs: None,
            on_host: false,
            implicit: false,
            containers: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: i64 = 1000;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(RegistryConfig {
            heartbeat_timeout: Duration::from_secs(60),
            liveness_timeout: Duration::from_secs(90),
        })
    }

    fn containers(ids: &[&str]) -> Scope {
        Scope::Containers(ids.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_register_is_idempotent() {
        let once = registry();
        let twice = registry();
        let reg = Registration::new("a1", containers(&["web", "db"]), 0);

        once.register(&reg, 1_000);
        twice.register(&reg, 1_000);
        twice.register(&reg, 1_000);

        assert_eq!(once.agents(1_000), twice.agents(1_000));
        assert_eq!(once.containers(), twice.containers());
        assert_eq!(twice.container_count(), 2);
    }

    #[test]
    fn test_reregister_updates_scope_and_resets_staleness() {
        let registry = registry();
        registry.register(&Registration::new("a1", containers(&["web", "db"]), 0), 0);

        let report = registry.sweep(61 * SEC);
        assert_eq!(report.newly_stale.len(), 1);
        assert_eq!(registry.agent("a1", 61 * SEC).unwrap().state, AgentState::Stale);

        let handle = registry.register(&Registration::new("a1", containers(&["web"]), 0), 62 * SEC);
        assert_eq!(handle.state, AgentState::Active);
        assert_eq!(handle.containers, vec!["web".to_string()]);
        // db was only declared, never reported: the agent no longer contributes
        assert!(registry
            .contributors(&ContainerKey::standalone("db"))
            .is_empty());
    }

    #[test]
    fn test_heartbeat_from_unknown_agent_registers_implicitly() {
        let registry = registry();
        assert!(!registry.heartbeat("ghost", 5));

        let info = registry.agent("ghost", 5).unwrap();
        assert!(info.implicit);
        assert_eq!(info.scope, Scope::default());
        assert!(registry.heartbeat("ghost", 6));
    }

    #[test]
    fn test_stack_scoped_agent_attributes_items_to_its_stack() {
        let registry = registry();
        registry.register(&Registration::new("stack-agent", Scope::Stack("shop".into()), 0), 0);

        let key = registry.resolve_container("stack-agent", "web", None, 0);
        assert_eq!(key, ContainerKey::in_stack("shop", "web"));
    }

    #[test]
    fn test_shared_container_deduplicated_across_agents() {
        let registry = registry();
        let k1 = registry.resolve_container("a1", "web", Some("shop"), 0);
        let k2 = registry.resolve_container("a2", "web", Some("shop"), 0);

        assert_eq!(k1, k2);
        assert_eq!(registry.container_count(), 1);
        assert_eq!(registry.contributors(&k1), vec!["a1".to_string(), "a2".to_string()]);
    }

    #[test]
    fn test_stack_agent_joins_containers_discovered_later() {
        let registry = registry();
        registry.register(&Registration::new("stack-agent", Scope::Stack("shop".into()), 0), 0);
        let key = registry.resolve_container("host-agent", "db", Some("shop"), 0);

        assert_eq!(
            registry.contributors(&key),
            vec!["host-agent".to_string(), "stack-agent".to_string()]
        );
    }

    #[test]
    fn test_container_live_while_any_contributor_live() {
        let registry = registry();
        let key = registry.resolve_container("a1", "web", None, 0);
        registry.resolve_container("a2", "web", None, 0);

        // a1 keeps heartbeating, a2 goes silent
        registry.heartbeat("a1", 100 * SEC);
        registry.sweep(100 * SEC);
        assert!(!registry.is_agent_live("a2", 100 * SEC));
        assert!(registry.is_container_live(&key, 100 * SEC));

        // both silent
        registry.sweep(200 * SEC);
        assert!(!registry.is_container_live(&key, 200 * SEC));
    }

    #[test]
    fn test_declared_heartbeat_interval_extends_deadline() {
        let registry = registry();
        let mut reg = Registration::new("slow", Scope::default(), 0);
        reg.heartbeat_interval_secs = Some(60);
        registry.register(&reg, 0);

        // 2 * 60s * 1.05 = 126s
        assert!(registry.sweep(120 * SEC).newly_stale.is_empty());
        assert_eq!(registry.sweep(127 * SEC).newly_stale.len(), 1);
    }

    #[test]
    fn test_deregister_retires_agent() {
        let registry = registry();
        let key = registry.resolve_container("a1", "web", None, 0);
        assert!(registry.deregister("a1"));
        assert!(!registry.deregister("nobody"));

        assert_eq!(registry.agent("a1", 0).unwrap().state, AgentState::Retired);
        assert!(!registry.is_container_live(&key, 0));
        // Retired agents keep their historical attribution
        assert_eq!(registry.contributors(&key), vec!["a1".to_string()]);
    }

    #[test]
    fn test_resolve_container_registers_unknown_agent() {
        let registry = registry();
        let key = registry.resolve_container("newcomer", "web", None, 5 * SEC);

        let info = registry.agent("newcomer", 5 * SEC).unwrap();
        assert!(info.implicit);
        assert_eq!(info.containers, vec!["web".to_string()]);
        assert!(registry.is_container_live(&key, 5 * SEC));
        for contributor in registry.contributors(&key) {
            assert!(registry.agent(&contributor, 5 * SEC).is_some());
        }
    }

    #[test]
    fn test_record_state_and_release_container() {
        let registry = registry();
        let key = registry.resolve_container("a1", "web", Some("shop"), 0);
        registry.resolve_container("a2", "web", Some("shop"), 0);

        registry.record_state(
            &key,
            &ContainerStatePoint {
                container: "web".to_string(),
                stack: Some("shop".to_string()),
                state: Some(ContainerRunState::Exited),
                since: 40,
                image: Some("nginx:1.27".to_string()),
                created_at: Some(10),
            },
        );
        let info = registry.container(&key).unwrap();
        assert_eq!(info.id, "shop/web");
        assert_eq!(info.run_state, Some(ContainerRunState::Exited));
        assert_eq!(info.state_since, Some(40));
        assert_eq!(info.image.as_deref(), Some("nginx:1.27"));

        // a2 still reports it
        assert!(!registry.release_container("a1", &key));
        assert_eq!(registry.contributors(&key), vec!["a2".to_string()]);
        assert!(registry.agent("a1", 0).unwrap().containers.is_empty());

        assert!(registry.release_container("a2", &key));
        assert!(registry.container(&key).is_none());
        assert!(!registry.release_container("a2", &key));
    }

    #[test]
    fn test_record_data_keeps_latest_timestamp() {
        let registry = registry();
        let key = registry.resolve_container("a1", "web", None, 0);
        registry.record_data(&key, 500);
        registry.record_data(&key, 300);
        assert_eq!(registry.container(&key).unwrap().last_data_at, Some(500));
    }
}
