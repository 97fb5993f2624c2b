//! Ingestion pipeline
//!
//! Every agent gets its own bounded intake queue and worker task, so events
//! from one agent are processed in arrival order while agents proceed
//! independently. A full queue is reported to the caller as backpressure;
//! submission never blocks. A worker that stays idle releases its queue and
//! exits; the next event from that agent starts a fresh one.

mod retry;

pub use retry::{Exhausted, RetryPolicy};

use crate::engine::{HealthEngine, LogSignal, MetricSignal, RunStateSignal};
use crate::error::IngestError;
use crate::health::{components, HealthRegistry, ProgressTracker};
use crate::models::{
    now_millis, ContainerKey, ContainerRef, ContainerStatePoint, Event, LogLine, LogPoint,
    MetricPoint, MetricSample, Timestamp,
};
use crate::observability::{ServerMetrics, StructuredLogger};
use crate::registry::AgentRegistry;
use crate::store::Store;
use crate::transport::EventSink;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default per-agent intake queue capacity
pub const DEFAULT_INTAKE_CAPACITY: usize = 256;

/// Default time an intake worker waits for events before releasing its queue
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub intake_capacity: usize,
    pub idle_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            intake_capacity: DEFAULT_INTAKE_CAPACITY,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Collaborators the pipeline routes events to
pub struct PipelineDeps {
    pub registry: Arc<AgentRegistry>,
    pub store: Arc<dyn Store>,
    pub engine: Arc<HealthEngine>,
    pub health: HealthRegistry,
    pub progress: ProgressTracker,
    pub metrics: ServerMetrics,
    pub logger: StructuredLogger,
}

struct Shared {
    deps: PipelineDeps,
    retry: RetryPolicy,
    store_degraded: AtomicBool,
    /// Events accepted into a queue and not yet fully processed
    backlog: AtomicUsize,
}

/// One agent's intake queue and the worker draining it
struct AgentQueue {
    tx: mpsc::Sender<Event>,
    worker: JoinHandle<()>,
}

type Queues = Arc<DashMap<String, AgentQueue>>;

/// Validates and fans out decoded events to registry, store and health engine
pub struct IngestPipeline {
    shared: Arc<Shared>,
    queues: Queues,
    capacity: usize,
    idle_timeout: Duration,
    closing: AtomicBool,
}

impl IngestPipeline {
    pub fn new(deps: PipelineDeps, config: PipelineConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                deps,
                retry: config.retry,
                store_degraded: AtomicBool::new(false),
                backlog: AtomicUsize::new(0),
            }),
            queues: Arc::new(DashMap::new()),
            capacity: config.intake_capacity.max(1),
            idle_timeout: config.idle_timeout,
            closing: AtomicBool::new(false),
        }
    }

    /// Process one event inline, bypassing the intake queues
    pub async fn ingest(&self, event: Event) {
        self.shared.ingest(event, now_millis()).await;
    }

    /// Like [`ingest`](Self::ingest), with an explicit receive time
    pub async fn ingest_at(&self, event: Event, now: Timestamp) {
        self.shared.ingest(event, now).await;
    }

    fn spawn_worker(&self, agent_id: &str) -> AgentQueue {
        let (tx, mut rx) = mpsc::channel::<Event>(self.capacity);
        let shared = Arc::clone(&self.shared);
        let queues = Arc::clone(&self.queues);
        let idle_timeout = self.idle_timeout;
        let agent = agent_id.to_string();

        let worker = tokio::spawn(async move {
            debug!(agent_id = %agent, "Intake worker started");
            loop {
                match tokio::time::timeout(idle_timeout, rx.recv()).await {
                    Ok(Some(event)) => shared.process(event).await,
                    Ok(None) => break,
                    Err(_) => {
                        // refuse new events, finish the ones that raced in, then
                        // give up the slot unless a fresh queue already replaced it
                        rx.close();
                        while let Some(event) = rx.recv().await {
                            shared.process(event).await;
                        }
                        queues.remove_if(&agent, |_, queue| queue.tx.is_closed());
                        debug!(agent_id = %agent, "Intake worker idle, queue released");
                        return;
                    }
                }
            }
            debug!(agent_id = %agent, "Intake worker stopped");
        });

        AgentQueue { tx, worker }
    }

    /// Events waiting in an agent's intake queue
    pub fn queued(&self, agent_id: &str) -> usize {
        self.queues
            .get(agent_id)
            .map(|queue| self.capacity - queue.tx.capacity())
            .unwrap_or(0)
    }

    /// Agents that currently have an intake queue and worker
    pub fn active_queues(&self) -> usize {
        self.queues.len()
    }

    /// Events accepted but not yet processed, across all agents
    pub fn backlog(&self) -> usize {
        self.shared.backlog.load(Ordering::SeqCst)
    }

    /// Retire an agent: it stops vouching for its containers, which are
    /// re-evaluated right away. An empty intake queue is released now; one
    /// still holding events is left to drain and go idle, keeping order.
    /// Returns `false` for an unknown agent.
    pub async fn retire(&self, agent_id: &str, now: Timestamp) -> bool {
        if !self.shared.deps.registry.deregister(agent_id) {
            return false;
        }
        // dropping the sender ends the worker
        self.queues
            .remove_if(agent_id, |_, queue| queue.tx.capacity() == queue.tx.max_capacity());
        self.shared.refresh_agent(agent_id, now).await;
        true
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Stop accepting events and let queued ones drain within `grace`.
    /// Returns `true` if every worker finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.closing.store(true, Ordering::SeqCst);
        // dropping the senders ends each worker once its queue is empty
        let agents: Vec<String> = self.queues.iter().map(|q| q.key().clone()).collect();
        let handles: Vec<JoinHandle<()>> = agents
            .iter()
            .filter_map(|agent| self.queues.remove(agent))
            .map(|(_, queue)| queue.worker)
            .collect();
        let count = handles.len();

        let drained = tokio::time::timeout(grace, async move {
            for handle in handles {
                let _ = handle.await;
            }
        })
        .await
        .is_ok();

        if drained {
            info!(workers = count, "Intake drained");
        } else {
            warn!(
                workers = count,
                grace_ms = grace.as_millis() as u64,
                "Intake did not drain within grace period"
            );
        }
        drained
    }
}

impl EventSink for IngestPipeline {
    fn submit(&self, event: Event) -> Result<(), IngestError> {
        if self.is_closing() {
            return Err(IngestError::Closed);
        }

        let agent_id = event.agent_id().to_string();
        let sender = {
            let mut queue = self
                .queues
                .entry(agent_id.clone())
                .or_insert_with(|| self.spawn_worker(&agent_id));
            if queue.tx.is_closed() && queue.worker.is_finished() {
                warn!(agent_id = %agent_id, "Intake worker ended unexpectedly, restarting");
                *queue = self.spawn_worker(&agent_id);
            }
            queue.tx.clone()
        };

        // counted before the hand-off so the worker never decrements first
        self.shared.backlog.fetch_add(1, Ordering::SeqCst);
        match sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.shared.backlog.fetch_sub(1, Ordering::SeqCst);
                Err(IngestError::Backpressure { agent_id })
            }
            // an idle worker is finishing up; the agent retries into a fresh queue
            Err(TrySendError::Closed(_)) => {
                self.shared.backlog.fetch_sub(1, Ordering::SeqCst);
                Err(IngestError::Backpressure { agent_id })
            }
        }
    }
}

impl Shared {
    /// Process a queued event
    async fn process(&self, event: Event) {
        self.ingest(event, now_millis()).await;
        self.backlog.fetch_sub(1, Ordering::SeqCst);
    }

    async fn ingest(&self, event: Event, now: Timestamp) {
        let started = Instant::now();

        match event {
            Event::Heartbeat { agent_id, .. } => {
                if !self.deps.registry.heartbeat(&agent_id, now) {
                    self.deps.logger.log_agent_registered(&agent_id, true, 0);
                }
                self.refresh_agent(&agent_id, now).await;
            }
            Event::Registration(registration) => {
                let handle = self.deps.registry.register(&registration, now);
                self.deps.logger.log_agent_registered(
                    &registration.agent_id,
                    false,
                    handle.containers.len(),
                );
                self.refresh_agent(&registration.agent_id, now).await;
            }
            Event::MetricBatch {
                agent_id, samples, ..
            } => self.ingest_metrics(&agent_id, samples, now).await,
            Event::LogBatch { agent_id, lines, .. } => {
                self.ingest_logs(&agent_id, lines, now).await
            }
            Event::ContainerState {
                agent_id, states, ..
            } => self.ingest_states(&agent_id, states, now).await,
            Event::ContainerRemoved {
                agent_id,
                containers,
                ..
            } => self.remove_containers(&agent_id, containers, now).await,
        }

        self.deps.progress.mark(now);
        self.deps
            .metrics
            .observe_ingest_latency(started.elapsed().as_secs_f64());
    }

    fn touch_agent(&self, agent_id: &str, now: Timestamp) {
        if !self.deps.registry.touch(agent_id, now) {
            warn!(agent_id = %agent_id, "Data from unknown agent, registering implicitly");
            self.deps.logger.log_agent_registered(agent_id, true, 0);
        }
    }

    /// Re-evaluate every container the agent contributes to
    async fn refresh_agent(&self, agent_id: &str, now: Timestamp) {
        for key in self.deps.registry.containers_of(agent_id) {
            let live = self.deps.registry.is_container_live(&key, now);
            self.deps.engine.track(&key, now);
            self.deps.engine.reevaluate(&key, live, now).await;
        }
    }

    async fn ingest_metrics(&self, agent_id: &str, points: Vec<MetricPoint>, now: Timestamp) {
        self.touch_agent(agent_id, now);
        let mut batches = ContainerBatches::default();

        for point in points {
            let key = self.deps.registry.resolve_container(
                agent_id,
                &point.container,
                point.stack.as_deref(),
                now,
            );
            self.deps.engine.track(&key, now);

            let sample = MetricSample {
                container: key.clone(),
                metric: point.metric.clone(),
                value: point.value,
                timestamp: point.timestamp,
                agent_id: agent_id.to_string(),
                out_of_order: false,
            };

            let store = &self.deps.store;
            let metrics = &self.deps.metrics;
            let written = self
                .retry
                .run(move |attempt| {
                    if attempt > 1 {
                        metrics.inc_store_write_retries();
                    }
                    store.append_metric(sample.clone())
                })
                .await;

            match written {
                Ok(outcome) => {
                    if outcome.out_of_order {
                        self.deps.metrics.inc_out_of_order_samples();
                    }
                    self.deps.registry.record_data(&key, point.timestamp);
                    self.store_recovered().await;
                    batches.metrics(&key).push(MetricSignal {
                        metric: point.metric,
                        value: point.value,
                        timestamp: point.timestamp,
                    });
                }
                Err(exhausted) => self.dropped(agent_id, &key, "metric", exhausted).await,
            }
        }

        for (key, signals) in batches.into_metrics() {
            let live = self.deps.registry.is_container_live(&key, now);
            self.deps.engine.on_metrics(&key, &signals, live, now).await;
        }
    }

    async fn ingest_logs(&self, agent_id: &str, points: Vec<LogPoint>, now: Timestamp) {
        self.touch_agent(agent_id, now);
        let mut batches = ContainerBatches::default();

        for point in points {
            let key = self.deps.registry.resolve_container(
                agent_id,
                &point.container,
                point.stack.as_deref(),
                now,
            );
            self.deps.engine.track(&key, now);

            let line = LogLine {
                container: key.clone(),
                timestamp: point.timestamp,
                text: point.text.clone(),
                agent_id: agent_id.to_string(),
                level: point.level.clone(),
                stream: point.stream,
                repeat: 1,
            };

            let store = &self.deps.store;
            let metrics = &self.deps.metrics;
            let written = self
                .retry
                .run(move |attempt| {
                    if attempt > 1 {
                        metrics.inc_store_write_retries();
                    }
                    store.append_log(line.clone())
                })
                .await;

            match written {
                Ok(_) => {
                    self.deps.registry.record_data(&key, point.timestamp);
                    self.store_recovered().await;
                    batches.logs(&key).push(LogSignal {
                        text: point.text,
                        level: point.level,
                        timestamp: point.timestamp,
                    });
                }
                Err(exhausted) => self.dropped(agent_id, &key, "log", exhausted).await,
            }
        }

        for (key, signals) in batches.into_logs() {
            let live = self.deps.registry.is_container_live(&key, now);
            self.deps.engine.on_logs(&key, &signals, live, now).await;
        }
    }

    async fn ingest_states(&self, agent_id: &str, points: Vec<ContainerStatePoint>, now: Timestamp) {
        self.touch_agent(agent_id, now);

        for point in points {
            let key = self.deps.registry.resolve_container(
                agent_id,
                &point.container,
                point.stack.as_deref(),
                now,
            );
            self.deps.engine.track(&key, now);
            self.deps.registry.record_state(&key, &point);

            if let Some(state) = point.state {
                let live = self.deps.registry.is_container_live(&key, now);
                let signal = RunStateSignal {
                    state,
                    since: point.since,
                    reported_at: now,
                };
                self.deps.engine.on_state(&key, signal, live, now).await;
            }
        }
    }

    /// The agent no longer reports these containers. A container nobody
    /// reports any more is forgotten along with its history.
    async fn remove_containers(&self, agent_id: &str, containers: Vec<ContainerRef>, now: Timestamp) {
        self.touch_agent(agent_id, now);

        for container in containers {
            let key = self.deps.registry.container_key(
                agent_id,
                &container.container,
                container.stack.as_deref(),
            );
            if self.deps.registry.release_container(agent_id, &key) {
                self.deps.engine.forget(&key);
                self.deps.store.remove_container(&key).await;
            } else {
                let live = self.deps.registry.is_container_live(&key, now);
                self.deps.engine.reevaluate(&key, live, now).await;
            }
        }
    }

    async fn dropped(&self, agent_id: &str, key: &ContainerKey, kind: &str, exhausted: Exhausted) {
        self.deps.metrics.inc_events_dropped(kind);
        self.deps.metrics.inc_store_write_failures();
        self.deps.logger.log_dropped(
            agent_id,
            &key.id(),
            kind,
            exhausted.attempts,
            &exhausted.last_error.to_string(),
        );

        if !self.store_degraded.swap(true, Ordering::SeqCst) {
            self.deps
                .health
                .set_degraded(components::STORE, exhausted.last_error.to_string())
                .await;
        }
    }

    async fn store_recovered(&self) {
        if self.store_degraded.swap(false, Ordering::SeqCst) {
            info!("Store writes succeeding again");
            self.deps.health.set_healthy(components::STORE).await;
        }
    }
}

/// Signals of one batch grouped by container, in first-seen order
#[derive(Default)]
struct ContainerBatches {
    order: Vec<ContainerKey>,
    metrics: HashMap<ContainerKey, Vec<MetricSignal>>,
    logs: HashMap<ContainerKey, Vec<LogSignal>>,
}

impl ContainerBatches {
    fn note(&mut self, key: &ContainerKey) {
        if !self.order.contains(key) {
            self.order.push(key.clone());
        }
    }

    fn metrics(&mut self, key: &ContainerKey) -> &mut Vec<MetricSignal> {
        self.note(key);
        self.metrics.entry(key.clone()).or_default()
    }

    fn logs(&mut self, key: &ContainerKey) -> &mut Vec<LogSignal> {
        self.note(key);
        self.logs.entry(key.clone()).or_default()
    }

    fn into_metrics(mut self) -> Vec<(ContainerKey, Vec<MetricSignal>)> {
        self.order
            .into_iter()
            .filter_map(|key| self.metrics.remove(&key).map(|s| (key, s)))
            .collect()
    }

    fn into_logs(mut self) -> Vec<(ContainerKey, Vec<LogSignal>)> {
        self.order
            .into_iter()
            .filter_map(|key| self.logs.remove(&key).map(|s| (key, s)))
            .collect()
    }
}
