//! Transport endpoint
//!
//! Pure decode-and-forward: raw agent envelopes come in, typed events go out to
//! an [`EventSink`] (the ingestion pipeline). No business logic lives here.

mod envelope;

pub use envelope::{decode, Envelope, EnvelopeType, ScopeSpec, ENVELOPE_VERSION, MAX_BATCH_ITEMS};

use crate::error::{IngestError, TransportError};
use crate::models::{now_millis, Event};
use crate::observability::ServerMetrics;
use std::sync::Arc;
use tracing::{debug, warn};

/// Receiver of decoded events
pub trait EventSink: Send + Sync {
    /// Non-blocking hand-off. Returns [`IngestError::Backpressure`] when the
    /// agent's intake queue is full.
    fn submit(&self, event: Event) -> Result<(), IngestError>;
}

/// Receipt for an accepted envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub agent_id: String,
    pub kind: &'static str,
}

/// Decodes agent envelopes and forwards them to the pipeline
#[derive(Clone)]
pub struct TransportEndpoint {
    sink: Arc<dyn EventSink>,
    metrics: ServerMetrics,
}

impl TransportEndpoint {
    pub fn new(sink: Arc<dyn EventSink>, metrics: ServerMetrics) -> Self {
        Self { sink, metrics }
    }

    /// Decode a raw JSON body and submit it
    pub fn submit_bytes(&self, body: &[u8]) -> Result<Accepted, TransportError> {
        match decode(body, now_millis()) {
            Ok(event) => self.submit_event(event),
            Err(e) => self.reject(e.into()),
        }
    }

    /// Validate an already-parsed envelope and submit it
    pub fn submit_envelope(&self, envelope: Envelope) -> Result<Accepted, TransportError> {
        match envelope.into_event(now_millis()) {
            Ok(event) => self.submit_event(event),
            Err(e) => self.reject(e.into()),
        }
    }

    /// Submit an event that was built server-side
    pub fn submit_event(&self, event: Event) -> Result<Accepted, TransportError> {
        let accepted = Accepted {
            agent_id: event.agent_id().to_string(),
            kind: event.kind(),
        };

        match self.sink.submit(event) {
            Ok(()) => {
                self.metrics.inc_events_accepted(accepted.kind);
                debug!(agent_id = %accepted.agent_id, kind = accepted.kind, "Envelope accepted");
                Ok(accepted)
            }
            Err(e) => self.reject(e.into()),
        }
    }

    fn reject(&self, err: TransportError) -> Result<Accepted, TransportError> {
        self.metrics.inc_events_rejected(err.reason());
        match &err {
            TransportError::Decode(e) => warn!(error = %e, "Rejected malformed envelope"),
            TransportError::Ingest(e) => debug!(error = %e, "Envelope refused by pipeline"),
        }
        Err(err)
    }
}
