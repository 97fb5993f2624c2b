//! Error taxonomy
//!
//! Per-event errors never cross event or container boundaries. Only
//! [`ConfigError`] is fatal, and only at startup.

use thiserror::Error;

/// A malformed agent envelope. Rejected with a client error; the pipeline continues.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u32),

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl DecodeError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        DecodeError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Submission to the ingestion pipeline was refused
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IngestError {
    /// The agent's intake queue is full; the agent should retry from its own buffer
    #[error("intake queue for agent `{agent_id}` is full")]
    Backpressure { agent_id: String },

    #[error("ingestion pipeline is shutting down")]
    Closed,
}

/// A failed store write. Retried with backoff, then dropped and counted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Invalid configuration. Prevents the server from starting.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid threshold rule `{rule}`: {reason}")]
    InvalidThresholdRule { rule: String, reason: String },

    #[error("invalid log pattern rule `{name}`: {source}")]
    InvalidLogPattern {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid setting `{key}`: {reason}")]
    InvalidSetting { key: &'static str, reason: String },
}

/// Outcome of a transport-level submission that did not get accepted
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Ingest(#[from] IngestError),
}

impl TransportError {
    /// Short machine-readable rejection reason, used as a metrics label
    pub fn reason(&self) -> &'static str {
        match self {
            TransportError::Decode(_) => "decode",
            TransportError::Ingest(IngestError::Backpressure { .. }) => "backpressure",
            TransportError::Ingest(IngestError::Closed) => "closed",
        }
    }
}
