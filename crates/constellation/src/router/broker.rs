//! Broker capability and job records

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A unit of work submitted to a named queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    /// Program followed by its arguments
    pub command: Vec<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn new<I, S>(queue: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            queue: queue.into(),
            command: command.into_iter().map(Into::into).collect(),
            enqueued_at: Utc::now(),
        }
    }
}

/// A job held exclusively by one pull-loop until it is acked or failed
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    /// Broker-specific handle for the claim
    pub receipt: String,
}

/// Queue broker capability.
///
/// Claims are exclusive at the broker: a job returned by `claim` is never
/// handed to another caller, in this process or any other sharing the broker.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn enqueue(&self, job: Job) -> Result<(), BrokerError>;

    /// Claim the oldest pending job of `queue`, `None` if the queue is empty
    async fn claim(&self, queue: &str) -> Result<Option<ClaimedJob>, BrokerError>;

    async fn ack(&self, claim: &ClaimedJob) -> Result<(), BrokerError>;

    /// Record the job as failed. The broker does not retry it.
    async fn fail(&self, claim: &ClaimedJob, reason: &str) -> Result<(), BrokerError>;
}

/// Queue names become directory names, so keep them plain
pub fn validate_queue_name(name: &str) -> Result<(), BrokerError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

    if valid {
        Ok(())
    } else {
        Err(BrokerError::InvalidQueue(name.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Invalid queue name: '{0}'")]
    InvalidQueue(String),

    #[error("Unknown claim: {0}")]
    UnknownClaim(String),

    #[error("Spool I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed job record: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Broker state lock poisoned")]
    Poisoned,
}
