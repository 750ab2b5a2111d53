//! In-process broker for tests and embedding.
//!
//! Jobs are not visible outside the process and are lost on exit.

use super::broker::{validate_queue_name, Broker, BrokerError, ClaimedJob, Job};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A job that was marked failed
#[derive(Debug, Clone)]
pub struct FailedJob {
    pub job: Job,
    pub reason: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    pending: HashMap<String, VecDeque<Job>>,
    claimed: HashMap<String, Job>,
    done: Vec<Job>,
    failed: Vec<FailedJob>,
    polls: HashMap<String, usize>,
}

#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<MemoryState>,
}

fn poison_err<T>(_: PoisonError<T>) -> BrokerError {
    BrokerError::Poisoned
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, BrokerError> {
        self.state.lock().map_err(poison_err)
    }

    /// Number of jobs waiting in `queue`
    pub fn pending(&self, queue: &str) -> usize {
        self.lock()
            .map(|state| state.pending.get(queue).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    /// Jobs acknowledged as completed
    pub fn completed(&self) -> Vec<Job> {
        self.lock().map(|state| state.done.clone()).unwrap_or_default()
    }

    /// Jobs marked failed
    pub fn failed(&self) -> Vec<FailedJob> {
        self.lock().map(|state| state.failed.clone()).unwrap_or_default()
    }

    /// Number of claim attempts made against `queue`
    pub fn polls(&self, queue: &str) -> usize {
        self.lock()
            .map(|state| state.polls.get(queue).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn settle(&self, claim: &ClaimedJob) -> Result<(MutexGuard<'_, MemoryState>, Job), BrokerError> {
        let mut state = self.lock()?;
        let job = state
            .claimed
            .remove(&claim.receipt)
            .ok_or_else(|| BrokerError::UnknownClaim(claim.receipt.clone()))?;
        Ok((state, job))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, job: Job) -> Result<(), BrokerError> {
        validate_queue_name(&job.queue)?;
        let mut state = self.lock()?;
        state
            .pending
            .entry(job.queue.clone())
            .or_default()
            .push_back(job);
        Ok(())
    }

    async fn claim(&self, queue: &str) -> Result<Option<ClaimedJob>, BrokerError> {
        let mut state = self.lock()?;
        *state.polls.entry(queue.to_string()).or_default() += 1;

        let Some(job) = state.pending.get_mut(queue).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };

        let receipt = job.id.clone();
        state.claimed.insert(receipt.clone(), job.clone());
        Ok(Some(ClaimedJob { job, receipt }))
    }

    async fn ack(&self, claim: &ClaimedJob) -> Result<(), BrokerError> {
        let (mut state, job) = self.settle(claim)?;
        state.done.push(job);
        Ok(())
    }

    async fn fail(&self, claim: &ClaimedJob, reason: &str) -> Result<(), BrokerError> {
        let (mut state, job) = self.settle(claim)?;
        state.failed.push(FailedJob {
            job,
            reason: reason.to_string(),
        });
        Ok(())
    }
}
