//! Worker pool: independent pull-loops over an ordered list of queues

use super::broker::{validate_queue_name, Broker, BrokerError, ClaimedJob};
use super::handler::JobHandler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Which queues a pool serves, in priority order, and with how many loops
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub name: String,
    pub queues: Vec<String>,
    pub concurrency: usize,
}

impl QueueBinding {
    pub fn new<I, S>(name: impl Into<String>, queues: I, concurrency: usize) -> Result<Self, RouterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let name = name.into();
        let queues: Vec<String> = queues
            .into_iter()
            .map(|q| q.as_ref().trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();

        if queues.is_empty() {
            return Err(RouterError::InvalidBinding(format!(
                "pool '{}' has no queues",
                name
            )));
        }
        if concurrency == 0 {
            return Err(RouterError::InvalidBinding(format!(
                "pool '{}' needs at least one worker",
                name
            )));
        }
        for queue in &queues {
            validate_queue_name(queue)?;
        }

        Ok(Self {
            name,
            queues,
            concurrency,
        })
    }

    /// Build a binding from a comma separated queue list such as `default,ocr`
    pub fn parse(name: impl Into<String>, list: &str, concurrency: usize) -> Result<Self, RouterError> {
        Self::new(name, parse_queue_list(list), concurrency)
    }
}

/// Split a comma separated list, dropping blank entries
pub fn parse_queue_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_string)
        .collect()
}

/// Pull-loop tuning
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Wait after a cycle in which every queue was empty
    pub poll_interval: Duration,
    /// Longest a single job may run before it is aborted and failed
    pub job_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            job_timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// Totals over all pull-loops of a pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub cycles: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl PoolReport {
    fn merge(&mut self, other: PoolReport) {
        self.cycles += other.cycles;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
    }
}

/// Run `binding.concurrency` pull-loops until `shutdown` fires.
///
/// Each cycle polls the queues in order and claims at most one job. Handler
/// errors and panics fail that job only; the loop carries on.
pub async fn serve<B, H>(
    binding: &QueueBinding,
    broker: Arc<B>,
    handler: Arc<H>,
    config: PoolConfig,
    shutdown: watch::Receiver<()>,
) -> Result<PoolReport, RouterError>
where
    B: Broker + ?Sized,
    H: JobHandler + ?Sized,
{
    log::info!(
        "Worker pool '{}' serving [{}] with {} workers",
        binding.name,
        binding.queues.join(", "),
        binding.concurrency
    );

    let queues: Arc<[String]> = binding.queues.clone().into();
    let mut loops = JoinSet::new();
    for index in 0..binding.concurrency {
        let pull = PullLoop {
            worker: format!("{}.{}", binding.name, index),
            queues: Arc::clone(&queues),
            broker: Arc::clone(&broker),
            handler: Arc::clone(&handler),
            poll_interval: config.poll_interval,
            job_timeout: config.job_timeout,
            shutdown: shutdown.clone(),
        };
        loops.spawn(pull.run());
    }

    let mut report = PoolReport::default();
    let mut aborted = None;
    while let Some(joined) = loops.join_next().await {
        match joined {
            Ok(stats) => report.merge(stats),
            Err(e) => {
                log::error!("[{}] Pull-loop aborted: {}", binding.name, e);
                aborted = Some(e.to_string());
            }
        }
    }

    log::info!(
        "Worker pool '{}' stopped: {} jobs succeeded, {} failed",
        binding.name,
        report.succeeded,
        report.failed
    );

    match aborted {
        Some(cause) => Err(RouterError::LoopAborted(cause)),
        None => Ok(report),
    }
}

struct PullLoop<B: ?Sized, H: ?Sized> {
    worker: String,
    queues: Arc<[String]>,
    broker: Arc<B>,
    handler: Arc<H>,
    poll_interval: Duration,
    job_timeout: Option<Duration>,
    shutdown: watch::Receiver<()>,
}

impl<B, H> PullLoop<B, H>
where
    B: Broker + ?Sized,
    H: JobHandler + ?Sized,
{
    async fn run(mut self) -> PoolReport {
        let mut stats = PoolReport::default();

        loop {
            if self.shutdown.has_changed().unwrap_or(false) {
                break;
            }
            stats.cycles += 1;

            match self.poll().await {
                Some(claim) => {
                    if self.execute(claim).await {
                        stats.succeeded += 1;
                    } else {
                        stats.failed += 1;
                    }
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown_requested(&mut self.shutdown) => break,
                    }
                }
            }
        }

        log::debug!("[{}] Pull-loop stopped after {} cycles", self.worker, stats.cycles);
        stats
    }

    /// One pass over the queues in priority order. An empty or unreachable
    /// queue falls through to the next one.
    async fn poll(&self) -> Option<ClaimedJob> {
        for queue in self.queues.iter() {
            match self.broker.claim(queue).await {
                Ok(Some(claim)) => return Some(claim),
                Ok(None) => {}
                Err(e) => log::warn!("[{}] Claim on '{}' failed: {}", self.worker, queue, e),
            }
        }
        None
    }

    /// Run the handler and settle the claim; true on success
    async fn execute(&self, claim: ClaimedJob) -> bool {
        let job = claim.job.clone();
        log::info!("[{}] Running job {} from '{}'", self.worker, job.id, job.queue);

        let handler = Arc::clone(&self.handler);
        let task = tokio::spawn(async move { handler.handle(&job).await });
        let abort = task.abort_handle();

        let result = match self.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(result) => Some(result),
                Err(_) => {
                    abort.abort();
                    None
                }
            },
            None => Some(task.await),
        };

        let failure = match result {
            Some(Ok(Ok(()))) => None,
            Some(Ok(Err(e))) => Some(e.to_string()),
            Some(Err(e)) => Some(format!("handler panicked: {}", e)),
            None => Some(format!(
                "timed out after {:?}",
                self.job_timeout.unwrap_or_default()
            )),
        };

        match failure {
            None => {
                if let Err(e) = self.broker.ack(&claim).await {
                    log::warn!("[{}] Failed to ack job {}: {}", self.worker, claim.job.id, e);
                }
                true
            }
            Some(reason) => {
                log::error!("[{}] Job {} failed: {}", self.worker, claim.job.id, reason);
                if let Err(e) = self.broker.fail(&claim, &reason).await {
                    log::warn!(
                        "[{}] Failed to record failure of job {}: {}",
                        self.worker,
                        claim.job.id,
                        e
                    );
                }
                false
            }
        }
    }
}

/// Resolves once shutdown is signalled; never resolves if the sender is gone
pub(super) async fn shutdown_requested(shutdown: &mut watch::Receiver<()>) {
    if shutdown.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Invalid queue binding: {0}")]
    InvalidBinding(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Pull-loop aborted: {0}")]
    LoopAborted(String),
}
