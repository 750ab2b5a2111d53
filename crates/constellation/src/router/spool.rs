//! Filesystem spool broker shared by every worker process on the host.
//!
//! Layout: `<root>/<queue>/{pending,claimed,done,failed}/<seq>-<id>.json`.
//! The file name starts with the enqueue time in microseconds, then a
//! per-process counter. Jobs from one producer are claimed in enqueue order.
//! Jobs from different producers are ordered by their enqueue timestamps,
//! and jobs sharing a microsecond fall back to counter, then id order.
//!
//! Claims move a file from `pending` to `claimed` with a single `rename`, so
//! only one claimer can win. The claim refreshes the file's mtime; a claim
//! whose holder died stays in `claimed` until [`SpoolBroker::recover_abandoned`]
//! moves it to `failed` once its lease has expired.

use super::broker::{validate_queue_name, Broker, BrokerError, ClaimedJob, Job};
use super::pool::shutdown_requested;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;

const PENDING: &str = "pending";
const CLAIMED: &str = "claimed";
const DONE: &str = "done";
const FAILED: &str = "failed";

#[derive(Debug)]
pub struct SpoolBroker {
    root: PathBuf,
    counter: AtomicU32,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> BrokerError + '_ {
    move |source| BrokerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl SpoolBroker {
    /// Open a spool rooted at `root`, creating the directory if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BrokerError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(io_err(&root))?;
        Ok(Self {
            root,
            counter: AtomicU32::new(0),
        })
    }

    fn dir(&self, queue: &str, state: &str) -> PathBuf {
        self.root.join(queue).join(state)
    }

    async fn ensure_queue(&self, queue: &str) -> Result<(), BrokerError> {
        validate_queue_name(queue)?;
        for state in [PENDING, CLAIMED, DONE, FAILED] {
            let dir = self.dir(queue, state);
            tokio::fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;
        }
        Ok(())
    }

    /// Sortable file name: enqueue time, then a per-process counter
    fn file_name(&self, job: &Job) -> String {
        let micros = job.enqueued_at.timestamp_micros().max(0);
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{:020}-{:010}-{}.json", micros, seq, job.id)
    }

    /// Pending job file names in FIFO order
    async fn pending_files(&self, queue: &str) -> Result<Vec<String>, BrokerError> {
        let dir = self.dir(queue, PENDING);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&dir)(e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&dir))? {
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') && name.ends_with(".json") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn settle(&self, claim: &ClaimedJob, state: &str) -> Result<PathBuf, BrokerError> {
        let from = self.dir(&claim.job.queue, CLAIMED).join(&claim.receipt);
        let to = self.dir(&claim.job.queue, state).join(&claim.receipt);
        match tokio::fs::rename(&from, &to).await {
            Ok(()) => Ok(to),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(BrokerError::UnknownClaim(claim.receipt.clone()))
            }
            Err(e) => Err(io_err(&from)(e)),
        }
    }

    /// Number of pending jobs in `queue`
    pub async fn pending(&self, queue: &str) -> Result<usize, BrokerError> {
        Ok(self.pending_files(queue).await?.len())
    }

    /// Move every claim held for at least `lease` to `failed`, with a
    /// `.reason` file. Returns how many claims were recovered.
    pub async fn recover_abandoned(&self, lease: Duration) -> Result<usize, BrokerError> {
        let mut queues = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_err(&self.root)(e)),
        };

        let now = SystemTime::now();
        let mut recovered = 0;
        while let Some(entry) = queues.next_entry().await.map_err(io_err(&self.root))? {
            let Some(queue) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_queue_name(&queue).is_err() {
                continue;
            }

            let claimed = self.dir(&queue, CLAIMED);
            let mut claims = match tokio::fs::read_dir(&claimed).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err(&claimed)(e)),
            };

            while let Some(claim) = claims.next_entry().await.map_err(io_err(&claimed))? {
                let Some(name) = claim.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                if !name.ends_with(".json") {
                    continue;
                }

                // Settled by its holder since the listing
                let modified = match claim.metadata().await.and_then(|m| m.modified()) {
                    Ok(modified) => modified,
                    Err(_) => continue,
                };
                let held = now.duration_since(modified).unwrap_or_default();
                if held < lease {
                    continue;
                }

                let failed = self.dir(&queue, FAILED).join(&name);
                match tokio::fs::rename(claim.path(), &failed).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(io_err(&failed)(e)),
                }

                let reason = format!("abandoned: claim held for {:?}, lease is {:?}", held, lease);
                let reason_path = failed.with_extension("reason");
                tokio::fs::write(&reason_path, &reason)
                    .await
                    .map_err(io_err(&reason_path))?;

                log::warn!("Recovered abandoned job {} on '{}'", name, queue);
                recovered += 1;
            }
        }

        Ok(recovered)
    }

    /// Run [`recover_abandoned`](Self::recover_abandoned) every `every` until
    /// `shutdown` fires
    pub async fn sweep_abandoned(
        &self,
        lease: Duration,
        every: Duration,
        mut shutdown: watch::Receiver<()>,
    ) {
        loop {
            if let Err(e) = self.recover_abandoned(lease).await {
                log::warn!("Spool sweep failed: {}", e);
            }
            tokio::select! {
                _ = tokio::time::sleep(every) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
    }
}

/// Restart the lease clock of a freshly claimed file
async fn touch(path: &Path) -> std::io::Result<()> {
    let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.into_std().await.set_modified(SystemTime::now())
}

#[async_trait]
impl Broker for SpoolBroker {
    async fn enqueue(&self, job: Job) -> Result<(), BrokerError> {
        self.ensure_queue(&job.queue).await?;

        let name = self.file_name(&job);
        let pending = self.dir(&job.queue, PENDING);
        let tmp = pending.join(format!(".{}.tmp", name));
        let target = pending.join(&name);

        let body = serde_json::to_vec_pretty(&job)?;
        tokio::fs::write(&tmp, body).await.map_err(io_err(&tmp))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(io_err(&target))?;

        log::debug!("Enqueued job {} on '{}'", job.id, job.queue);
        Ok(())
    }

    async fn claim(&self, queue: &str) -> Result<Option<ClaimedJob>, BrokerError> {
        validate_queue_name(queue)?;

        for name in self.pending_files(queue).await? {
            let from = self.dir(queue, PENDING).join(&name);
            let claimed_dir = self.dir(queue, CLAIMED);
            let to = claimed_dir.join(&name);

            match tokio::fs::rename(&from, &to).await {
                Ok(()) => {}
                // Another worker won the race
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err(&from)(e)),
            }

            if let Err(e) = touch(&to).await {
                log::warn!("Cannot refresh claim time of {}: {}", name, e);
            }

            let body = tokio::fs::read(&to).await.map_err(io_err(&to))?;
            match serde_json::from_slice::<Job>(&body) {
                Ok(job) => {
                    return Ok(Some(ClaimedJob {
                        job,
                        receipt: name,
                    }))
                }
                Err(e) => {
                    log::warn!("Discarding unreadable job file {}: {}", name, e);
                    let failed = self.dir(queue, FAILED).join(&name);
                    tokio::fs::rename(&to, &failed)
                        .await
                        .map_err(io_err(&failed))?;
                }
            }
        }

        Ok(None)
    }

    async fn ack(&self, claim: &ClaimedJob) -> Result<(), BrokerError> {
        self.settle(claim, DONE).await?;
        Ok(())
    }

    async fn fail(&self, claim: &ClaimedJob, reason: &str) -> Result<(), BrokerError> {
        let path = self.settle(claim, FAILED).await?;
        let reason_path = path.with_extension("reason");
        tokio::fs::write(&reason_path, reason)
            .await
            .map_err(io_err(&reason_path))?;
        Ok(())
    }
}
