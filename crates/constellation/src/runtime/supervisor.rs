//! Supervisor - launches every service concurrently and keeps them alive
//!
//! Each service runs in its own task through the state machine
//! `Pending → Starting → Running → {Exited, Crashed} → (Restarting → Starting)*`.
//! The supervisor itself only reacts to two things: the external shutdown
//! signal and the final report of each service task.

use crate::cli::{EXIT_CRITICAL_FAILURE, EXIT_OK};
use crate::config::ServiceDescriptor;
use crate::runtime::dependency::{DependencyError, DependencyGraph};
use crate::runtime::launcher::Launcher;
use crate::runtime::policy::{BackoffPolicy, ExitOutcome};
use crate::runtime::process::{ProcessConfig, ServiceState};
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long a child gets between SIGTERM and SIGKILL
    pub grace_period: Duration,
    /// Restart backoff shared by every service
    pub backoff: BackoffPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Observable status of one service
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub state: ServiceState,
    /// Number of launch attempts so far
    pub launches: u32,
    /// Whether the service ever reached `Running`
    pub ever_running: bool,
    /// Whether supervision of the service has ended
    pub finished: bool,
    pub last_outcome: Option<ExitOutcome>,
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self {
            state: ServiceState::Pending,
            launches: 0,
            ever_running: false,
            finished: false,
            last_outcome: None,
        }
    }
}

/// Final summary line for one service
#[derive(Debug, Clone)]
pub struct ServiceSummary {
    pub name: String,
    pub state: ServiceState,
    pub launches: u32,
    pub last_outcome: Option<ExitOutcome>,
}

/// Why the supervisor returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Every service finished on its own
    Completed,
    /// A shutdown signal was received
    Shutdown,
    /// A critical service failed and was not restarted
    CriticalFailure { service: String, cause: String },
}

/// Result of a supervision run
#[derive(Debug, Clone)]
pub struct SupervisorOutcome {
    pub reason: StopReason,
    pub services: Vec<ServiceSummary>,
}

impl SupervisorOutcome {
    /// Process exit code for this outcome
    pub fn exit_code(&self) -> i32 {
        match self.reason {
            StopReason::CriticalFailure { .. } => EXIT_CRITICAL_FAILURE,
            StopReason::Completed | StopReason::Shutdown => EXIT_OK,
        }
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSummary> {
        self.services.iter().find(|s| s.name == name)
    }
}

/// Final report sent by a service task
#[derive(Debug)]
struct ServiceReport {
    name: String,
    critical: bool,
    /// Supervision ended because the service failed, not because it was stopped
    failure: Option<String>,
}

/// Launches and supervises a set of services
pub struct Supervisor<L: Launcher> {
    launcher: Arc<L>,
    config: SupervisorConfig,
    /// Variables every child receives on top of the inherited environment
    environment: IndexMap<String, String>,
}

impl<L: Launcher> Supervisor<L> {
    pub fn new(launcher: L, config: SupervisorConfig) -> Self {
        Self {
            launcher: Arc::new(launcher),
            config,
            environment: IndexMap::new(),
        }
    }

    /// Set the environment overlay handed to every child
    pub fn with_environment<I, K, V>(mut self, environment: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.environment = environment
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    /// Build the process configuration for a service
    pub fn process_config(&self, descriptor: &ServiceDescriptor) -> ProcessConfig {
        let mut env = self.environment.clone();
        env.extend(descriptor.env.clone());

        ProcessConfig {
            name: descriptor.name.clone(),
            program: descriptor.program().to_string(),
            args: descriptor.args().to_vec(),
            env,
            working_dir: descriptor.working_dir.clone(),
        }
    }

    /// Launch every service and supervise until all have finished, a
    /// critical service fails, or `shutdown_rx` fires.
    pub async fn run(
        &self,
        descriptors: Vec<ServiceDescriptor>,
        mut shutdown_rx: watch::Receiver<()>,
    ) -> Result<SupervisorOutcome, SupervisorError> {
        let graph = DependencyGraph::build(&descriptors)?;
        let started_at = Instant::now();

        log::info!("Launching {} services...", graph.services.len());

        let (stop_tx, _) = watch::channel(false);

        let mut senders = Vec::with_capacity(graph.services.len());
        let mut receivers: IndexMap<String, watch::Receiver<ServiceStatus>> = IndexMap::new();
        for service in graph.launch_order() {
            let (tx, rx) = watch::channel(ServiceStatus::default());
            senders.push(tx);
            receivers.insert(service.name.clone(), rx);
        }

        // Launch calls are issued in dependency order; every task then waits
        // for its own delay independently.
        let mut tasks = JoinSet::new();
        for (service, status) in graph.launch_order().zip(senders) {
            let deps = service
                .depends_on
                .iter()
                .filter_map(|dep| receivers.get(dep).map(|rx| (dep.clone(), rx.clone())))
                .collect();

            let task = ServiceTask {
                descriptor: service.clone(),
                process: self.process_config(service),
                launcher: Arc::clone(&self.launcher),
                backoff: self.config.backoff.clone(),
                grace_period: self.config.grace_period,
                started_at,
                status,
                deps,
                stop_rx: stop_tx.subscribe(),
            };
            tasks.spawn(task.run());
        }

        let mut reason: Option<StopReason> = None;
        let mut signals_open = true;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed(), if signals_open && reason.is_none() => {
                    if changed.is_err() {
                        signals_open = false;
                        continue;
                    }
                    log::info!("Shutdown signal received, stopping all services");
                    reason = Some(StopReason::Shutdown);
                    let _ = stop_tx.send(true);
                }

                joined = tasks.join_next() => {
                    let Some(joined) = joined else {
                        break;
                    };
                    match joined {
                        Ok(report) => {
                            let Some(cause) = report.failure else {
                                continue;
                            };
                            if report.critical && reason.is_none() {
                                log::error!(
                                    "[{}] Critical service failed ({}), stopping all services",
                                    report.name,
                                    cause
                                );
                                reason = Some(StopReason::CriticalFailure {
                                    service: report.name,
                                    cause,
                                });
                                let _ = stop_tx.send(true);
                            } else if !report.critical {
                                log::warn!("[{}] Service is down: {}", report.name, cause);
                            }
                        }
                        Err(e) => {
                            log::error!("Service task aborted: {}", e);
                        }
                    }
                }
            }
        }

        let services = receivers
            .iter()
            .map(|(name, rx)| {
                let status = rx.borrow();
                ServiceSummary {
                    name: name.clone(),
                    state: status.state,
                    launches: status.launches,
                    last_outcome: status.last_outcome.clone(),
                }
            })
            .collect();

        let reason = reason.unwrap_or(StopReason::Completed);
        log::info!("All services accounted for ({:?})", reason);

        Ok(SupervisorOutcome { reason, services })
    }
}

enum Wake {
    Exited(ExitOutcome),
    Stop,
}

/// Per-service supervision task
struct ServiceTask<L: Launcher> {
    descriptor: ServiceDescriptor,
    process: ProcessConfig,
    launcher: Arc<L>,
    backoff: BackoffPolicy,
    grace_period: Duration,
    started_at: Instant,
    status: watch::Sender<ServiceStatus>,
    deps: Vec<(String, watch::Receiver<ServiceStatus>)>,
    stop_rx: watch::Receiver<bool>,
}

impl<L: Launcher> ServiceTask<L> {
    async fn run(mut self) -> ServiceReport {
        let name = self.descriptor.name.clone();

        for (dep, mut rx) in std::mem::take(&mut self.deps) {
            log::debug!("[{}] Waiting for '{}' to start", name, dep);
            let started = async {
                rx.wait_for(|s| s.ever_running || s.finished)
                    .await
                    .map(|s| s.ever_running)
                    .unwrap_or(false)
            };
            let ready = tokio::select! {
                ready = started => ready,
                _ = stop_requested(&mut self.stop_rx) => return self.stopped(None),
            };

            if !ready {
                let cause = format!("dependency '{}' never started", dep);
                log::error!("[{}] Not launching: {}", name, cause);
                self.status.send_modify(|s| s.state = ServiceState::Crashed);
                return self.finish(Some(cause));
            }
        }

        let launch_at = self.started_at + self.descriptor.start_delay;
        if launch_at > Instant::now() {
            log::info!(
                "[{}] Waiting {:?} before start",
                name,
                self.descriptor.start_delay
            );
            tokio::select! {
                _ = tokio::time::sleep_until(launch_at) => {}
                _ = stop_requested(&mut self.stop_rx) => return self.stopped(None),
            }
        }

        let max_restarts = self
            .descriptor
            .max_restarts
            .unwrap_or(self.backoff.max_restarts);
        let mut consecutive = 0u32;

        loop {
            self.status.send_modify(|s| {
                s.state = ServiceState::Starting;
                s.launches += 1;
            });
            let launched_at = Instant::now();

            let outcome = match self.launcher.launch(&self.process).await {
                Ok(mut running) => {
                    self.status.send_modify(|s| {
                        s.state = ServiceState::Running;
                        s.ever_running = true;
                    });
                    if let Some(pid) = running.pid() {
                        log::info!("[{}] Process started with PID: {}", name, pid);
                    }

                    let wake = tokio::select! {
                        outcome = running.wait() => Wake::Exited(outcome),
                        _ = stop_requested(&mut self.stop_rx) => Wake::Stop,
                    };

                    match wake {
                        Wake::Exited(outcome) => outcome,
                        Wake::Stop => {
                            let outcome = running.terminate(self.grace_period).await;
                            return self.stopped(Some(outcome));
                        }
                    }
                }
                Err(e) => {
                    log::error!("[{}] {}", name, e);
                    ExitOutcome::SpawnFailed {
                        error: e.to_string(),
                    }
                }
            };

            let state = if outcome.is_clean() {
                log::info!("[{}] Process {}", name, outcome);
                ServiceState::Exited
            } else {
                log::error!("[{}] Process {}", name, outcome);
                ServiceState::Crashed
            };
            self.status.send_modify(|s| {
                s.state = state;
                s.last_outcome = Some(outcome.clone());
            });

            if !self.descriptor.restart.should_restart(&outcome) {
                let failure = (!outcome.is_clean()).then(|| outcome.to_string());
                return self.finish(failure);
            }

            if launched_at.elapsed() >= self.backoff.reset_after {
                consecutive = 0;
            }
            consecutive += 1;

            if consecutive > max_restarts {
                log::error!(
                    "[{}] Giving up after {} consecutive restarts",
                    name,
                    max_restarts
                );
                let failure = (!outcome.is_clean())
                    .then(|| format!("{} after {} restarts", outcome, max_restarts));
                return self.finish(failure);
            }

            let delay = self.backoff.delay_for(consecutive);
            log::warn!(
                "[{}] Restarting in {:?} (attempt {}/{}, policy {})",
                name,
                delay,
                consecutive,
                max_restarts,
                self.descriptor.restart
            );
            self.status
                .send_modify(|s| s.state = ServiceState::Restarting);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop_requested(&mut self.stop_rx) => return self.stopped(None),
            }
        }
    }

    /// Supervision ended because the supervisor is stopping
    fn stopped(self, outcome: Option<ExitOutcome>) -> ServiceReport {
        if let Some(outcome) = outcome {
            self.status.send_modify(|s| {
                s.state = if outcome.is_clean() {
                    ServiceState::Exited
                } else {
                    ServiceState::Crashed
                };
                s.last_outcome = Some(outcome);
            });
        }
        self.finish(None)
    }

    fn finish(self, failure: Option<String>) -> ServiceReport {
        self.status.send_modify(|s| s.finished = true);
        ServiceReport {
            name: self.descriptor.name,
            critical: self.descriptor.critical,
            failure,
        }
    }
}

/// Resolves once the supervisor asks every service to stop
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

/// Errors that can occur before supervision starts
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Invalid service set: {0}")]
    Dependency(#[from] DependencyError),
}
