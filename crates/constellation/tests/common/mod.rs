//! Test helpers for supervisor and router integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use constellation::router::{Job, JobError, JobHandler};
use constellation::runtime::{ExitOutcome, Launcher, ProcessConfig, ProcessError, RunningService};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// What a scripted service does on one launch
#[derive(Debug, Clone)]
pub enum Step {
    /// Run for `after`, then end with `outcome`
    Exit { after: Duration, outcome: ExitOutcome },
    /// The launch call itself fails
    FailToSpawn,
    /// Run until terminated
    RunForever,
}

impl Step {
    pub fn crash_after(after: Duration, code: i32) -> Self {
        Step::Exit {
            after,
            outcome: ExitOutcome::Crashed { code: Some(code) },
        }
    }

    pub fn clean_after(after: Duration) -> Self {
        Step::Exit {
            after,
            outcome: ExitOutcome::Clean,
        }
    }
}

/// One launch call observed by the launcher
#[derive(Debug, Clone)]
pub struct LaunchRecord {
    pub service: String,
    pub at: Instant,
    pub env: Vec<(String, String)>,
}

/// Everything the scripted launcher observed
#[derive(Debug, Default)]
pub struct Recorder {
    launches: Mutex<Vec<LaunchRecord>>,
    terminations: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.launches.lock().unwrap().clone()
    }

    pub fn launches_of(&self, service: &str) -> Vec<Instant> {
        self.launches()
            .into_iter()
            .filter(|r| r.service == service)
            .map(|r| r.at)
            .collect()
    }

    pub fn launch_order(&self) -> Vec<String> {
        self.launches().into_iter().map(|r| r.service).collect()
    }

    pub fn terminations(&self) -> Vec<String> {
        self.terminations.lock().unwrap().clone()
    }
}

/// Launcher that plays back a per-service script on tokio's clock.
/// Once a script is exhausted the service runs forever.
#[derive(Default)]
pub struct ScriptedLauncher {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    recorder: Arc<Recorder>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, service: &str, steps: impl IntoIterator<Item = Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(service.to_string(), steps.into_iter().collect());
        self
    }

    pub fn recorder(&self) -> Arc<Recorder> {
        Arc::clone(&self.recorder)
    }
}

#[async_trait]
impl Launcher for ScriptedLauncher {
    async fn launch(&self, config: &ProcessConfig) -> Result<Box<dyn RunningService>, ProcessError> {
        self.recorder.launches.lock().unwrap().push(LaunchRecord {
            service: config.name.clone(),
            at: Instant::now(),
            env: config
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        });

        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&config.name)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::RunForever);

        let exit = match step {
            Step::FailToSpawn => {
                return Err(ProcessError::SpawnFailed {
                    name: config.name.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted"),
                })
            }
            Step::RunForever => None,
            Step::Exit { after, outcome } => Some((Instant::now() + after, outcome)),
        };

        Ok(Box::new(ScriptedRun {
            service: config.name.clone(),
            exit,
            recorder: Arc::clone(&self.recorder),
        }))
    }
}

struct ScriptedRun {
    service: String,
    exit: Option<(Instant, ExitOutcome)>,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl RunningService for ScriptedRun {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> ExitOutcome {
        match &self.exit {
            Some((deadline, outcome)) => {
                tokio::time::sleep_until(*deadline).await;
                outcome.clone()
            }
            None => std::future::pending().await,
        }
    }

    async fn terminate(&mut self, _grace: Duration) -> ExitOutcome {
        self.recorder
            .terminations
            .lock()
            .unwrap()
            .push(self.service.clone());
        ExitOutcome::Crashed { code: None }
    }
}

/// Handler that records which jobs it ran and fails the ones whose first
/// argument is `fail`, panicking on `panic` and never finishing on `hang`
#[derive(Debug, Default)]
pub struct RecordingHandler {
    handled: Mutex<Vec<Job>>,
}

impl RecordingHandler {
    pub fn handled(&self) -> Vec<Job> {
        self.handled.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        self.handled.lock().unwrap().push(job.clone());
        match job.command.first().map(String::as_str) {
            Some("fail") => Err(JobError::Other("scripted failure".to_string())),
            Some("panic") => panic!("scripted panic"),
            Some("hang") => std::future::pending().await,
            _ => Ok(()),
        }
    }
}

/// Poll `condition` on tokio's clock until it holds or `limit` passes
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
