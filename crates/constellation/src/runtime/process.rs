//! Managed process abstraction

use crate::bootstrap::{redact, secret_values};
use crate::runtime::output::{OutputLine, OutputSender, Stream};
use crate::runtime::policy::ExitOutcome;
use indexmap::IndexMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// Lifecycle state of a supervised service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Waiting for its start delay or dependencies
    Pending,
    /// Launch in progress
    Starting,
    /// Process is running
    Running,
    /// Last run ended with exit code zero
    Exited,
    /// Last run ended with a failure, or could not be launched
    Crashed,
    /// Waiting out the backoff before the next launch
    Restarting,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Pending => "pending",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Exited => "exited",
            ServiceState::Crashed => "crashed",
            ServiceState::Restarting => "restarting",
        };
        f.write_str(name)
    }
}

/// Configuration for spawning a process
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Service name (used to tag output)
    pub name: String,
    /// Executable path or name looked up on PATH
    pub program: String,
    /// Command line arguments
    pub args: Vec<String>,
    /// Variables added on top of the inherited environment
    pub env: IndexMap<String, String>,
    /// Working directory
    pub working_dir: Option<PathBuf>,
}

impl ProcessConfig {
    /// Command line for log output, with secret values from `env` masked
    pub fn display_command(&self) -> String {
        let secrets = secret_values(&self.env);
        let line = std::iter::once(&self.program)
            .chain(&self.args)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        redact(&line, &secrets)
    }
}

/// A managed child process
pub struct ManagedProcess {
    pub config: ProcessConfig,
    pub pid: Option<u32>,
    child: Option<Child>,
    last_outcome: Option<ExitOutcome>,
    output: Option<OutputSender>,
}

impl ManagedProcess {
    /// Create a new managed process
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            pid: None,
            child: None,
            last_outcome: None,
            output: None,
        }
    }

    /// Forward stdout/stderr lines to the multiplexer
    pub fn with_output(mut self, tx: OutputSender) -> Self {
        self.output = Some(tx);
        self
    }

    /// Start the process in its own process group
    pub async fn start(&mut self) -> Result<u32, ProcessError> {
        if self.child.is_some() {
            return Err(ProcessError::AlreadyRunning(self.config.name.clone()));
        }

        log::info!(
            "[{}] Starting: {}",
            self.config.name,
            self.config.display_command()
        );

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if self.output.is_some() {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        // Own group so termination reaches grandchildren (e.g. `sh -c` pipelines)
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            name: self.config.name.clone(),
            source: e,
        })?;

        let pid = child.id().unwrap_or(0);
        self.pid = Some(pid);
        self.last_outcome = None;

        if let Some(tx) = &self.output {
            if let Some(stdout) = child.stdout.take() {
                forward_lines(stdout, self.config.name.clone(), Stream::Stdout, tx.clone());
            }
            if let Some(stderr) = child.stderr.take() {
                forward_lines(stderr, self.config.name.clone(), Stream::Stderr, tx.clone());
            }
        }

        self.child = Some(child);
        Ok(pid)
    }

    /// Wait for the process to exit on its own
    pub async fn wait(&mut self) -> ExitOutcome {
        let Some(child) = self.child.as_mut() else {
            return self.last_outcome.clone().unwrap_or(ExitOutcome::Crashed { code: None });
        };

        let outcome = match child.wait().await {
            Ok(status) => ExitOutcome::from_code(status.code()),
            Err(e) => {
                log::error!("[{}] Error waiting for process: {}", self.config.name, e);
                ExitOutcome::Crashed { code: None }
            }
        };

        self.finish(outcome)
    }

    /// Stop the process gracefully (SIGTERM, then SIGKILL after `grace`)
    pub async fn stop(&mut self, grace: Duration) -> ExitOutcome {
        let Some(mut child) = self.child.take() else {
            return self.last_outcome.clone().unwrap_or(ExitOutcome::Crashed { code: None });
        };

        log::info!("[{}] Stopping process...", self.config.name);

        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                signal_group(pid, nix::sys::signal::Signal::SIGTERM);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        let outcome = match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => ExitOutcome::from_code(status.code()),
            Ok(Err(e)) => {
                log::error!("[{}] Error waiting for process: {}", self.config.name, e);
                ExitOutcome::Crashed { code: None }
            }
            Err(_) => {
                log::warn!(
                    "[{}] Process did not exit within {:?}, forcing kill",
                    self.config.name,
                    grace
                );

                #[cfg(unix)]
                {
                    if let Some(pid) = self.pid {
                        signal_group(pid, nix::sys::signal::Signal::SIGKILL);
                    }
                }

                if let Err(e) = child.kill().await {
                    log::error!("[{}] Failed to kill process: {}", self.config.name, e);
                }
                ExitOutcome::Crashed { code: None }
            }
        };

        log::info!("[{}] Process {}", self.config.name, outcome);
        self.finish(outcome)
    }

    fn finish(&mut self, outcome: ExitOutcome) -> ExitOutcome {
        self.child = None;
        self.pid = None;
        self.last_outcome = Some(outcome.clone());
        outcome
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        // ESRCH: the group is already gone
        log::debug!("Failed to send {} to process group {}: {}", signal, pid, e);
    }
}

fn forward_lines<R>(reader: R, service: String, stream: Stream, tx: OutputSender)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = OutputLine {
                service: service.clone(),
                stream,
                line,
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

/// Errors that can occur with managed processes
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Process '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Failed to spawn process '{name}': {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::sync::mpsc;

    fn shell(name: &str, script: &str) -> ProcessConfig {
        ProcessConfig {
            name: name.to_string(),
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: IndexMap::new(),
            working_dir: None,
        }
    }

    #[test]
    fn test_display_command_masks_secrets() {
        let mut config = shell("server", "server --admin-password s3cr3tGenerated");
        config
            .env
            .insert("PASSWORD".to_string(), "s3cr3tGenerated".to_string());
        config.env.insert("USERNAME".to_string(), "owner".to_string());

        let shown = config.display_command();
        assert_eq!(shown, "sh -c server --admin-password ********");
    }

    #[tokio::test]
    async fn test_exit_codes() {
        let mut ok = ManagedProcess::new(shell("ok", "exit 0"));
        ok.start().await.unwrap();
        assert_eq!(ok.wait().await, ExitOutcome::Clean);

        let mut bad = ManagedProcess::new(shell("bad", "exit 3"));
        bad.start().await.unwrap();
        assert_eq!(bad.wait().await, ExitOutcome::Crashed { code: Some(3) });
    }

    #[tokio::test]
    async fn test_output_is_tagged() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut config = shell("echoer", "echo \"hello $GREETING\"; echo oops >&2");
        config.env.insert("GREETING".to_string(), "world".to_string());

        let mut process = ManagedProcess::new(config).with_output(tx);
        process.start().await.unwrap();
        process.wait().await;
        drop(process);

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }

        assert!(lines.iter().all(|l| l.service == "echoer"));
        assert!(lines
            .iter()
            .any(|l| l.stream == Stream::Stdout && l.line == "hello world"));
        assert!(lines
            .iter()
            .any(|l| l.stream == Stream::Stderr && l.line == "oops"));
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let mut process = ManagedProcess::new(shell("stubborn", "trap '' TERM; sleep 30"));
        process.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        let outcome = process.stop(Duration::from_millis(300)).await;
        assert!(!outcome.is_clean());
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(process.pid.is_none());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let mut process = ManagedProcess::new(ProcessConfig {
            name: "ghost".to_string(),
            program: "/definitely/not/a/real/binary".to_string(),
            args: Vec::new(),
            env: IndexMap::new(),
            working_dir: None,
        });

        assert!(matches!(
            process.start().await,
            Err(ProcessError::SpawnFailed { .. })
        ));
    }
}
