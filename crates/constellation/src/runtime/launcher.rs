//! Launch seam between the supervisor and the operating system

use crate::runtime::output::OutputSender;
use crate::runtime::policy::ExitOutcome;
use crate::runtime::process::{ManagedProcess, ProcessConfig, ProcessError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A launched service instance
#[async_trait]
pub trait RunningService: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for the instance to exit on its own. Must be cancel safe.
    async fn wait(&mut self) -> ExitOutcome;

    /// Ask the instance to exit, forcing it after `grace`
    async fn terminate(&mut self, grace: Duration) -> ExitOutcome;
}

/// Turns a process configuration into a running instance
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    async fn launch(&self, config: &ProcessConfig)
        -> Result<Box<dyn RunningService>, ProcessError>;
}

/// Launches real child processes
#[derive(Debug, Clone, Default)]
pub struct OsLauncher {
    output: Option<OutputSender>,
}

impl OsLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward child output to the multiplexer instead of inheriting stdio
    pub fn with_output(mut self, tx: OutputSender) -> Self {
        self.output = Some(tx);
        self
    }
}

#[async_trait]
impl Launcher for OsLauncher {
    async fn launch(
        &self,
        config: &ProcessConfig,
    ) -> Result<Box<dyn RunningService>, ProcessError> {
        let mut process = ManagedProcess::new(config.clone());
        if let Some(tx) = &self.output {
            process = process.with_output(tx.clone());
        }
        process.start().await?;
        Ok(Box::new(process))
    }
}

#[async_trait]
impl RunningService for ManagedProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&mut self) -> ExitOutcome {
        ManagedProcess::wait(self).await
    }

    async fn terminate(&mut self, grace: Duration) -> ExitOutcome {
        self.stop(grace).await
    }
}

/// Resolve `program` the way `execvp` would: paths containing a slash are
/// checked directly (relative to `working_dir`), bare names are searched in
/// `path`.
pub fn resolve_program(
    program: &str,
    path: Option<&str>,
    working_dir: Option<&Path>,
) -> Option<PathBuf> {
    if program.contains('/') {
        let candidate = match working_dir {
            Some(dir) if Path::new(program).is_relative() => dir.join(program),
            _ => PathBuf::from(program),
        };
        return is_executable(&candidate).then_some(candidate);
    }

    std::env::split_paths(path?)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        true
    }
}
