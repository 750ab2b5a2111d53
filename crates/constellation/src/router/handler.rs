//! Job handlers

use super::broker::Job;
use crate::runtime::ExitOutcome;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;

/// Executes one claimed job.
///
/// A handler is built once per worker pool and shared by all of its
/// pull-loops, so any setup cost is paid at pool start.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &Job) -> Result<(), JobError>;
}

/// Runs the job's command as a subprocess. Output goes to the worker's own
/// stdout/stderr.
#[derive(Debug, Clone, Default)]
pub struct CommandHandler {
    working_dir: Option<PathBuf>,
}

impl CommandHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl JobHandler for CommandHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let (program, args) = job.command.split_first().ok_or(JobError::EmptyCommand)?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .env("CONSTELLATION_JOB_ID", &job.id)
            .env("CONSTELLATION_QUEUE", &job.queue)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let status = cmd.status().await.map_err(|source| JobError::Spawn {
            program: program.clone(),
            source,
        })?;

        let outcome = ExitOutcome::from_code(status.code());
        if outcome.is_clean() {
            Ok(())
        } else {
            Err(JobError::Failed(outcome))
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job has an empty command")]
    EmptyCommand,

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Job {0}")]
    Failed(ExitOutcome),

    #[error("{0}")]
    Other(String),
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_command_handler_exit_status() {
        let handler = CommandHandler::new();

        assert!(handler.handle(&Job::new("default", ["true"])).await.is_ok());
        assert!(matches!(
            handler
                .handle(&Job::new("default", ["sh", "-c", "exit 4"]))
                .await,
            Err(JobError::Failed(ExitOutcome::Crashed { code: Some(4) }))
        ));
        assert!(matches!(
            handler
                .handle(&Job::new("default", ["/nonexistent/tool"]))
                .await,
            Err(JobError::Spawn { .. })
        ));
        assert!(matches!(
            handler
                .handle(&Job::new("default", Vec::<String>::new()))
                .await,
            Err(JobError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn test_job_sees_its_identity() {
        let dir = tempfile::tempdir().unwrap();
        let handler = CommandHandler::new().with_working_dir(dir.path());
        let job = Job::new("ocr", ["sh", "-c", "echo $CONSTELLATION_QUEUE > queue.txt"]);

        handler.handle(&job).await.unwrap();

        let written = std::fs::read_to_string(dir.path().join("queue.txt")).unwrap();
        assert_eq!(written.trim(), "ocr");
    }
}
