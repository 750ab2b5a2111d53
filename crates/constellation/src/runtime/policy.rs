//! Restart policy and backoff

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Restart policy for a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart (default)
    #[default]
    Never,
    /// Only restart on failure (non-zero exit code or signal)
    #[serde(alias = "on_failure", alias = "onfailure")]
    OnFailure,
    /// Always restart on exit
    Always,
}

impl RestartPolicy {
    /// Whether a run that ended with `outcome` should be relaunched
    pub fn should_restart(&self, outcome: &ExitOutcome) -> bool {
        match self {
            RestartPolicy::Never => false,
            RestartPolicy::OnFailure => !outcome.is_clean(),
            RestartPolicy::Always => true,
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::Never => write!(f, "never"),
            RestartPolicy::OnFailure => write!(f, "on-failure"),
            RestartPolicy::Always => write!(f, "always"),
        }
    }
}

/// How a single run of a service ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exit code zero
    Clean,
    /// Non-zero exit code, or `None` when terminated by a signal
    Crashed { code: Option<i32> },
    /// The command could not be launched at all
    SpawnFailed { error: String },
}

impl ExitOutcome {
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => ExitOutcome::Clean,
            code => ExitOutcome::Crashed { code },
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, ExitOutcome::Clean)
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Clean => write!(f, "exited cleanly"),
            ExitOutcome::Crashed { code: Some(code) } => write!(f, "exited with code {}", code),
            ExitOutcome::Crashed { code: None } => write!(f, "terminated by signal"),
            ExitOutcome::SpawnFailed { error } => write!(f, "failed to launch: {}", error),
        }
    }
}

/// Bounded exponential backoff between restarts.
///
/// The n-th consecutive restart waits `initial * factor^(n-1)`, capped at
/// `max_delay`. A run lasting at least `reset_after` clears the counter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: u32,
    pub max_delay: Duration,
    /// Consecutive restarts allowed before the service is given up on
    pub max_restarts: u32,
    pub reset_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2,
            max_delay: Duration::from_secs(30),
            max_restarts: 5,
            reset_after: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the `attempt`-th consecutive restart (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = self.factor.max(1).checked_pow(exponent).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
