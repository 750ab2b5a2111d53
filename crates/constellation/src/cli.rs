//! Command-line interface for constellation

use argh::FromArgs;
use std::time::Duration;

/// Exit code for a graceful shutdown or a clean run
pub const EXIT_OK: i32 = 0;
/// Exit code when a critical service failed unrecoverably
pub const EXIT_CRITICAL_FAILURE: i32 = 1;
/// Exit code for a fatal bootstrap error
pub const EXIT_BOOTSTRAP_FAILURE: i32 = 2;
/// Exit code when a worker pool could not start or aborted
pub const EXIT_WORKER_FAILURE: i32 = 3;

/// Time past the job timeout after which a held claim is recovered
pub const CLAIM_LEASE_MARGIN: Duration = Duration::from_secs(60);

/// Default spool directory when neither `--spool` nor `CONSTELLATION_SPOOL` is set
pub const DEFAULT_SPOOL: &str = "/data/queues";

/// Multi-service bootstrap orchestrator
#[derive(FromArgs, Debug)]
pub struct Cli {
    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
pub enum Command {
    Up(UpArgs),
    Worker(WorkerArgs),
    Enqueue(EnqueueArgs),
    Validate(ValidateArgs),
}

/// Provision credentials and supervise every declared service
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "up")]
pub struct UpArgs {
    /// path to the services file (default: built-in constellation)
    #[argh(positional)]
    pub services_file: Option<String>,

    /// only launch these services (comma-separated)
    #[argh(option, from_str_fn(parse_list))]
    pub only: Option<Vec<String>>,

    /// do not launch these services (comma-separated)
    #[argh(option, from_str_fn(parse_list))]
    pub skip: Option<Vec<String>>,

    /// time between SIGTERM and SIGKILL on shutdown, e.g. 10s
    #[argh(option, default = "Duration::from_secs(10)", from_str_fn(parse_grace))]
    pub grace: Duration,

    /// show launch plan without executing
    #[argh(switch)]
    pub dry_run: bool,
}

/// Run a worker pool that pulls jobs from an ordered list of queues
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "worker")]
pub struct WorkerArgs {
    /// pool name used in log lines (default: first queue)
    #[argh(option)]
    pub name: Option<String>,

    /// queues in priority order (comma-separated)
    #[argh(option, short = 'q')]
    pub queues: String,

    /// number of concurrent pull-loops
    #[argh(option, short = 'w', default = "1")]
    pub workers: usize,

    /// spool directory shared with producers
    #[argh(option)]
    pub spool: Option<String>,

    /// idle wait between empty poll cycles, e.g. 500ms
    #[argh(option, default = "Duration::from_secs(1)", from_str_fn(parse_grace))]
    pub poll_interval: Duration,

    /// abort a job running longer than this, 0 to never abort (default: 10m)
    #[argh(option, default = "Duration::from_secs(600)", from_str_fn(parse_grace))]
    pub job_timeout: Duration,
}

impl WorkerArgs {
    /// Per-job limit, `None` when disabled
    pub fn job_timeout(&self) -> Option<Duration> {
        Some(self.job_timeout).filter(|limit| !limit.is_zero())
    }

    /// How long a spool claim may be held before it counts as abandoned
    pub fn claim_lease(&self) -> Option<Duration> {
        self.job_timeout().map(|limit| limit + CLAIM_LEASE_MARGIN)
    }
}

/// Submit a job to a queue
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "enqueue")]
pub struct EnqueueArgs {
    /// target queue
    #[argh(option, short = 'q')]
    pub queue: String,

    /// spool directory shared with the workers
    #[argh(option)]
    pub spool: Option<String>,

    /// command to run, after `--`
    #[argh(positional)]
    pub command: Vec<String>,
}

/// Validate a services file and exit
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "validate")]
pub struct ValidateArgs {
    /// path to the services file
    #[argh(positional)]
    pub services_file: String,
}

impl Cli {
    /// The level to use when `RUST_LOG` is not set
    pub fn default_log_filter(&self) -> &'static str {
        match self.log_level.to_lowercase().as_str() {
            "error" => "error",
            "warn" => "warn",
            "debug" => "debug",
            "trace" => "trace",
            _ => "info",
        }
    }
}

/// Spool directory from the flag, else `CONSTELLATION_SPOOL`, else the default
pub fn spool_dir(flag: Option<&str>, env: Option<&str>) -> String {
    flag.or(env)
        .filter(|dir| !dir.is_empty())
        .unwrap_or(DEFAULT_SPOOL)
        .to_string()
}

/// Parse comma-separated list
fn parse_list(s: &str) -> Result<Vec<String>, String> {
    Ok(s.split(',')
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect())
}

fn parse_grace(s: &str) -> Result<Duration, String> {
    crate::config::parse_duration(s)
}
