//! Constellation bootstrap orchestrator
//!
//! Turns a single container entrypoint into a running set of cooperating
//! services (search engine, broker, worker pools, application server) with
//! zero manual configuration.
//!
//! # Overview
//!
//! Startup runs in three strictly ordered phases:
//! - **Credentials**: resolve the admin identity, generating a password when
//!   none is supplied
//! - **Environment**: remap the identity-provider variables into the names
//!   downstream services expect
//! - **Supervision**: launch every declared service concurrently, honouring
//!   start delays, restart policies and fail-fast for critical services
//!
//! Worker pool processes use the [`router`] module to pull jobs from an
//! ordered list of queues.
//!
//! # Example Services File
//!
//! ```yaml
//! version: "1.0"
//!
//! services:
//!   redis:
//!     command: ["redis-server"]
//!     restart: on-failure
//!     critical: true
//!
//!   worker_high:
//!     command: ["constellation", "worker", "--queues", "high", "--workers", "2"]
//!     start_delay: 30s
//!     restart: on-failure
//!
//!   server:
//!     command: "/bin/bash start_server.sh"
//!     start_delay: 30s
//!     critical: true
//! ```

pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod router;
pub mod runtime;

pub use bootstrap::{
    bootstrap, materialize, resolve_credentials, BootstrapConfig, BootstrapEnv, BootstrapError,
    Credential, CredentialError, CredentialRequest, EnvironmentSet, HubIdentityLookup,
    IdentityLookup, IdentityProviderMapping,
};
pub use cli::Cli;
pub use config::{ServiceDescriptor, ServicesFile, ServicesFileError, SubstitutionContext};
pub use router::{
    serve, Broker, BrokerError, CommandHandler, Job, JobHandler, MemoryBroker, PoolConfig,
    QueueBinding, RouterError, SpoolBroker,
};
pub use runtime::{
    BackoffPolicy, ExitOutcome, LaunchPlan, Launcher, OsLauncher, RestartPolicy, ServiceState,
    Supervisor, SupervisorConfig, SupervisorError, SupervisorOutcome,
};
