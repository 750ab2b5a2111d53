//! Constellation CLI
//!
//! Usage:
//!   constellation up
//!   constellation up launch/default.services.yaml --skip elastic --dry-run
//!   constellation worker --queues default,ocr --workers 1
//!   constellation enqueue --queue ocr -- extract --document 42

use anyhow::Context;
use constellation::bootstrap::{bootstrap, identity_lookup, preflight, BootstrapEnv};
use constellation::cli::{
    self, Cli, Command, EnqueueArgs, UpArgs, ValidateArgs, WorkerArgs, EXIT_BOOTSTRAP_FAILURE,
    EXIT_OK, EXIT_WORKER_FAILURE,
};
use constellation::config::{filter_services, ServicesFile, SubstitutionContext};
use constellation::router::{serve, Broker, CommandHandler, Job, PoolConfig, QueueBinding, SpoolBroker};
use constellation::runtime::{
    setup_shutdown, spawn_multiplexer, DependencyGraph, LaunchPlan, OsLauncher, Supervisor,
    SupervisorConfig,
};
use std::sync::Arc;
use std::time::Duration;

const SPOOL_ENV: &str = "CONSTELLATION_SPOOL";
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    let args: Cli = argh::from_env();

    let env = env_logger::Env::default().default_filter_or(args.default_log_filter());
    env_logger::init_from_env(env);

    let code = match args.command {
        Command::Up(up_args) => up(up_args).await.unwrap_or_else(|e| {
            log::error!("Bootstrap failed: {:#}", e);
            EXIT_BOOTSTRAP_FAILURE
        }),
        Command::Worker(worker_args) => worker(worker_args).await.unwrap_or_else(|e| {
            log::error!("Worker pool failed: {:#}", e);
            EXIT_WORKER_FAILURE
        }),
        Command::Enqueue(enqueue_args) => enqueue(enqueue_args).await.unwrap_or_else(|e| {
            log::error!("Enqueue failed: {:#}", e);
            EXIT_WORKER_FAILURE
        }),
        Command::Validate(validate_args) => validate(validate_args).unwrap_or_else(|e| {
            log::error!("{:#}", e);
            EXIT_BOOTSTRAP_FAILURE
        }),
    };

    std::process::exit(code);
}

fn load_services(path: Option<&str>) -> anyhow::Result<ServicesFile> {
    match path {
        Some(path) => {
            log::info!("Loading services file: {}", path);
            Ok(ServicesFile::from_file(path)?)
        }
        None => {
            log::info!("Using built-in services table");
            Ok(ServicesFile::builtin()?)
        }
    }
}

async fn up(args: UpArgs) -> anyhow::Result<i32> {
    let services_file = load_services(args.services_file.as_deref())?;

    let env = BootstrapEnv::from_process();
    let lookup = identity_lookup(env.hub_endpoint());
    let config = bootstrap(&env, lookup.as_ref()).await?;

    let ctx = SubstitutionContext::new()
        .with_envs(config.environment())
        .with_inherited(env.to_map());
    let descriptors = filter_services(
        services_file.resolve(&ctx)?,
        args.only.as_deref().unwrap_or_default(),
        args.skip.as_deref().unwrap_or_default(),
    )?;

    let path = std::env::var("PATH").ok();

    if args.dry_run {
        if let Err(e) = preflight(&descriptors, path.as_deref()) {
            log::warn!("{}", e);
        }
        let plan = LaunchPlan::build(&descriptors, config.environment())?;
        println!("{}", plan);
        return Ok(EXIT_OK);
    }

    preflight(&descriptors, path.as_deref())?;

    let (_shutdown_tx, shutdown_rx) = setup_shutdown()?;

    let width = descriptors.iter().map(|d| d.name.len()).max().unwrap_or(0);
    let (output, multiplexer) = spawn_multiplexer(width);

    let supervisor = Supervisor::new(
        OsLauncher::new().with_output(output),
        SupervisorConfig {
            grace_period: args.grace,
            ..Default::default()
        },
    )
    .with_environment(config.environment());

    let outcome = supervisor.run(descriptors, shutdown_rx).await?;

    // Flush whatever the children wrote last
    drop(supervisor);
    let _ = tokio::time::timeout(Duration::from_secs(1), multiplexer).await;

    for service in &outcome.services {
        log::info!(
            "[{}] {} after {} launch(es){}",
            service.name,
            service.state,
            service.launches,
            service
                .last_outcome
                .as_ref()
                .map(|o| format!(", last run {}", o))
                .unwrap_or_default()
        );
    }

    log::info!("Constellation exiting");
    Ok(outcome.exit_code())
}

async fn worker(args: WorkerArgs) -> anyhow::Result<i32> {
    let name = args.name.clone().unwrap_or_else(|| {
        args.queues
            .split(',')
            .map(str::trim)
            .find(|q| !q.is_empty())
            .unwrap_or("worker")
            .to_string()
    });
    let binding = QueueBinding::parse(name, &args.queues, args.workers)?;

    let spool = cli::spool_dir(args.spool.as_deref(), std::env::var(SPOOL_ENV).ok().as_deref());
    let broker = Arc::new(
        SpoolBroker::open(&spool).with_context(|| format!("cannot open spool at {}", spool))?,
    );
    let handler = Arc::new(CommandHandler::new());

    let (_shutdown_tx, shutdown_rx) = setup_shutdown()?;

    let sweeper = args.claim_lease().map(|lease| {
        let broker = Arc::clone(&broker);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            broker
                .sweep_abandoned(lease, SWEEP_INTERVAL, shutdown)
                .await
        })
    });

    serve(
        &binding,
        broker,
        handler,
        PoolConfig {
            poll_interval: args.poll_interval,
            job_timeout: args.job_timeout(),
        },
        shutdown_rx,
    )
    .await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }

    Ok(EXIT_OK)
}

async fn enqueue(args: EnqueueArgs) -> anyhow::Result<i32> {
    anyhow::ensure!(!args.command.is_empty(), "no command given after `--`");

    let spool = cli::spool_dir(args.spool.as_deref(), std::env::var(SPOOL_ENV).ok().as_deref());
    let broker = SpoolBroker::open(&spool).with_context(|| format!("cannot open spool at {}", spool))?;

    let job = Job::new(args.queue, args.command);
    let id = job.id.clone();
    broker.enqueue(job).await?;

    println!("{}", id);
    Ok(EXIT_OK)
}

fn validate(args: ValidateArgs) -> anyhow::Result<i32> {
    let services_file = ServicesFile::from_file(&args.services_file)?;

    let ctx = SubstitutionContext::new().with_inherited(BootstrapEnv::from_process().to_map());
    let descriptors = services_file.resolve(&ctx)?;
    let graph = DependencyGraph::build(&descriptors)?;

    println!("Services file '{}' is valid", args.services_file);
    println!("  Version: {}", services_file.version);
    println!("  Services: {}", services_file.services.len());
    println!("  Critical: {}", services_file.critical_count());
    println!(
        "  Launch order: {}",
        graph
            .launch_order()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    Ok(EXIT_OK)
}
