//! Queue Router pull-loop tests

mod common;

use common::{eventually, RecordingHandler};
use constellation::router::{
    serve, Broker, Job, JobHandler, MemoryBroker, PoolConfig, PoolReport, QueueBinding,
    RouterError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn config() -> PoolConfig {
    PoolConfig {
        poll_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

fn spawn_pool<B: Broker, H: JobHandler>(
    binding: QueueBinding,
    broker: Arc<B>,
    handler: Arc<H>,
    shutdown: watch::Receiver<()>,
) -> JoinHandle<Result<PoolReport, RouterError>> {
    tokio::spawn(async move { serve(&binding, broker, handler, config(), shutdown).await })
}

#[tokio::test(start_paused = true)]
async fn test_jobs_only_reach_pools_bound_to_their_queue() {
    let broker = Arc::new(MemoryBroker::new());
    for page in 0..3 {
        broker
            .enqueue(Job::new("ocr", ["extract".to_string(), page.to_string()]))
            .await
            .unwrap();
    }

    let (tx, rx) = watch::channel(());
    let high = Arc::new(RecordingHandler::default());
    let default = Arc::new(RecordingHandler::default());

    let high_pool = spawn_pool(
        QueueBinding::parse("high", "high", 2).unwrap(),
        Arc::clone(&broker),
        Arc::clone(&high),
        rx.clone(),
    );
    let default_pool = spawn_pool(
        QueueBinding::parse("default", "default,ocr", 1).unwrap(),
        Arc::clone(&broker),
        Arc::clone(&default),
        rx,
    );

    assert!(eventually(Duration::from_secs(5), || broker.completed().len() == 3).await);

    tx.send(()).unwrap();
    let high_report = high_pool.await.unwrap().unwrap();
    let default_report = default_pool.await.unwrap().unwrap();

    assert!(high.handled().is_empty());
    assert_eq!(default.handled().len(), 3);
    assert!(default.handled().iter().all(|job| job.queue == "ocr"));
    assert_eq!(high_report.succeeded, 0);
    assert_eq!(default_report.succeeded, 3);
    assert!(broker.polls("high") > 0);
}

#[tokio::test(start_paused = true)]
async fn test_earlier_queues_take_priority() {
    let broker = Arc::new(MemoryBroker::new());
    broker.enqueue(Job::new("low", ["low-1"])).await.unwrap();
    broker.enqueue(Job::new("low", ["low-2"])).await.unwrap();
    broker.enqueue(Job::new("high", ["high-1"])).await.unwrap();

    let (tx, rx) = watch::channel(());
    let handler = Arc::new(RecordingHandler::default());
    let pool = spawn_pool(
        QueueBinding::parse("pool", "high,low", 1).unwrap(),
        Arc::clone(&broker),
        Arc::clone(&handler),
        rx,
    );

    assert!(eventually(Duration::from_secs(5), || handler.handled().len() == 3).await);
    tx.send(()).unwrap();
    pool.await.unwrap().unwrap();

    let order: Vec<String> = handler
        .handled()
        .iter()
        .map(|job| job.command[0].clone())
        .collect();
    assert_eq!(order, vec!["high-1", "low-1", "low-2"]);
}

#[tokio::test(start_paused = true)]
async fn test_failing_job_is_recorded_once_and_loop_survives() {
    let broker = Arc::new(MemoryBroker::new());
    broker.enqueue(Job::new("default", ["fail"])).await.unwrap();

    let (tx, rx) = watch::channel(());
    let handler = Arc::new(RecordingHandler::default());
    let pool = spawn_pool(
        QueueBinding::parse("default", "default", 1).unwrap(),
        Arc::clone(&broker),
        Arc::clone(&handler),
        rx,
    );

    assert!(eventually(Duration::from_secs(5), || broker.failed().len() == 1).await);
    let polls_at_failure = broker.polls("default");
    assert!(eventually(Duration::from_secs(5), || broker.polls("default") > polls_at_failure).await);

    // A job enqueued after the failure is still picked up
    broker.enqueue(Job::new("default", ["ok"])).await.unwrap();
    assert!(eventually(Duration::from_secs(5), || broker.completed().len() == 1).await);

    tx.send(()).unwrap();
    let report = pool.await.unwrap().unwrap();

    let failed = broker.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].reason, "scripted failure");
    assert_eq!(report.failed, 1);
    assert_eq!(report.succeeded, 1);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_handler_fails_only_that_job() {
    let broker = Arc::new(MemoryBroker::new());
    broker.enqueue(Job::new("default", ["panic"])).await.unwrap();
    broker.enqueue(Job::new("default", ["ok"])).await.unwrap();

    let (tx, rx) = watch::channel(());
    let pool = spawn_pool(
        QueueBinding::parse("default", "default", 1).unwrap(),
        Arc::clone(&broker),
        Arc::new(RecordingHandler::default()),
        rx,
    );

    assert!(eventually(Duration::from_secs(5), || broker.completed().len() == 1).await);
    tx.send(()).unwrap();
    pool.await.unwrap().unwrap();

    let failed = broker.failed();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].reason.contains("panicked"));
}

#[tokio::test(start_paused = true)]
async fn test_hung_job_times_out_and_loop_moves_on() {
    let broker = Arc::new(MemoryBroker::new());
    broker.enqueue(Job::new("default", ["hang"])).await.unwrap();
    broker.enqueue(Job::new("default", ["ok"])).await.unwrap();

    let (tx, rx) = watch::channel(());
    let binding = QueueBinding::parse("default", "default", 1).unwrap();
    let pool = {
        let broker = Arc::clone(&broker);
        let config = PoolConfig {
            job_timeout: Some(Duration::from_secs(30)),
            ..config()
        };
        tokio::spawn(async move {
            serve(&binding, broker, Arc::new(RecordingHandler::default()), config, rx).await
        })
    };

    assert!(eventually(Duration::from_secs(60), || broker.completed().len() == 1).await);
    tx.send(()).unwrap();
    let report = pool.await.unwrap().unwrap();

    let failed = broker.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].job.command, vec!["hang"]);
    assert!(failed[0].reason.contains("timed out"), "{}", failed[0].reason);
    assert_eq!(report.failed, 1);
    assert_eq!(report.succeeded, 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_pool_stops_on_shutdown() {
    let broker = Arc::new(MemoryBroker::new());
    let (tx, rx) = watch::channel(());
    let pool = spawn_pool(
        QueueBinding::parse("idle", "high,default", 4).unwrap(),
        Arc::clone(&broker),
        Arc::new(RecordingHandler::default()),
        rx,
    );

    tokio::time::sleep(Duration::from_secs(1)).await;
    tx.send(()).unwrap();

    let report = tokio::time::timeout(Duration::from_secs(1), pool)
        .await
        .expect("pool did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(report.succeeded + report.failed, 0);
    assert!(report.cycles >= 4);
}

#[cfg(unix)]
#[tokio::test]
async fn test_spool_broker_with_command_handler() {
    use constellation::router::{CommandHandler, SpoolBroker};

    let dir = tempfile::tempdir().unwrap();
    let producer = SpoolBroker::open(dir.path()).unwrap();
    producer
        .enqueue(Job::new("ocr", ["sh", "-c", "exit 0"]))
        .await
        .unwrap();
    producer
        .enqueue(Job::new("ocr", ["sh", "-c", "exit 5"]))
        .await
        .unwrap();

    let (tx, rx) = watch::channel(());
    let pool = spawn_pool(
        QueueBinding::parse("default", "default,ocr", 2).unwrap(),
        Arc::new(SpoolBroker::open(dir.path()).unwrap()),
        Arc::new(CommandHandler::new()),
        rx,
    );

    let count = |state: &str| {
        std::fs::read_dir(dir.path().join("ocr").join(state))
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|e| e.file_name().to_string_lossy().ends_with(".json"))
                    .count()
            })
            .unwrap_or(0)
    };

    assert!(eventually(Duration::from_secs(10), || count("done") == 1 && count("failed") == 1).await);
    tx.send(()).unwrap();

    let report = pool.await.unwrap().unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(count("pending"), 0);
}
