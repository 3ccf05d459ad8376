//! Integration tests for treelink
//!
//! These tests run whole sessions (coordinator plus workers) over the
//! in-process transport, and drive the `tl` binary.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_cmd::Command;
use async_trait::async_trait;
use eyre::Result;
use predicates::prelude::*;
use tempfile::TempDir;
use tokio::task::JoinHandle;

use treelink::config::{ENV_CONNECTIONS_FILE, ENV_NUM_WORKERS, ENV_TOPOLOGY_FILE};
use treelink::samples::{PING_ID, PingBack, PingFront};
use treelink::transport::memory::MemoryFabric;
use treelink::transport::Topology;
use treelink::{
    BackContext, BackProtocol, BackSetup, Config, ControlPolicy, ControlState, Coordinator, DiscoveryStore,
    Environment, FrontContext, FrontProtocol, FrontSetup, RetryPolicy, SessionError, SyncPolicy, TransformFilter,
    Worker, WorkerHooks, WorkerLaunch,
};

// =============================================================================
// Test protocols
// =============================================================================

/// Coordinator half that does nothing but count its runs
struct Noop {
    id: &'static str,
    runs: Arc<AtomicUsize>,
    fail: bool,
}

impl Noop {
    fn new(id: &'static str) -> Self {
        Self {
            id,
            runs: Arc::new(AtomicUsize::new(0)),
            fail: false,
        }
    }
}

#[async_trait]
impl FrontProtocol for Noop {
    fn id(&self) -> &str {
        self.id
    }

    async fn setup(&mut self, _setup: &mut FrontSetup<'_>) -> Result<()> {
        Ok(())
    }

    async fn run(&mut self, _ctx: &mut FrontContext<'_>) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            eyre::bail!("coordinator half failed");
        }
        Ok(())
    }
}

/// Worker half that succeeds or fails as told
struct Outcome {
    id: &'static str,
    fail: bool,
}

#[async_trait]
impl BackProtocol for Outcome {
    fn id(&self) -> &str {
        self.id
    }

    async fn setup(&mut self, _setup: &mut BackSetup<'_>) -> Result<()> {
        Ok(())
    }

    async fn run(&mut self, _ctx: &mut BackContext<'_>) -> Result<()> {
        if self.fail {
            eyre::bail!("worker half failed");
        }
        Ok(())
    }
}

const CHANNEL_KINDS: [(TransformFilter, SyncPolicy); 3] = [
    (TransformFilter::Null, SyncPolicy::DontWait),
    (TransformFilter::Sum, SyncPolicy::WaitForAll),
    (TransformFilter::Null, SyncPolicy::WaitForAll),
];

struct ChannelsFront;

#[async_trait]
impl FrontProtocol for ChannelsFront {
    fn id(&self) -> &str {
        "CHANNELS"
    }

    async fn setup(&mut self, setup: &mut FrontSetup<'_>) -> Result<()> {
        for (transform, sync) in CHANNEL_KINDS {
            setup.create_channel(transform, sync)?;
        }
        Ok(())
    }

    async fn run(&mut self, _ctx: &mut FrontContext<'_>) -> Result<()> {
        Ok(())
    }
}

struct ChannelsBack {
    seen: Arc<Mutex<Vec<(TransformFilter, SyncPolicy)>>>,
}

#[async_trait]
impl BackProtocol for ChannelsBack {
    fn id(&self) -> &str {
        "CHANNELS"
    }

    async fn setup(&mut self, setup: &mut BackSetup<'_>) -> Result<()> {
        while setup.remaining() > 0 {
            let channel = setup.next_channel()?;
            self.seen
                .lock()
                .map_err(|_| eyre::eyre!("poisoned"))?
                .push((channel.transform(), channel.sync()));
        }
        Ok(())
    }

    async fn run(&mut self, _ctx: &mut BackContext<'_>) -> Result<()> {
        Ok(())
    }
}

struct BarrierFront;

#[async_trait]
impl FrontProtocol for BarrierFront {
    fn id(&self) -> &str {
        "BARRIER"
    }

    async fn setup(&mut self, _setup: &mut FrontSetup<'_>) -> Result<()> {
        Ok(())
    }

    async fn run(&mut self, ctx: &mut FrontContext<'_>) -> Result<()> {
        ctx.barrier().await?;
        Ok(())
    }
}

struct BarrierBack;

#[async_trait]
impl BackProtocol for BarrierBack {
    fn id(&self) -> &str {
        "BARRIER"
    }

    async fn setup(&mut self, _setup: &mut BackSetup<'_>) -> Result<()> {
        Ok(())
    }

    async fn run(&mut self, ctx: &mut BackContext<'_>) -> Result<()> {
        ctx.barrier().await?;
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

type WorkerTask = JoinHandle<Result<u32, SessionError>>;

fn fast_config(policy: ControlPolicy) -> Config {
    let mut config = Config::default();
    config.control.policy = policy;
    config.bring_up.poll_interval_ms = 10;
    config.bring_up.max_attach_retries = 500;
    config
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 200,
        idle: Duration::from_millis(10),
    }
}

async fn serve(mut worker: Worker, protocols: Vec<Box<dyn BackProtocol>>) -> Result<u32, SessionError> {
    for protocol in protocols {
        worker.load_protocol(protocol).await?;
    }
    worker.run_loop().await?;
    Ok(worker.who_am_i())
}

/// Coordinator plus spawned workers; worker `i` loads `backs(i)` in order
async fn spawned_session<F>(config: &Config, workers: usize, backs: F) -> (Coordinator, Vec<WorkerTask>)
where
    F: Fn(usize) -> Vec<Box<dyn BackProtocol>>,
{
    let fabric = MemoryFabric::new();
    let front = fabric
        .create_group_with(Topology::flat("localhost", workers), Some(&WorkerLaunch::default()))
        .expect("Failed to create group");

    let tasks = fabric
        .take_spawned()
        .into_iter()
        .enumerate()
        .map(|(i, network)| {
            let protocols = backs(i);
            tokio::spawn(async move {
                let worker = Worker::from_network(network).await?;
                serve(worker, protocols).await
            })
        })
        .collect();

    let mut coordinator = Coordinator::new(config);
    coordinator.adopt_spawned(front).await.expect("Failed to bring up");
    (coordinator, tasks)
}

async fn join_workers(tasks: Vec<WorkerTask>) -> Vec<u32> {
    let mut ranks = Vec::new();
    for task in tasks {
        let rank = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("Worker did not exit")
            .expect("Worker panicked")
            .expect("Worker failed");
        ranks.push(rank);
    }
    ranks.sort();
    ranks
}

// =============================================================================
// Spawned sessions
// =============================================================================

#[tokio::test]
async fn test_ping_session() {
    let config = fast_config(ControlPolicy::Blocking);
    let (mut coordinator, tasks) =
        spawned_session(&config, 3, |_| vec![Box::new(PingBack::new()) as Box<dyn BackProtocol>]).await;
    assert!(coordinator.is_up());
    assert_eq!(coordinator.num_workers(), 3);
    assert_eq!(coordinator.connected_workers(), 3);

    coordinator.load_protocol(Box::new(PingFront::new())).await.unwrap();
    let report = coordinator.dispatch(PING_ID).await.unwrap();
    assert!(report.front_succeeded());
    // Protocols can be dispatched repeatedly
    coordinator.dispatch(PING_ID).await.unwrap();

    coordinator.shutdown().await.unwrap();
    assert_eq!(join_workers(tasks).await.len(), 3);
}

#[tokio::test]
async fn test_failures_are_summed() {
    let config = fast_config(ControlPolicy::Blocking);
    let (mut coordinator, tasks) = spawned_session(&config, 4, |i| {
        vec![
            Box::new(Outcome { id: "FLAKY", fail: i == 2 }) as Box<dyn BackProtocol>,
            Box::new(Outcome { id: "GOOD", fail: false }),
        ]
    })
    .await;

    coordinator.load_protocol(Box::new(Noop::new("FLAKY"))).await.unwrap();
    coordinator.load_protocol(Box::new(Noop::new("GOOD"))).await.unwrap();

    let err = coordinator.dispatch("FLAKY").await.unwrap_err();
    assert!(matches!(
        &err,
        SessionError::DispatchFailed { protocol, failed: 1 } if protocol == "FLAKY"
    ));
    assert_eq!(err.to_string(), "FLAKY: 1 workers failed");
    assert!(!err.is_fatal());

    // The session survives a soft failure
    coordinator.dispatch("GOOD").await.unwrap();
    assert_eq!(coordinator.state(), ControlState::Ready);

    coordinator.shutdown().await.unwrap();
    join_workers(tasks).await;
}

#[tokio::test]
async fn test_non_blocking_policy_counts_each_reply() {
    let config = fast_config(ControlPolicy::NonBlocking);
    let (mut coordinator, tasks) = spawned_session(&config, 3, |i| {
        vec![
            Box::new(PingBack::new()) as Box<dyn BackProtocol>,
            Box::new(Outcome { id: "FLAKY", fail: i != 1 }),
        ]
    })
    .await;
    assert_eq!(coordinator.policy(), ControlPolicy::NonBlocking);

    coordinator.load_protocol(Box::new(PingFront::new())).await.unwrap();
    coordinator.load_protocol(Box::new(Noop::new("FLAKY"))).await.unwrap();

    coordinator.dispatch(PING_ID).await.unwrap();
    let err = coordinator.dispatch("FLAKY").await.unwrap_err();
    assert!(matches!(err, SessionError::DispatchFailed { failed: 2, .. }));

    coordinator.shutdown().await.unwrap();
    join_workers(tasks).await;
}

#[tokio::test]
async fn test_unregistered_protocol() {
    let config = fast_config(ControlPolicy::Blocking);
    // Workers pair the coordinator's FRONT_ONLY load with a protocol of another name
    let (mut coordinator, tasks) = spawned_session(&config, 2, |_| {
        vec![Box::new(Outcome { id: "OTHER", fail: true }) as Box<dyn BackProtocol>]
    })
    .await;

    let front = Noop::new("FRONT_ONLY");
    let runs = front.runs.clone();
    coordinator.load_protocol(Box::new(front)).await.unwrap();

    // Unknown to the coordinator: fails without broadcasting anything
    let err = coordinator.dispatch("MISSING").await.unwrap_err();
    assert!(matches!(err, SessionError::UnknownProtocol(ref id) if id == "MISSING"));
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    // Unknown to the workers: they skip it and acknowledge success
    coordinator.dispatch("FRONT_ONLY").await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(coordinator.fetch_protocol("FRONT_ONLY").is_some());
    assert!(coordinator.fetch_protocol("OTHER").is_none());

    coordinator.shutdown().await.unwrap();
    join_workers(tasks).await;
}

#[tokio::test]
async fn test_coordinator_half_failure_is_reported() {
    let config = fast_config(ControlPolicy::Blocking);
    let (mut coordinator, tasks) = spawned_session(&config, 2, |_| {
        vec![Box::new(Outcome { id: "HALF", fail: false }) as Box<dyn BackProtocol>]
    })
    .await;

    let mut front = Noop::new("HALF");
    front.fail = true;
    coordinator.load_protocol(Box::new(front)).await.unwrap();

    let report = coordinator.dispatch("HALF").await.unwrap();
    assert!(!report.front_succeeded());
    assert_eq!(report.protocol, "HALF");

    coordinator.shutdown().await.unwrap();
    join_workers(tasks).await;
}

#[tokio::test]
async fn test_channels_arrive_in_creation_order() {
    let config = fast_config(ControlPolicy::Blocking);
    let seen: Vec<Arc<Mutex<Vec<(TransformFilter, SyncPolicy)>>>> =
        (0..3).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();
    let per_worker = seen.clone();
    let (mut coordinator, tasks) = spawned_session(&config, 3, move |i| {
        vec![Box::new(ChannelsBack {
            seen: per_worker[i].clone(),
        }) as Box<dyn BackProtocol>]
    })
    .await;

    coordinator.load_protocol(Box::new(ChannelsFront)).await.unwrap();
    coordinator.dispatch("CHANNELS").await.unwrap();
    coordinator.shutdown().await.unwrap();
    join_workers(tasks).await;

    for worker in &seen {
        assert_eq!(*worker.lock().unwrap(), CHANNEL_KINDS.to_vec());
    }
}

#[tokio::test]
async fn test_barrier_releases_every_worker() {
    for policy in [ControlPolicy::Blocking, ControlPolicy::NonBlocking] {
        let config = fast_config(policy);
        let (mut coordinator, tasks) =
            spawned_session(&config, 4, |_| vec![Box::new(BarrierBack) as Box<dyn BackProtocol>]).await;

        coordinator.load_protocol(Box::new(BarrierFront)).await.unwrap();
        let report = coordinator.dispatch("BARRIER").await.unwrap();
        assert!(report.front_succeeded(), "{:?}", report.front_error);

        coordinator.shutdown().await.unwrap();
        join_workers(tasks).await;
    }
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let config = fast_config(ControlPolicy::Blocking);
    let (mut coordinator, tasks) =
        spawned_session(&config, 2, |_| vec![Box::new(PingBack::new()) as Box<dyn BackProtocol>]).await;
    coordinator.load_protocol(Box::new(PingFront::new())).await.unwrap();

    coordinator.shutdown().await.unwrap();
    assert_eq!(coordinator.state(), ControlState::Closed);
    assert!(!coordinator.is_up());
    coordinator.shutdown().await.unwrap();

    join_workers(tasks).await;

    let err = coordinator.dispatch(PING_ID).await.unwrap_err();
    assert!(matches!(err, SessionError::InvalidState { .. }));
}

#[derive(Default)]
struct CountingHooks {
    before: Vec<String>,
    after_ok: usize,
    after_err: usize,
}

impl WorkerHooks for CountingHooks {
    fn before(&mut self, id: &str, _protocol: &dyn BackProtocol) {
        self.before.push(id.to_string());
    }

    fn after(&mut self, _id: &str, _protocol: &dyn BackProtocol, outcome: &Result<()>) {
        if outcome.is_ok() {
            self.after_ok += 1;
        } else {
            self.after_err += 1;
        }
    }
}

#[tokio::test]
async fn test_worker_hooks_wrap_every_run() {
    let fabric = MemoryFabric::new();
    let front = fabric
        .create_group_with(Topology::flat("localhost", 1), Some(&WorkerLaunch::default()))
        .unwrap();
    let network = fabric.take_spawned().remove(0);

    let worker = tokio::spawn(async move {
        let mut worker = Worker::from_network(network).await?;
        worker.load_protocol(Box::new(Outcome { id: "OK", fail: false })).await?;
        worker.load_protocol(Box::new(Outcome { id: "BAD", fail: true })).await?;
        let mut hooks = CountingHooks::default();
        worker.run_loop_with(&mut hooks).await?;
        Ok::<_, SessionError>(hooks)
    });

    let mut coordinator = Coordinator::new(&fast_config(ControlPolicy::Blocking));
    coordinator.adopt_spawned(front).await.unwrap();
    coordinator.load_protocol(Box::new(Noop::new("OK"))).await.unwrap();
    coordinator.load_protocol(Box::new(Noop::new("BAD"))).await.unwrap();

    coordinator.dispatch("OK").await.unwrap();
    assert!(coordinator.dispatch("BAD").await.is_err());
    coordinator.shutdown().await.unwrap();

    let hooks = worker.await.unwrap().unwrap();
    assert_eq!(hooks.before, vec!["OK".to_string(), "BAD".to_string()]);
    assert_eq!(hooks.after_ok, 1);
    assert_eq!(hooks.after_err, 1);
}

// =============================================================================
// Remote sessions
// =============================================================================

#[tokio::test]
async fn test_remote_workers_find_their_parent() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let connections = temp_dir.path().join("connections");

    let fabric = MemoryFabric::new();
    let front = fabric.create_group_with(Topology::flat("localhost", 2), None).unwrap();
    let mut coordinator = Coordinator::new(&fast_config(ControlPolicy::Blocking));
    coordinator.adopt_remote(front, 3, &connections, false).await.unwrap();
    assert!(coordinator.is_connections_file_written());
    assert!(!coordinator.is_up());

    let content = std::fs::read_to_string(&connections).unwrap();
    assert_eq!(content.lines().count(), 3);

    let tasks: Vec<WorkerTask> = (0..3)
        .map(|rank| {
            let fabric = fabric.clone();
            let store = DiscoveryStore::new(&connections).with_retry(fast_retry());
            tokio::spawn(async move {
                let worker = Worker::attach_remote(&fabric, rank, &store).await?;
                serve(worker, vec![Box::new(PingBack::new())]).await
            })
        })
        .collect();

    coordinator.connect().await.unwrap();
    assert!(coordinator.is_up());
    assert_eq!(coordinator.connected_workers(), 3);

    coordinator.load_protocol(Box::new(PingFront::new())).await.unwrap();
    coordinator.dispatch(PING_ID).await.unwrap();
    coordinator.shutdown().await.unwrap();

    assert_eq!(join_workers(tasks).await, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_remote_bring_up_from_environment() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let topology = temp_dir.path().join("topology");
    let connections = temp_dir.path().join("connections");
    std::fs::write(&topology, "localhost:0 => localhost:1 localhost:2 ;\n").unwrap();

    let vars = vec![
        (ENV_TOPOLOGY_FILE, topology.display().to_string()),
        (ENV_NUM_WORKERS, "2".to_string()),
        (ENV_CONNECTIONS_FILE, connections.display().to_string()),
    ];
    let env = Arc::new(move |name: &str| {
        vars.iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.clone())
    });

    let fabric = MemoryFabric::new();
    // Workers start first and poll until the coordinator writes the store
    let tasks: Vec<WorkerTask> = (0..2)
        .map(|rank| {
            let fabric = fabric.clone();
            let lookup = env.clone();
            tokio::spawn(async move {
                let env = Environment::with_lookup(move |name| lookup(name));
                let worker = Worker::attach_from_env(&fabric, rank, &env, fast_retry()).await?;
                serve(worker, vec![Box::new(PingBack::new())]).await
            })
        })
        .collect();

    let mut coordinator = Coordinator::new(&fast_config(ControlPolicy::Blocking));
    let lookup = env.clone();
    let front_env = Environment::with_lookup(move |name| lookup(name));
    coordinator
        .init_remote_from_env(&fabric, &front_env, true)
        .await
        .unwrap();
    assert_eq!(coordinator.connected_workers(), 2);

    coordinator.load_protocol(Box::new(PingFront::new())).await.unwrap();
    coordinator.dispatch(PING_ID).await.unwrap();
    coordinator.shutdown().await.unwrap();

    assert_eq!(join_workers(tasks).await, vec![0, 1]);
}

#[tokio::test]
async fn test_remote_bring_up_times_out() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let fabric = MemoryFabric::new();
    let front = fabric.create_group_with(Topology::flat("localhost", 1), None).unwrap();

    let mut config = fast_config(ControlPolicy::Blocking);
    config.bring_up.max_attach_retries = 2;
    let mut coordinator = Coordinator::new(&config);
    let err = coordinator
        .adopt_remote(front, 2, &temp_dir.path().join("connections"), true)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::AttachTimeout { missing: 2, retries: 2 }));
    assert!(err.is_retry_exhausted());
    assert!(!coordinator.is_up());
}

#[tokio::test]
async fn test_worker_gives_up_without_entry() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let fabric = MemoryFabric::new();
    let store = DiscoveryStore::new(temp_dir.path().join("never-written")).with_retry(RetryPolicy {
        max_retries: 3,
        idle: Duration::from_millis(5),
    });

    let err = Worker::attach_remote(&fabric, 0, &store).await.err().unwrap();
    assert!(err.is_retry_exhausted());
}

// =============================================================================
// Binary
// =============================================================================

#[test]
fn test_cli_demo_spawned() {
    Command::cargo_bin("tl")
        .unwrap()
        .args(["demo", "--workers", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("PING").and(predicate::str::contains("SUCCESS")));
}

#[test]
fn test_cli_demo_remote() {
    Command::cargo_bin("tl")
        .unwrap()
        .args(["demo", "--workers", "2", "--remote"])
        .assert()
        .success()
        .stdout(predicate::str::contains("SUCCESS"));
}

#[test]
fn test_cli_connections_write_then_lookup() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let file = temp_dir.path().join("connections");
    let file_arg = file.display().to_string();

    Command::cargo_bin("tl")
        .unwrap()
        .args([
            "connections",
            "--file",
            &file_arg,
            "write",
            "--workers",
            "3",
            "--leaf",
            "h1:5000:1",
            "--leaf",
            "h2:5001:2",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("h1 5000 1 0"));

    Command::cargo_bin("tl")
        .unwrap()
        .args(["connections", "--file", &file_arg, "lookup", "--rank", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("h2:5001:2"));
}

#[test]
fn test_cli_lookup_missing_rank_fails() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = temp_dir.path().join("treelink.yml");
    std::fs::write(&config, "discovery:\n  max-retries: 2\n  idle-secs: 0\n").unwrap();
    let file = temp_dir.path().join("connections");
    std::fs::write(&file, "h1 5000 1 0\n").unwrap();

    Command::cargo_bin("tl")
        .unwrap()
        .args([
            "--config",
            &config.display().to_string(),
            "connections",
            "--file",
            &file.display().to_string(),
            "lookup",
            "--rank",
            "7",
        ])
        .assert()
        .failure();
}
