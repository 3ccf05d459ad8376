use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use treelink::cli::{Cli, Command, ConnectionsCommand};
use treelink::filters::FilterLoader;
use treelink::samples::{PING_ID, PingBack, PingFront};
use treelink::transport::memory::MemoryFabric;
use treelink::transport::{AttachPoint, BackNetwork, FrontNetwork, Topology, WorkerLaunch};
use treelink::{Config, Coordinator, DiscoveryStore, Environment, SessionError, Worker};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    debug!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    let result = match cli.command {
        Command::Demo {
            workers,
            topology,
            remote,
        } => cmd_demo(&config, workers, topology.as_deref(), remote).await,
        Command::Connections { file, command } => {
            let file = match file {
                Some(file) => file,
                None => Environment::from_process().connections_file()?,
            };
            let store = DiscoveryStore::new(file).with_retry(config.discovery.retry_policy());
            match command {
                ConnectionsCommand::Write { workers, leaves } => cmd_connections_write(&store, workers, &leaves),
                ConnectionsCommand::Lookup { rank } => cmd_connections_lookup(&store, rank).await,
            }
        }
    };

    let fatal = result
        .as_ref()
        .err()
        .and_then(|e| e.downcast_ref::<SessionError>())
        .filter(|session| session.is_fatal());
    if let Some(session) = fatal {
        error!(error = %session, "Fatal session error");
        eprintln!("{} {}", "✗".red(), session);
        std::process::exit(session.exit_code());
    }
    result
}

fn cmd_connections_write(store: &DiscoveryStore, workers: u32, leaves: &[AttachPoint]) -> Result<()> {
    debug!(workers, leaves = leaves.len(), "cmd_connections_write: called");
    let records = store.write_partition(workers, leaves)?;
    for record in &records {
        println!("{}", record.to_line());
    }
    println!(
        "{} Wrote {} entries to {}",
        "✓".green(),
        records.len(),
        store.path().display().to_string().cyan()
    );
    Ok(())
}

async fn cmd_connections_lookup(store: &DiscoveryStore, rank: u32) -> Result<()> {
    debug!(rank, "cmd_connections_lookup: called");
    let record = store.lookup(rank).await?;
    println!(
        "{} {} -> {}",
        "rank".dimmed(),
        rank.to_string().yellow(),
        record.attach_point().to_string().cyan()
    );
    Ok(())
}

async fn cmd_demo(config: &Config, workers: u32, topology: Option<&Path>, remote: bool) -> Result<()> {
    debug!(workers, ?topology, remote, "cmd_demo: called");
    let topology = match topology {
        Some(path) => Topology::load(path)?,
        None => Topology::flat("localhost", workers.max(1) as usize),
    };
    let fabric = MemoryFabric::new();
    let filter_path = Environment::from_process().filter_path();
    let mut coordinator = Coordinator::new(config).with_filters(FilterLoader::new(filter_path.as_deref()));

    let (tasks, connections) = if remote {
        let connections = std::env::temp_dir().join(format!("treelink-demo-{}.connections", std::process::id()));
        let front = fabric.create_group_with(topology, None)?;
        coordinator
            .adopt_remote(front as Arc<dyn FrontNetwork>, workers, &connections, false)
            .await?;

        let tasks = (0..workers)
            .map(|rank| {
                let fabric = fabric.clone();
                let store = DiscoveryStore::new(&connections).with_retry(config.discovery.retry_policy());
                tokio::spawn(async move {
                    let worker = Worker::attach_remote(&fabric, rank, &store).await?;
                    serve(worker).await
                })
            })
            .collect::<Vec<_>>();
        coordinator.connect().await?;
        (tasks, Some(connections))
    } else {
        let launch = WorkerLaunch {
            executable: "tl".to_string(),
            args: vec![],
        };
        let front = fabric.create_group_with(topology, Some(&launch))?;
        let tasks = fabric.take_spawned().into_iter().map(spawn_worker).collect::<Vec<_>>();
        coordinator.adopt_spawned(front).await?;
        (tasks, None)
    };
    let group_size = coordinator.num_workers();
    info!(workers = group_size, "Group is up");

    coordinator.load_protocol(Box::new(PingFront::new())).await?;
    let outcome = coordinator.dispatch(PING_ID).await;
    coordinator.shutdown().await?;

    let mut worker_errors = 0;
    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "Worker failed");
                worker_errors += 1;
            }
            Err(e) => {
                error!(error = %e, "Worker task panicked");
                worker_errors += 1;
            }
        }
    }
    if let Some(connections) = connections {
        let _ = std::fs::remove_file(connections);
    }

    let report = outcome?;
    if let Some(e) = &report.front_error {
        println!("{} {}: {:#}", "✗".red(), report.protocol, e);
        eyre::bail!("{} failed on the coordinator", report.protocol);
    }
    if worker_errors > 0 {
        eyre::bail!("{} workers did not exit cleanly", worker_errors);
    }
    println!(
        "{} {}: SUCCESS ({} workers)",
        "✓".green(),
        report.protocol.cyan(),
        group_size
    );
    Ok(())
}

fn spawn_worker(network: Arc<dyn BackNetwork>) -> JoinHandle<Result<(), SessionError>> {
    tokio::spawn(async move {
        let worker = Worker::from_network(network).await?;
        serve(worker).await
    })
}

async fn serve(mut worker: Worker) -> Result<(), SessionError> {
    debug!(rank = worker.who_am_i(), "serve: called");
    worker.load_protocol(Box::new(PingBack::new())).await?;
    worker.run_loop().await
}
