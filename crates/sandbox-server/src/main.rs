//! Sandbox service binary
//!
//! Runs the HTTP API, the worker pool, or both in one process. API and
//! worker processes started separately must share a Redis broker.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use sandbox_core::config::BrokerKind;
use sandbox_core::queue::redis_broker::DEFAULT_POLL_INTERVAL;
use sandbox_core::{
    Broker, ConfigLoader, ContainerRuntime, DockerRuntime, ExecutionQueue, MemoryBroker,
    RedisBroker, SandboxRunner, ServiceConfig, WorkerPool,
};
use sandbox_server::{shutdown_signal, SandboxServer, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Sandbox Service - run untrusted code in isolated containers")]
struct Cli {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(long, short, help = "YAML configuration file; defaults apply when omitted")]
    config: Option<PathBuf>,

    #[clap(long, help = "Override the HTTP bind address (host:port)")]
    bind_addr: Option<String>,

    #[clap(long, short, help = "Log level; defaults to logging.level from the configuration")]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP API and the worker pool (default command)
    All,
    /// Run only the HTTP API
    Api,
    /// Run only the worker pool
    Worker,
    /// Check the container engine and report which runner images are present
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let log_level_filter = level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    match cli.command.unwrap_or(Commands::All) {
        Commands::All => run_all(config, cli.bind_addr).await,
        Commands::Api => run_api(config, cli.bind_addr).await,
        Commands::Worker => run_worker(config).await,
        Commands::Check => run_check(config).await,
    }
}

async fn build_broker(config: &ServiceConfig) -> Result<Arc<dyn Broker>> {
    match config.broker.kind {
        BrokerKind::Memory => {
            log::info!("Using in-process job broker");
            Ok(Arc::new(MemoryBroker::new(config.jobs)))
        }
        BrokerKind::Redis => {
            let poll_interval = if config.broker.poll_interval_ms == 0 {
                DEFAULT_POLL_INTERVAL
            } else {
                config.broker.poll_interval()
            };
            let broker = RedisBroker::connect(
                &config.broker.redis_url(),
                &config.broker.queue_name,
                config.jobs,
                poll_interval,
            )
            .await
            .with_context(|| format!("Failed to connect to Redis at {}", config.broker.redis_url()))?;
            Ok(Arc::new(broker))
        }
    }
}

fn server_config(config: &ServiceConfig, bind_addr: Option<String>) -> Result<ServerConfig> {
    let mut server_config = ServerConfig::from_service_config(config)?;
    if let Some(addr) = bind_addr {
        server_config = server_config.with_bind_addr_str(&addr)?;
    }
    Ok(server_config)
}

fn start_workers(config: &ServiceConfig, broker: Arc<dyn Broker>) -> Result<WorkerPool> {
    let runtime = DockerRuntime::connect(config.docker.socket.as_deref())
        .context("Failed to connect to the Docker engine")?;
    let runner = SandboxRunner::new(
        Arc::new(runtime),
        Arc::new(config.registry()),
        config.runner_settings(),
    )
    .context("Failed to build the security profile")?;

    Ok(WorkerPool::start(broker, Arc::new(runner), config.worker_config()))
}

async fn run_all(config: ServiceConfig, bind_addr: Option<String>) -> Result<()> {
    let broker = build_broker(&config).await?;
    let pool = start_workers(&config, Arc::clone(&broker))?;
    let queue = ExecutionQueue::new(broker, Arc::new(config.registry()), config.request_limits());

    let server = SandboxServer::with_config(queue, server_config(&config, bind_addr)?);
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    // in-flight jobs are finished and recorded before exit
    pool.shutdown().await;
    served?;
    log::info!("Sandbox service shut down gracefully.");
    Ok(())
}

async fn run_api(config: ServiceConfig, bind_addr: Option<String>) -> Result<()> {
    if config.broker.kind == BrokerKind::Memory {
        log::warn!("API running with an in-process broker and no workers; jobs will never run");
    }
    let broker = build_broker(&config).await?;
    let queue = ExecutionQueue::new(broker, Arc::new(config.registry()), config.request_limits());

    let server = SandboxServer::with_config(queue, server_config(&config, bind_addr)?);
    if let Err(e) = server.serve_with_shutdown(shutdown_signal()).await {
        log::error!("Server failed: {}", e);
        return Err(e.into());
    }
    Ok(())
}

async fn run_worker(config: ServiceConfig) -> Result<()> {
    if config.broker.kind == BrokerKind::Memory {
        log::warn!("Worker running with an in-process broker; no API can reach it");
    }
    let broker = build_broker(&config).await?;
    let pool = start_workers(&config, broker)?;

    shutdown_signal().await;
    pool.shutdown().await;
    Ok(())
}

async fn run_check(config: ServiceConfig) -> Result<()> {
    let runtime = DockerRuntime::connect(config.docker.socket.as_deref())
        .context("Failed to connect to the Docker engine")?;
    runtime
        .ping()
        .await
        .context("Docker engine did not answer ping")?;
    println!("Docker engine: reachable");

    let mut missing = 0;
    for image in config.registry().images() {
        match runtime.image_exists(&image).await {
            Ok(true) => println!("  [ok]      {}", image),
            Ok(false) => {
                missing += 1;
                println!("  [missing] {}", image);
            }
            Err(e) => {
                missing += 1;
                println!("  [error]   {} ({})", image, e);
            }
        }
    }

    if config.broker.kind == BrokerKind::Redis {
        let broker = build_broker(&config).await?;
        broker.ping().await.context("Redis did not answer ping")?;
        println!("Redis broker: reachable at {}", config.broker.redis_url());
    }

    if missing > 0 {
        anyhow::bail!("{} runner image(s) are not available locally", missing);
    }
    Ok(())
}
