use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use napper_daemon::api;
use napper_daemon::clock::system_clock;
use napper_daemon::config::NapperConfig;
use napper_daemon::detector::RequestDetector;
use napper_daemon::health::HttpHealthChecker;
use napper_daemon::persistence::StatePersistence;
use napper_daemon::runner::{ContainerRuntime, DockerRuntime, Runner};
use napper_daemon::supervisor::Supervisor;
use napper_daemon::VERSION;

#[derive(Parser)]
#[command(
    name = "kamal-napper",
    version,
    about = "Stops idle kamal-proxy applications and wakes them on demand"
)]
struct Args {
    /// Path to the YAML config file (defaults + environment when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => NapperConfig::load(path)?,
        None => NapperConfig::from_env()?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    info!("Starting kamal-napper {}", VERSION);

    std::fs::create_dir_all(&config.state_dir).with_context(|| {
        format!("Failed to create state directory {:?}", config.state_dir)
    })?;

    let config = Arc::new(config);
    let clock = system_clock();
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerRuntime::new(config.proxy_container.clone()));

    let detector = RequestDetector::new(&config, runtime.clone(), clock.clone());
    let health = Arc::new(HttpHealthChecker::new(&config)?);
    let runner = Runner::new(runtime, config.max_retries, config.proxy_container.clone());
    let persistence = StatePersistence::new(config.state_dir.clone(), clock.clone());

    let supervisor = Arc::new(Supervisor::new(
        config.clone(),
        clock,
        detector,
        health,
        runner,
        persistence,
    ));
    supervisor.restore();

    tokio::spawn(handle_signals(supervisor.clone()));

    let bind_addr = config.bind_addr();
    let api_supervisor = supervisor.clone();
    let api_task = tokio::spawn(async move {
        if let Err(e) = api::serve(api_supervisor, bind_addr).await {
            error!("Control API failed: {}", e);
        }
    });

    supervisor.run().await;
    let _ = api_task.await;

    info!("kamal-napper exited cleanly");
    Ok(())
}

/// SIGTERM/SIGINT trip the shutdown flag; SIGUSR1 dumps status to the log.
async fn handle_signals(supervisor: Arc<Supervisor>) {
    let (mut sigterm, mut sigint, mut sigusr1) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::user_defined1()),
    ) {
        (Ok(t), Ok(i), Ok(u)) => (t, i, u),
        _ => {
            error!("Failed to install signal handlers");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                supervisor.shutdown();
                return;
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down");
                supervisor.shutdown();
                return;
            }
            _ = sigusr1.recv() => {
                let status = supervisor.status();
                info!(
                    "Status: {} apps, loop running: {}",
                    status.app_count, status.running
                );
                for (host, app) in &status.apps {
                    info!("  {}: {} ({}s in state)", host, app.state, app.seconds_in_state);
                }
            }
        }
    }
}
