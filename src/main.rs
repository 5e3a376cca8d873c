use clap::Parser;
use std::{path::PathBuf, process::exit, sync::Arc};
use swarmlab_runner::{
    config::{ConfigError, RunnerConfig},
    orchestrator::Orchestrator,
    queue::{RequestQueue, Shutdown},
    store::sqlite::SharedStore,
    submit::{ClusterGate, Submitter},
    worker::WorkerLoop,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Experiment submission pipeline for a shared Spark/Docker-Swarm cluster")]
struct Cli {
    /// path to the runner configuration file
    #[arg(short, long, default_value = "swarmlab.yaml")]
    config: PathBuf,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    if let Err(error) = run(&cli) {
        error!(error = %error, "Runner failed to start");
        exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = RunnerConfig::load(&cli.config)?;

    if config.preflight_checks() {
        return Err(Box::new(ConfigError::PreflightFailed));
    }

    let store = SharedStore::open(&config.database.path)?;
    store.init()?;

    let queue = RequestQueue::new();
    let shutdown = Shutdown::new();
    shutdown.trigger_on_signals()?;
    let gate = Arc::new(ClusterGate::new());
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        queue.clone(),
        Submitter::new(config.swarm.clone()),
    ));

    // wake-up signals do not survive a restart, the persisted rows do
    let requeued = orchestrator.requeue_interrupted()?;
    info!(
        requeued = requeued,
        database = %config.database.path.to_string_lossy(),
        "Experiment pipeline ready"
    );

    WorkerLoop::new(
        orchestrator,
        gate,
        queue,
        shutdown,
        config.worker.poll_interval(),
    )
    .run();

    Ok(())
}
