use crate::{
    orchestrator::Orchestrator,
    queue::{QueueError, RequestQueue, Shutdown},
    submit::ClusterGate,
};
use std::{sync::Arc, thread::JoinHandle, time::Duration};
use tracing::{debug, error, info};

/// The sole consumer of the pipeline. Holds the cluster gate while a request
/// runs, so at most one experiment is ever in flight.
pub struct WorkerLoop {
    orchestrator: Arc<Orchestrator>,
    gate: Arc<ClusterGate>,
    queue: RequestQueue,
    shutdown: Shutdown,
    poll_interval: Duration,
}

impl WorkerLoop {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        gate: Arc<ClusterGate>,
        queue: RequestQueue,
        shutdown: Shutdown,
        poll_interval: Duration,
    ) -> Self {
        Self {
            orchestrator,
            gate,
            queue,
            shutdown,
            poll_interval,
        }
    }

    /// Drive the orchestrator until shutdown. Cancellation is observed at the
    /// loop checkpoints only, an in-flight cluster job always runs to its
    /// exit code.
    pub fn run(&self) {
        info!("Experiment worker started");

        while !self.shutdown.is_triggered() {
            let permit = self.gate.acquire();

            // the persisted store, not the wake queue, decides what runs next
            match self.orchestrator.next_queued_experiment() {
                Ok(Some(request)) => {
                    self.orchestrator.run_experiment(&permit, &request);
                }
                Ok(None) => debug!("No experiment queued"),
                Err(error) => error!(error = %error, "Failed to poll for queued experiments"),
            }

            drop(permit);

            // sleep one poll interval, cut short by a wake token or shutdown
            match self.queue.dequeue_timeout(&self.shutdown, self.poll_interval) {
                Ok(_) => {}
                Err(QueueError::Cancelled) | Err(QueueError::EmptyWake) => break,
            }
        }

        info!("Experiment worker stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("experiment-worker".to_owned())
            .spawn(move || self.run())
            .expect("Failed to spawn the experiment worker thread")
    }
}
