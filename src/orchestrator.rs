use crate::{
    model::{
        Algorithm, AlgorithmId, ExperimentId, ExperimentRequest, ExperimentResult,
        ExperimentStatus, NewAlgorithm, SubmissionRequest,
    },
    queue::{QueueError, RequestQueue},
    store::{sqlite::SharedStore, StoreError},
    submit::{ClusterPermit, SubmissionContext, SubmissionOutcome, SubmitError, Submitter},
};
use chrono::Utc;
use itertools::Itertools;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Submission is missing required field '{0}'")]
    MissingField(&'static str),
    #[error("Algorithm {0} is not registered")]
    UnknownAlgorithm(AlgorithmId),
    #[error("Driver index {index} of parameter '{name}' is outside the accepted range")]
    DriverIndexOutOfRange { name: String, index: i64 },
    #[error("Driver index {index} is bound by more than one parameter")]
    DuplicateDriverIndex { index: u32 },
    #[error("Experiment {0} vanished from the store mid-run")]
    VanishedExperiment(ExperimentId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
}

/// Owner of the request state machine. Every status transition in the system
/// goes through here, nothing else writes experiment rows.
pub struct Orchestrator {
    store: SharedStore,
    queue: RequestQueue,
    submitter: Submitter,
}

impl Orchestrator {
    pub fn new(store: SharedStore, queue: RequestQueue, submitter: Submitter) -> Self {
        Self {
            store,
            queue,
            submitter,
        }
    }

    /// Register an algorithm and its declared parameters. Driver indices are
    /// validated here once, submissions trust them afterwards.
    pub fn register_algorithm(
        &self,
        registration: NewAlgorithm,
    ) -> Result<AlgorithmId, OrchestratorError> {
        if registration.name.trim().is_empty() {
            return Err(OrchestratorError::MissingField("name"));
        }
        if registration.main_class_name.trim().is_empty() {
            return Err(OrchestratorError::MissingField("main_class_name"));
        }
        if registration.jar_file_name.trim().is_empty() {
            return Err(OrchestratorError::MissingField("jar_file_name"));
        }

        // negative and oversized indices alike, nothing is silently truncated
        let mut parameters = Vec::with_capacity(registration.parameters.len());
        for parameter in &registration.parameters {
            let index = u32::try_from(parameter.driver_index).map_err(|_| {
                OrchestratorError::DriverIndexOutOfRange {
                    name: parameter.name.clone(),
                    index: parameter.driver_index,
                }
            })?;
            parameters.push((parameter.name.clone(), index));
        }
        if let Some(duplicate) = parameters
            .iter()
            .map(|(_, index)| *index)
            .duplicates()
            .next()
        {
            return Err(OrchestratorError::DuplicateDriverIndex { index: duplicate });
        }

        let algorithm = Algorithm {
            id: Uuid::new_v4().to_string(),
            user_id: registration.user_id,
            name: registration.name,
            main_class_name: registration.main_class_name,
            jar_file_name: registration.jar_file_name,
        };

        self.store.insert_algorithm(&algorithm, &parameters)?;

        info!(algorithm = %algorithm.id, name = %algorithm.name, "Registered algorithm");

        Ok(algorithm.id)
    }

    /// Validate, persist and enqueue one submission. Persisting is
    /// all-or-nothing and happens before the wake-up signal, so a crash
    /// between the two loses at most queue latency, never the request.
    #[instrument(skip(self, submission), fields(user = %user_id), level = "info")]
    pub fn submit_experiment(
        &self,
        submission: SubmissionRequest,
        user_id: &str,
    ) -> Result<ExperimentId, OrchestratorError> {
        if user_id.trim().is_empty() {
            return Err(OrchestratorError::MissingField("user_id"));
        }
        if submission.algorithm_id.trim().is_empty() {
            return Err(OrchestratorError::MissingField("algorithm_id"));
        }
        if submission.dataset_name.trim().is_empty() {
            return Err(OrchestratorError::MissingField("dataset_name"));
        }
        if self.store.algorithm(&submission.algorithm_id)?.is_none() {
            return Err(OrchestratorError::UnknownAlgorithm(submission.algorithm_id));
        }

        let request = ExperimentRequest {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_owned(),
            algorithm_id: submission.algorithm_id,
            dataset_name: submission.dataset_name,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            status: ExperimentStatus::WaitingInQueue,
            parameters_blob: submission.parameters_blob,
            error_message: None,
        };

        self.store
            .insert_experiment(&request, &submission.cluster, &submission.parameter_values)?;

        // the row is durable at this point, a lost wake only costs latency
        if let Err(e) = self.queue.enqueue(request.id.clone()) {
            warn!(experiment = %request.id, error = %e, "Failed to signal the worker queue");
        }

        info!(experiment = %request.id, "Experiment submitted");

        Ok(request.id)
    }

    /// Oldest persisted request still waiting, independent of the in-memory
    /// queue. This is what makes the pipeline resumable after a restart.
    pub fn next_queued_experiment(&self) -> Result<Option<ExperimentRequest>, OrchestratorError> {
        Ok(self.store.next_queued()?)
    }

    /// Re-signal requests that were already persisted as waiting when the
    /// process last went down.
    pub fn requeue_interrupted(&self) -> Result<usize, OrchestratorError> {
        let ids = self.store.queued_ids()?;
        let count = ids.len();

        for id in ids {
            self.queue.enqueue(id)?;
        }

        if count > 0 {
            info!(count = count, "Requeued experiments left over from a previous run");
        }

        Ok(count)
    }

    /// Drive one request to a terminal state. Failures of any kind are
    /// absorbed into a `Failed` row, the caller (the worker loop) must never
    /// see them.
    #[instrument(
        skip(self, permit, request),
        fields(experiment = %request.id, user = %request.user_id),
        level = "info"
    )]
    pub fn run_experiment(&self, permit: &ClusterPermit, request: &ExperimentRequest) {
        if let Err(error) = self.try_run(permit, request) {
            error!(error = %error, "Experiment run failed");

            let message = error.to_string();
            if let Err(update_error) =
                self.store
                    .update_status(&request.id, ExperimentStatus::Failed, Some(&message))
            {
                error!(error = %update_error, "Failed to record experiment failure");
            }
        }
    }

    fn try_run(
        &self,
        permit: &ClusterPermit,
        request: &ExperimentRequest,
    ) -> Result<(), OrchestratorError> {
        self.store
            .update_status(&request.id, ExperimentStatus::BeingExecuted, None)?;

        let algorithm = self
            .store
            .algorithm(&request.algorithm_id)?
            .ok_or_else(|| OrchestratorError::UnknownAlgorithm(request.algorithm_id.clone()))?;
        let cluster = self
            .store
            .cluster_parameters(&request.id)?
            .ok_or_else(|| OrchestratorError::VanishedExperiment(request.id.clone()))?;
        let values = self.store.parameter_values(&request.id)?;

        let outcome = self.submitter.submit(
            permit,
            &SubmissionContext {
                request,
                cluster: &cluster,
                algorithm: &algorithm,
                values: &values,
            },
        )?;

        if outcome.is_success() {
            self.process_results(request, &outcome)
        } else {
            // straight to Failed, BeingProcessed is never entered
            let message = match outcome.exit_code {
                Some(code) if outcome.stderr.trim().is_empty() => {
                    format!("Cluster submission exited with code {code}")
                }
                Some(code) => format!(
                    "Cluster submission exited with code {code}: {}",
                    outcome.stderr.trim()
                ),
                None => "Cluster submission was terminated by a signal".to_owned(),
            };

            self.store
                .update_status(&request.id, ExperimentStatus::Failed, Some(&message))?;

            Ok(())
        }
    }

    /// Result post-processing contract. What "processing" concretely does is
    /// still undecided, only the state transitions and the placeholder result
    /// row are implemented.
    fn process_results(
        &self,
        request: &ExperimentRequest,
        outcome: &SubmissionOutcome,
    ) -> Result<(), OrchestratorError> {
        self.store
            .update_status(&request.id, ExperimentStatus::BeingProcessed, None)?;

        // TODO: pull the run output back from HDFS instead of pointing at the
        // local submit-script copy
        self.store.attach_result(&ExperimentResult {
            experiment_id: request.id.clone(),
            csv_file_path: outcome.local_output_path.to_string_lossy().into_owned(),
            csv_file_name: outcome.output_file_name.clone(),
            metadata_file_path: outcome.local_output_path.to_string_lossy().into_owned(),
            created_at: Utc::now(),
        })?;

        self.store
            .update_status(&request.id, ExperimentStatus::Finished, None)?;

        info!(experiment = %request.id, "Experiment finished");

        Ok(())
    }

    pub fn experiment_status(
        &self,
        id: &str,
    ) -> Result<Option<ExperimentStatus>, OrchestratorError> {
        Ok(self.store.status(id)?)
    }

    pub fn experiment_by_id(
        &self,
        id: &str,
    ) -> Result<Option<ExperimentRequest>, OrchestratorError> {
        Ok(self.store.experiment(id)?)
    }

    pub fn experiment_result(
        &self,
        id: &str,
    ) -> Result<Option<ExperimentResult>, OrchestratorError> {
        Ok(self.store.result(id)?)
    }
}
