use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_repr::*;
use std::fmt;

/// Opaque identifier of one experiment request, generated at submission time.
pub type ExperimentId = String;

/// Opaque identifier of a registered algorithm.
pub type AlgorithmId = String;

#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Debug, Clone, Copy)]
#[repr(i8)]
pub enum ExperimentStatus {
    WaitingInQueue = 0,
    BeingExecuted = 1,
    BeingProcessed = 2,
    Finished = 3,
    Failed = 4,
}

impl ExperimentStatus {
    /// Closed transition table. Everything not listed here is rejected by the
    /// store, terminal states have no successors.
    pub fn may_transition(self, next: ExperimentStatus) -> bool {
        use ExperimentStatus::*;

        matches!(
            (self, next),
            (WaitingInQueue, BeingExecuted)
                | (BeingExecuted, BeingProcessed)
                | (BeingExecuted, Failed)
                | (BeingProcessed, Finished)
                | (BeingProcessed, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    pub fn from_repr(value: i8) -> Option<Self> {
        match value {
            0 => Some(Self::WaitingInQueue),
            1 => Some(Self::BeingExecuted),
            2 => Some(Self::BeingProcessed),
            3 => Some(Self::Finished),
            4 => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::WaitingInQueue => "waiting-in-queue",
            Self::BeingExecuted => "being-executed",
            Self::BeingProcessed => "being-processed",
            Self::Finished => "finished",
            Self::Failed => "failed",
        };

        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// One request to run an algorithm against a dataset, the unit of work of the
/// whole pipeline. Mutated only through the store, never deleted here.
pub struct ExperimentRequest {
    pub id: ExperimentId,
    pub user_id: String,
    pub algorithm_id: AlgorithmId,
    pub dataset_name: String,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: ExperimentStatus,
    /// raw submitted parameters, retained verbatim for audit
    pub parameters_blob: String,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Cluster sizing for one experiment. Written once together with the request.
pub struct ClusterParameters {
    pub node_count: u32,
    pub driver_memory: String,
    pub driver_cores: u32,
    pub executor_count: u32,
    pub executor_cores: u32,
    pub executor_memory: String,
    pub memory_overhead: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// A submitted value bound to one declared algorithm parameter.
pub struct ParameterValueBinding {
    pub parameter_id: i64,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// A parameter value joined with the positional slot it occupies on the
/// submit script's command line.
pub struct ParameterValue {
    pub driver_index: u32,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Algorithm {
    pub id: AlgorithmId,
    /// None if provided by an administrator rather than uploaded by a user
    pub user_id: Option<String>,
    pub name: String,
    pub main_class_name: String,
    pub jar_file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmParameter {
    pub id: i64,
    pub name: String,
    pub driver_index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Registration payload for an algorithm. Driver indices are validated here,
/// at registration time, not on every submission.
pub struct NewAlgorithm {
    pub user_id: Option<String>,
    pub name: String,
    pub main_class_name: String,
    pub jar_file_name: String,
    pub parameters: Vec<NewAlgorithmParameter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAlgorithmParameter {
    pub name: String,
    pub driver_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Inbound submission payload as handed to the orchestrator.
pub struct SubmissionRequest {
    pub algorithm_id: AlgorithmId,
    pub dataset_name: String,
    /// JSON serialized parameters exactly as submitted
    pub parameters_blob: String,
    pub cluster: ClusterParameters,
    pub parameter_values: Vec<ParameterValueBinding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Placeholder result record written by the stubbed processing step.
pub struct ExperimentResult {
    pub experiment_id: ExperimentId,
    pub csv_file_path: String,
    pub csv_file_name: String,
    pub metadata_file_path: String,
    pub created_at: DateTime<Utc>,
}
