pub mod sqlite;

use crate::model::ExperimentStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database query failed")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Stored timestamp is not valid RFC 3339")]
    CorruptTimestamp(#[from] chrono::ParseError),
    #[error("Stored status {0} is outside the closed status set")]
    CorruptStatus(i8),
    #[error("Illegal status transition {from} -> {to}")]
    IllegalTransition {
        from: ExperimentStatus,
        to: ExperimentStatus,
    },
    #[error("Experiment {0} does not exist")]
    UnknownExperiment(String),
}
