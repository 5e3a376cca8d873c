use super::StoreError;
use crate::model::{
    Algorithm, AlgorithmParameter, ClusterParameters, ExperimentId, ExperimentRequest,
    ExperimentResult, ExperimentStatus, ParameterValue, ParameterValueBinding,
};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::{path::Path, sync::Arc};
use tracing::{debug, error, info};
use tracing_unwrap::ResultExt;

#[derive(Debug, Clone)]
/// Transparent, thread safe wrapper over `InnerStore`
pub struct SharedStore(Arc<FairMutex<InnerStore>>);

#[derive(Debug)]
pub struct InnerStore {
    connection: Connection,
}

impl SharedStore {
    pub fn new(inner: InnerStore) -> Self {
        Self(Arc::new(FairMutex::new(inner)))
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, InnerStore> {
        self.0.lock_arc()
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(InnerStore::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(InnerStore::open_in_memory()?))
    }

    pub fn init(&self) -> Result<(), StoreError> {
        self.lock().init()
    }

    pub fn close(self) -> Result<(), StoreError> {
        Arc::try_unwrap(self.0).unwrap_or_log().into_inner().close()
    }

    pub fn insert_algorithm(
        &self,
        algorithm: &Algorithm,
        parameters: &[(String, u32)],
    ) -> Result<(), StoreError> {
        self.lock().insert_algorithm(algorithm, parameters)
    }

    pub fn algorithm(&self, id: &str) -> Result<Option<Algorithm>, StoreError> {
        self.lock().algorithm(id)
    }

    pub fn algorithm_parameters(
        &self,
        algorithm_id: &str,
    ) -> Result<Vec<AlgorithmParameter>, StoreError> {
        self.lock().algorithm_parameters(algorithm_id)
    }

    pub fn insert_experiment(
        &self,
        request: &ExperimentRequest,
        cluster: &ClusterParameters,
        values: &[ParameterValueBinding],
    ) -> Result<(), StoreError> {
        self.lock().insert_experiment(request, cluster, values)
    }

    pub fn next_queued(&self) -> Result<Option<ExperimentRequest>, StoreError> {
        self.lock().next_queued()
    }

    pub fn queued_ids(&self) -> Result<Vec<ExperimentId>, StoreError> {
        self.lock().queued_ids()
    }

    pub fn update_status(
        &self,
        id: &str,
        status: ExperimentStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        self.lock().update_status(id, status, error_message)
    }

    pub fn experiment(&self, id: &str) -> Result<Option<ExperimentRequest>, StoreError> {
        self.lock().experiment(id)
    }

    pub fn status(&self, id: &str) -> Result<Option<ExperimentStatus>, StoreError> {
        self.lock().status(id)
    }

    pub fn cluster_parameters(&self, id: &str) -> Result<Option<ClusterParameters>, StoreError> {
        self.lock().cluster_parameters(id)
    }

    pub fn parameter_values(&self, id: &str) -> Result<Vec<ParameterValue>, StoreError> {
        self.lock().parameter_values(id)
    }

    pub fn attach_result(&self, result: &ExperimentResult) -> Result<(), StoreError> {
        self.lock().attach_result(result)
    }

    pub fn result(&self, id: &str) -> Result<Option<ExperimentResult>, StoreError> {
        self.lock().result(id)
    }
}

// timestamps are stored as fixed-width RFC 3339 so lexicographic order in SQL
// equals chronological order
fn to_stamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_stamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn parse_optional_stamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.as_deref().map(parse_stamp).transpose()
}

// raw experiment row before timestamp/status decoding
type ExperimentRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    i8,
    String,
    Option<String>,
);

fn read_experiment(row: &Row) -> rusqlite::Result<ExperimentRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn decode_experiment(row: ExperimentRow) -> Result<ExperimentRequest, StoreError> {
    let (
        id,
        user_id,
        algorithm_id,
        dataset_name,
        created_at,
        start_time,
        end_time,
        status,
        parameters_blob,
        error_message,
    ) = row;

    Ok(ExperimentRequest {
        id,
        user_id,
        algorithm_id,
        dataset_name,
        created_at: parse_stamp(&created_at)?,
        start_time: parse_optional_stamp(start_time)?,
        end_time: parse_optional_stamp(end_time)?,
        status: ExperimentStatus::from_repr(status).ok_or(StoreError::CorruptStatus(status))?,
        parameters_blob,
        error_message,
    })
}

const EXPERIMENT_COLUMNS: &str = "id, user_id, algorithm_id, dataset_name, created_at, \
     start_time, end_time, status, parameters, error_message";

impl InnerStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let connection = Connection::open(path)?;
        connection.pragma_update(None, "foreign_keys", &true)?;

        Ok(Self { connection })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let connection = Connection::open_in_memory()?;
        connection.pragma_update(None, "foreign_keys", &true)?;

        Ok(Self { connection })
    }

    pub fn init(&mut self) -> Result<(), StoreError> {
        let mut counter = 1;

        for table in SQL_SCHEMA {
            match self.connection.execute(table, []) {
                Ok(_) => info!("Applied SQL schema ({counter}/{SQL_SCHEMA_NUMBER})"),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({counter}/{SQL_SCHEMA_NUMBER}): {error}");

                    return Err(StoreError::Sqlite(error));
                }
            };

            counter += 1;
        }

        Ok(())
    }

    pub fn close(mut self) -> Result<(), StoreError> {
        let mut counter = 0;
        while let Err((connection, error)) = self.connection.close() {
            counter += 1;
            self.connection = connection;
            error!(error = ?error, "Failed to close SQLite connection: {error}, trying again {counter}/3");

            if counter == 3 {
                return Err(StoreError::Sqlite(error));
            }
        }

        info!("Closed SQLite connection");

        Ok(())
    }

    pub fn insert_algorithm(
        &self,
        algorithm: &Algorithm,
        parameters: &[(String, u32)],
    ) -> Result<(), StoreError> {
        let mut tx = self.connection.unchecked_transaction()?;
        tx.set_drop_behavior(rusqlite::DropBehavior::Rollback);

        tx.prepare_cached(
            "insert into algorithms
             (id, user_id, name, main_class_name, jar_file_name)
             values (?, ?, ?, ?, ?)",
        )?
        .execute(params![
            algorithm.id,
            algorithm.user_id,
            algorithm.name,
            algorithm.main_class_name,
            algorithm.jar_file_name
        ])?;

        for (name, driver_index) in parameters {
            tx.prepare_cached(
                "insert into algorithm_parameters
                 (algorithm_id, name, driver_index)
                 values (?, ?, ?)",
            )?
            .execute(params![algorithm.id, name, driver_index])?;
        }

        tx.commit()?;

        debug!(algorithm = %algorithm.id, name = %algorithm.name, "Registered algorithm");

        Ok(())
    }

    pub fn algorithm(&self, id: &str) -> Result<Option<Algorithm>, StoreError> {
        Ok(self
            .connection
            .prepare_cached(
                "select id, user_id, name, main_class_name, jar_file_name
                 from algorithms where id = ?",
            )?
            .query_row(params![id], |row| {
                Ok(Algorithm {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    name: row.get(2)?,
                    main_class_name: row.get(3)?,
                    jar_file_name: row.get(4)?,
                })
            })
            .optional()?)
    }

    pub fn algorithm_parameters(
        &self,
        algorithm_id: &str,
    ) -> Result<Vec<AlgorithmParameter>, StoreError> {
        self.connection
            .prepare_cached(
                "select id, name, driver_index from algorithm_parameters
                 where algorithm_id = ? order by driver_index asc",
            )?
            .query_map(params![algorithm_id], |row| {
                Ok(AlgorithmParameter {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    driver_index: row.get(2)?,
                })
            })?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<Vec<AlgorithmParameter>, StoreError>(init)
            })
    }

    /// All-or-nothing write of a request with its cluster sizing and value
    /// bindings. Either every row lands or none does.
    pub fn insert_experiment(
        &self,
        request: &ExperimentRequest,
        cluster: &ClusterParameters,
        values: &[ParameterValueBinding],
    ) -> Result<(), StoreError> {
        let mut tx = self.connection.unchecked_transaction()?;
        tx.set_drop_behavior(rusqlite::DropBehavior::Rollback);

        tx.prepare_cached(
            "insert into experiments
             (id, user_id, algorithm_id, dataset_name, created_at,
              start_time, end_time, status, parameters, error_message)
             values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?
        .execute(params![
            request.id,
            request.user_id,
            request.algorithm_id,
            request.dataset_name,
            to_stamp(&request.created_at),
            request.start_time.as_ref().map(to_stamp),
            request.end_time.as_ref().map(to_stamp),
            request.status as i8,
            request.parameters_blob,
            request.error_message
        ])?;

        tx.prepare_cached(
            "insert into cluster_parameters
             (experiment_id, node_count, driver_memory, driver_cores,
              executor_count, executor_cores, executor_memory, memory_overhead)
             values (?, ?, ?, ?, ?, ?, ?, ?)",
        )?
        .execute(params![
            request.id,
            cluster.node_count,
            cluster.driver_memory,
            cluster.driver_cores,
            cluster.executor_count,
            cluster.executor_cores,
            cluster.executor_memory,
            cluster.memory_overhead
        ])?;

        for value in values {
            tx.prepare_cached(
                "insert into parameter_values
                 (experiment_id, parameter_id, value)
                 values (?, ?, ?)",
            )?
            .execute(params![request.id, value.parameter_id, value.value])?;
        }

        tx.commit()?;

        debug!(experiment = %request.id, user = %request.user_id, "Persisted experiment request");

        Ok(())
    }

    /// Oldest request still waiting in queue, the authoritative "what runs
    /// next" answer. The rowid tie break keeps submissions created within the
    /// same microsecond in insertion order.
    pub fn next_queued(&self) -> Result<Option<ExperimentRequest>, StoreError> {
        self.connection
            .prepare_cached(&format!(
                "select {EXPERIMENT_COLUMNS} from experiments
                 where status = ? order by created_at asc, rowid asc limit 1"
            ))?
            .query_row(
                params![ExperimentStatus::WaitingInQueue as i8],
                read_experiment,
            )
            .optional()?
            .map(decode_experiment)
            .transpose()
    }

    pub fn queued_ids(&self) -> Result<Vec<ExperimentId>, StoreError> {
        self.connection
            .prepare_cached(
                "select id from experiments where status = ?
                 order by created_at asc, rowid asc",
            )?
            .query_map(params![ExperimentStatus::WaitingInQueue as i8], |row| {
                row.get(0)
            })?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<Vec<ExperimentId>, StoreError>(init)
            })
    }

    /// Apply one status transition. Start and end times are stamped exactly
    /// once, on entering the executing and terminal states. Transitions
    /// outside the closed table are refused and leave the row untouched.
    pub fn update_status(
        &self,
        id: &str,
        status: ExperimentStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut tx = self.connection.unchecked_transaction()?;
        tx.set_drop_behavior(rusqlite::DropBehavior::Rollback);

        let current: i8 = tx
            .prepare_cached("select status from experiments where id = ?")?
            .query_row(params![id], |row| row.get(0))
            .optional()?
            .ok_or_else(|| StoreError::UnknownExperiment(id.to_owned()))?;
        let current =
            ExperimentStatus::from_repr(current).ok_or(StoreError::CorruptStatus(current))?;

        if !current.may_transition(status) {
            return Err(StoreError::IllegalTransition {
                from: current,
                to: status,
            });
        }

        let now = to_stamp(&Utc::now());
        let stamp_start = status == ExperimentStatus::BeingExecuted;
        let stamp_end = status.is_terminal();

        tx.prepare_cached(
            "update experiments set
               status = ?,
               start_time = case when ? then ? else start_time end,
               end_time = case when ? then ? else end_time end,
               error_message = coalesce(?, error_message)
             where id = ?",
        )?
        .execute(params![
            status as i8,
            stamp_start,
            now,
            stamp_end,
            now,
            error_message,
            id
        ])?;

        tx.commit()?;

        debug!(experiment = %id, from = %current, to = %status, "Applied status transition");

        Ok(())
    }

    pub fn experiment(&self, id: &str) -> Result<Option<ExperimentRequest>, StoreError> {
        self.connection
            .prepare_cached(&format!(
                "select {EXPERIMENT_COLUMNS} from experiments where id = ?"
            ))?
            .query_row(params![id], read_experiment)
            .optional()?
            .map(decode_experiment)
            .transpose()
    }

    pub fn status(&self, id: &str) -> Result<Option<ExperimentStatus>, StoreError> {
        self.connection
            .prepare_cached("select status from experiments where id = ?")?
            .query_row(params![id], |row| row.get::<_, i8>(0))
            .optional()?
            .map(|raw| ExperimentStatus::from_repr(raw).ok_or(StoreError::CorruptStatus(raw)))
            .transpose()
    }

    pub fn cluster_parameters(&self, id: &str) -> Result<Option<ClusterParameters>, StoreError> {
        Ok(self
            .connection
            .prepare_cached(
                "select node_count, driver_memory, driver_cores, executor_count,
                        executor_cores, executor_memory, memory_overhead
                 from cluster_parameters where experiment_id = ?",
            )?
            .query_row(params![id], |row| {
                Ok(ClusterParameters {
                    node_count: row.get(0)?,
                    driver_memory: row.get(1)?,
                    driver_cores: row.get(2)?,
                    executor_count: row.get(3)?,
                    executor_cores: row.get(4)?,
                    executor_memory: row.get(5)?,
                    memory_overhead: row.get(6)?,
                })
            })
            .optional()?)
    }

    /// Submitted values joined with their positional slot, ascending driver
    /// index. This order governs positional-argument construction.
    pub fn parameter_values(&self, id: &str) -> Result<Vec<ParameterValue>, StoreError> {
        self.connection
            .prepare_cached(
                "select p.driver_index, v.value
                 from parameter_values v
                 join algorithm_parameters p on p.id = v.parameter_id
                 where v.experiment_id = ?
                 order by p.driver_index asc",
            )?
            .query_map(params![id], |row| {
                Ok(ParameterValue {
                    driver_index: row.get(0)?,
                    value: row.get(1)?,
                })
            })?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<Vec<ParameterValue>, StoreError>(init)
            })
    }

    /// Result attachment is the one write allowed after a terminal state.
    pub fn attach_result(&self, result: &ExperimentResult) -> Result<(), StoreError> {
        self.connection
            .prepare_cached(
                "insert into experiment_results
                 (experiment_id, csv_file_path, csv_file_name, metadata_file_path, created_at)
                 values (?, ?, ?, ?, ?)",
            )?
            .execute(params![
                result.experiment_id,
                result.csv_file_path,
                result.csv_file_name,
                result.metadata_file_path,
                to_stamp(&result.created_at)
            ])?;

        Ok(())
    }

    pub fn result(&self, id: &str) -> Result<Option<ExperimentResult>, StoreError> {
        self.connection
            .prepare_cached(
                "select experiment_id, csv_file_path, csv_file_name, metadata_file_path, created_at
                 from experiment_results where experiment_id = ?",
            )?
            .query_row(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .optional()?
            .map(
                |(experiment_id, csv_file_path, csv_file_name, metadata_file_path, created_at)| {
                    Ok(ExperimentResult {
                        experiment_id,
                        csv_file_path,
                        csv_file_name,
                        metadata_file_path,
                        created_at: parse_stamp(&created_at)?,
                    })
                },
            )
            .transpose()
    }
}

// TODO: Document below, maybe add some kind of migration utility
pub const SQL_SCHEMA: [&str; 6] = [
    "create table if not exists algorithms (
    id text primary key,
    user_id text,
    name text not null,
    main_class_name text not null,
    jar_file_name text not null
);",
    "create table if not exists algorithm_parameters (
    id integer primary key,
    algorithm_id text not null references algorithms (id),
    name text not null,
    driver_index integer not null check (driver_index >= 0)
);",
    "create table if not exists experiments (
    id text primary key,
    user_id text not null,
    algorithm_id text not null references algorithms (id),
    dataset_name text not null,
    created_at text not null,
    start_time text,
    end_time text,
    status tinyint not null,
    parameters text not null,
    error_message text
);",
    "create table if not exists cluster_parameters (
    experiment_id text primary key references experiments (id),
    node_count uinteger not null,
    driver_memory text not null,
    driver_cores uinteger not null,
    executor_count uinteger not null,
    executor_cores uinteger not null,
    executor_memory text not null,
    memory_overhead uinteger not null
);",
    "create table if not exists parameter_values (
    id integer primary key,
    experiment_id text not null references experiments (id),
    parameter_id integer not null references algorithm_parameters (id),
    value text not null
);",
    "create table if not exists experiment_results (
    experiment_id text primary key references experiments (id),
    csv_file_path text not null,
    csv_file_name text not null,
    metadata_file_path text not null,
    created_at text not null
);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();
