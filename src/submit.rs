pub mod descriptor;

use crate::{
    config::SwarmConfig,
    model::{Algorithm, ClusterParameters, ExperimentRequest, ParameterValue},
};
use chrono::Local;
use itertools::Itertools;
use parking_lot::{FairMutex, FairMutexGuard};
use std::{
    fs,
    io::Read,
    path::PathBuf,
    process::{Command, Stdio},
    thread,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Submit script not found at {0}")]
    MissingScript(PathBuf),
    #[error("Algorithm artifact not found at {0}")]
    MissingJar(PathBuf),
    #[error("Build descriptor not found at {0}")]
    MissingDescriptor(PathBuf),
    #[error("Failed to rewrite the build descriptor")]
    DescriptorIo(#[source] std::io::Error),
    #[error("Failed to run the submit script")]
    ProcessIo(#[from] std::io::Error),
}

/// Single-slot gate serializing access to the cluster and the shared build
/// descriptor. The adapter demands a permit by reference, so a submission
/// without holding the gate does not compile and a second worker instance
/// blocks instead of corrupting the descriptor.
#[derive(Debug, Default)]
pub struct ClusterGate(FairMutex<()>);

pub struct ClusterPermit<'a>(#[allow(dead_code)] FairMutexGuard<'a, ()>);

impl ClusterGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> ClusterPermit<'_> {
        ClusterPermit(self.0.lock())
    }

    pub fn try_acquire(&self) -> Option<ClusterPermit<'_>> {
        self.0.try_lock().map(ClusterPermit)
    }
}

/// Everything one submission needs, loaded from the store by the orchestrator.
#[derive(Debug)]
pub struct SubmissionContext<'a> {
    pub request: &'a ExperimentRequest,
    pub cluster: &'a ClusterParameters,
    pub algorithm: &'a Algorithm,
    pub values: &'a [ParameterValue],
}

#[derive(Debug, Clone)]
pub struct SubmissionOutcome {
    /// `None` if the script was terminated by a signal before exiting
    pub exit_code: Option<i32>,
    pub stderr: String,
    pub local_output_path: PathBuf,
    pub output_file_name: String,
}

impl SubmissionOutcome {
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone)]
/// Turns one validated request into a single submit-script invocation.
pub struct Submitter {
    config: SwarmConfig,
}

impl Submitter {
    pub fn new(config: SwarmConfig) -> Self {
        Self { config }
    }

    /// Run the external submission to completion. Blocks the caller for the
    /// whole cluster job, which is the intended backpressure: the permit is
    /// held for as long as the shared descriptor and the cluster are in use.
    #[instrument(
        skip(self, _permit, ctx),
        fields(experiment = %ctx.request.id, user = %ctx.request.user_id),
        level = "info"
    )]
    pub fn submit(
        &self,
        _permit: &ClusterPermit,
        ctx: &SubmissionContext,
    ) -> Result<SubmissionOutcome, SubmitError> {
        let script = self.config.submit_script_path();
        let descriptor = self.config.build_descriptor_path();
        let jar = self
            .config
            .jar_base_path()
            .join(&ctx.request.user_id)
            .join(&ctx.algorithm.jar_file_name);

        // fail fast before the descriptor is touched or anything is spawned
        if !script.is_file() {
            return Err(SubmitError::MissingScript(script));
        }
        if !jar.is_file() {
            return Err(SubmitError::MissingJar(jar));
        }
        if !descriptor.is_file() {
            return Err(SubmitError::MissingDescriptor(descriptor));
        }

        if !descriptor::retarget_jar_directory(&descriptor, &ctx.request.user_id)? {
            warn!(
                descriptor = %descriptor.to_string_lossy(),
                "Build descriptor contains no jar copy line, submission will use stale artifacts"
            );
        }

        let (args, outcome_paths) = self.submission_args(ctx);
        fs::create_dir_all(&outcome_paths.0)?;

        debug!(args = ?args, "Invoking submit script");

        // stdout is not consumed, leaving it piped would fill the pipe buffer
        // and block a chatty script before it could exit
        let mut child = Command::new(&script)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        // stderr has to be drained while the job runs, for the same reason
        let stderr_drain = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut captured = String::new();
                let _ = pipe.read_to_string(&mut captured);

                captured
            })
        });

        let status = child.wait()?;

        let stderr = stderr_drain
            .and_then(|drain| drain.join().ok())
            .unwrap_or_default();

        info!(
            exit_code = ?status.code(),
            success = status.success(),
            "Submit script finished"
        );

        Ok(SubmissionOutcome {
            exit_code: status.code(),
            stderr,
            local_output_path: outcome_paths.0,
            output_file_name: outcome_paths.1,
        })
    }

    /// Positional argument list in the exact order the submit script parses.
    /// The invoked side is positional, so this order is part of the wire
    /// contract and must not change.
    pub fn submission_args(&self, ctx: &SubmissionContext) -> (Vec<String>, (PathBuf, String)) {
        let request = ctx.request;
        let cluster = ctx.cluster;

        let stamp = Local::now().format("%Y-%-m-%-d_%-H-%-M-%-S");
        let output_file_name = format!("{}_{stamp}.txt", request.id);
        let local_output_path = self
            .config
            .results_base_path()
            .join(&request.user_id)
            .join(&request.id);
        let data_path = self.config.data_base_path().join(&request.user_id);

        let mut args = vec![
            request.user_id.clone(),
            data_path.to_string_lossy().into_owned(),
            request.dataset_name.clone(),
            cluster.node_count.to_string(),
            cluster.driver_memory.clone(),
            cluster.driver_cores.to_string(),
            cluster.executor_count.to_string(),
            cluster.executor_cores.to_string(),
            cluster.executor_memory.clone(),
            cluster.memory_overhead.to_string(),
            ctx.algorithm.main_class_name.clone(),
            ctx.algorithm.jar_file_name.clone(),
            self.config.hdfs_base.clone(),
            local_output_path.to_string_lossy().into_owned(),
            output_file_name.clone(),
        ];

        // the store already orders by driver index, sorting again here keeps
        // the wire contract independent of where the values came from
        args.extend(
            ctx.values
                .iter()
                .sorted_by_key(|value| value.driver_index)
                .map(|value| value.value.clone()),
        );

        (args, (local_output_path, output_file_name))
    }
}

#[cfg(test)]
mod submit_test {
    use super::*;
    use crate::model::ExperimentStatus;
    use chrono::Utc;
    use std::{os::unix::fs::PermissionsExt, path::Path, str::FromStr};

    fn test_config(root: &Path) -> SwarmConfig {
        serde_yaml::from_str(&format!("root: {}", root.to_string_lossy())).unwrap()
    }

    fn test_request() -> ExperimentRequest {
        ExperimentRequest {
            id: "exp-1".to_owned(),
            user_id: "alice".to_owned(),
            algorithm_id: "alg-1".to_owned(),
            dataset_name: "pulsars.csv".to_owned(),
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            status: ExperimentStatus::WaitingInQueue,
            parameters_blob: "{}".to_owned(),
            error_message: None,
        }
    }

    fn test_cluster() -> ClusterParameters {
        ClusterParameters {
            node_count: 4,
            driver_memory: "2g".to_owned(),
            driver_cores: 2,
            executor_count: 3,
            executor_cores: 8,
            executor_memory: "4g".to_owned(),
            memory_overhead: 512,
        }
    }

    fn test_algorithm() -> Algorithm {
        Algorithm {
            id: "alg-1".to_owned(),
            user_id: None,
            name: "random-forest".to_owned(),
            main_class_name: "org.example.RandomForest".to_owned(),
            jar_file_name: "forest.jar".to_owned(),
        }
    }

    #[test]
    fn argument_order_matches_wire_contract() {
        let root = PathBuf::from_str("/srv/swarm").unwrap();
        let submitter = Submitter::new(test_config(&root));
        let request = test_request();
        let cluster = test_cluster();
        let algorithm = test_algorithm();

        let (args, (output_path, output_name)) = submitter.submission_args(&SubmissionContext {
            request: &request,
            cluster: &cluster,
            algorithm: &algorithm,
            values: &[],
        });

        assert_eq!(
            args[..13],
            [
                "alice",
                "/srv/swarm/data/alice",
                "pulsars.csv",
                "4",
                "2g",
                "2",
                "3",
                "8",
                "4g",
                "512",
                "org.example.RandomForest",
                "forest.jar",
                "hdfs://master:8020",
            ]
        );
        assert_eq!(args[13], output_path.to_string_lossy());
        assert_eq!(args[14], output_name);
        assert_eq!(args.len(), 15);
        assert!(output_name.starts_with("exp-1_"));
        assert!(output_name.ends_with(".txt"));
        assert_eq!(output_path, root.join("results/alice/exp-1"));
    }

    #[test]
    fn values_are_ordered_by_driver_index() {
        let submitter = Submitter::new(test_config(Path::new("/srv/swarm")));
        let request = test_request();
        let cluster = test_cluster();
        let algorithm = test_algorithm();

        // submitted out of order on purpose
        let values = [
            ParameterValue {
                driver_index: 2,
                value: "third".to_owned(),
            },
            ParameterValue {
                driver_index: 0,
                value: "first".to_owned(),
            },
            ParameterValue {
                driver_index: 1,
                value: "second".to_owned(),
            },
        ];

        let (args, _) = submitter.submission_args(&SubmissionContext {
            request: &request,
            cluster: &cluster,
            algorithm: &algorithm,
            values: &values,
        });

        assert_eq!(args[15..], ["first", "second", "third"]);
    }

    #[test]
    fn gate_is_mutually_exclusive() {
        let gate = ClusterGate::new();

        let permit = gate.acquire();
        assert!(gate.try_acquire().is_none());

        drop(permit);
        assert!(gate.try_acquire().is_some());
    }

    #[test]
    fn chatty_script_output_does_not_block_submission() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        // floods both streams well past the OS pipe buffer before exiting
        let script = root.join("scripts/submit-experiment.sh");
        fs::create_dir_all(script.parent().unwrap()).unwrap();
        fs::write(
            &script,
            "#!/bin/sh\n\
             i=0\n\
             while [ $i -lt 4096 ]; do\n\
             echo 'stdout line padding the pipe buffer well past its capacity'\n\
             echo 'stderr line padding the pipe buffer well past its capacity' >&2\n\
             i=$((i+1))\n\
             done\n\
             echo 'drained to the end' >&2\n\
             exit 0\n",
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let descriptor = root.join("docker-images/spark-hadoop/Dockerfile");
        fs::create_dir_all(descriptor.parent().unwrap()).unwrap();
        fs::write(&descriptor, "COPY ./jars/* /opt/jars\n").unwrap();

        let jar_dir = root.join("jars/alice");
        fs::create_dir_all(&jar_dir).unwrap();
        fs::write(jar_dir.join("forest.jar"), b"jar").unwrap();

        let submitter = Submitter::new(test_config(root));
        let gate = ClusterGate::new();
        let permit = gate.acquire();
        let request = test_request();
        let cluster = test_cluster();
        let algorithm = test_algorithm();

        let outcome = submitter
            .submit(
                &permit,
                &SubmissionContext {
                    request: &request,
                    cluster: &cluster,
                    algorithm: &algorithm,
                    values: &[],
                },
            )
            .unwrap();

        assert!(outcome.is_success());
        // stderr was captured to its end, not truncated at the pipe buffer
        assert!(outcome.stderr.contains("drained to the end"));
    }

    #[test]
    fn missing_script_fails_before_descriptor_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let submitter = Submitter::new(test_config(dir.path()));
        let gate = ClusterGate::new();

        let descriptor = dir.path().join("docker-images/spark-hadoop/Dockerfile");
        fs::create_dir_all(descriptor.parent().unwrap()).unwrap();
        fs::write(&descriptor, "COPY ./jars/* /opt/jars\n").unwrap();

        let request = test_request();
        let cluster = test_cluster();
        let algorithm = test_algorithm();
        let permit = gate.acquire();

        let error = submitter
            .submit(
                &permit,
                &SubmissionContext {
                    request: &request,
                    cluster: &cluster,
                    algorithm: &algorithm,
                    values: &[],
                },
            )
            .unwrap_err();

        assert!(matches!(error, SubmitError::MissingScript(_)));
        // no partial mutation: the descriptor still references the shared directory
        assert_eq!(
            fs::read_to_string(&descriptor).unwrap(),
            "COPY ./jars/* /opt/jars\n"
        );
    }
}
