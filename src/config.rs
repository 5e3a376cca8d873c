use serde::{Deserialize, Serialize};
use std::{
    fs::File, io::Error, os::unix::fs::MetadataExt, path::Path, path::PathBuf, str::FromStr,
    time::Duration,
};
use thiserror::Error;
use tracing::error;

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigError> {
    if !path.is_file() {
        Err(ConfigError::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigError::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file")]
    UnreadableConfig(#[from] Error),
    #[error("Config file is not valid YAML")]
    InvalidConfig(#[from] serde_yaml::Error),
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[source] Error),
    #[error("Preflight checks failed")]
    PreflightFailed,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // everything the cluster submission adapter needs to know about the swarm checkout
    pub swarm: SwarmConfig,

    #[serde(alias = "db")]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SwarmConfig {
    /// root of the docker-swarm checkout, every relative path below resolves against it
    pub root: PathBuf,

    #[serde(default = "default_submit_script")]
    pub submit_script: PathBuf,

    /// the shared build descriptor rewritten before every submission
    #[serde(default = "default_build_descriptor")]
    pub build_descriptor: PathBuf,

    /// base directory holding one jar directory per user
    #[serde(default = "default_jar_base")]
    pub jar_base: PathBuf,

    /// base directory holding one dataset directory per user
    #[serde(default = "default_data_base")]
    pub data_base: PathBuf,

    /// base directory for per-experiment local output
    #[serde(default = "default_results_base")]
    pub results_base: PathBuf,

    #[serde(default = "default_hdfs_base")]
    pub hdfs_base: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// seconds the worker loop sleeps between store polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;

        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if !self.swarm.root.is_dir() {
            error!(
                "swarm.root ({}) is not a directory",
                self.swarm.root.to_string_lossy()
            );
            contains_error = true;
        }

        let script = self.swarm.submit_script_path();
        match check_executable(&script) {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    "swarm.submit_script ({}) is not executable",
                    script.to_string_lossy()
                );
                contains_error = true;
            }
            Err(e) => {
                error!(
                    "Failed to find swarm.submit_script at {}: {e}",
                    script.to_string_lossy()
                );
                contains_error = true;
            }
        }

        if !self.swarm.build_descriptor_path().is_file() {
            error!(
                "swarm.build_descriptor ({}) was not found",
                self.swarm.build_descriptor_path().to_string_lossy()
            );
            contains_error = true;
        }

        if !self.swarm.jar_base_path().is_dir() {
            error!(
                "swarm.jar_base ({}) is not a directory",
                self.swarm.jar_base_path().to_string_lossy()
            );
            contains_error = true;
        }

        if self.swarm.hdfs_base.is_empty() {
            error!("swarm.hdfs_base cannot be empty, the submit script needs a remote output root");
            contains_error = true;
        }

        if self.worker.poll_interval == 0 {
            error!("worker.poll_interval cannot be 0. This would busy-spin the worker loop.");
            contains_error = true;
        }

        contains_error
    }
}

impl SwarmConfig {
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn submit_script_path(&self) -> PathBuf {
        self.resolve(&self.submit_script)
    }

    pub fn build_descriptor_path(&self) -> PathBuf {
        self.resolve(&self.build_descriptor)
    }

    pub fn jar_base_path(&self) -> PathBuf {
        self.resolve(&self.jar_base)
    }

    pub fn data_base_path(&self) -> PathBuf {
        self.resolve(&self.data_base)
    }

    pub fn results_base_path(&self) -> PathBuf {
        self.resolve(&self.results_base)
    }
}

fn default_submit_script() -> PathBuf {
    PathBuf::from_str("scripts/submit-experiment.sh").unwrap()
}

fn default_build_descriptor() -> PathBuf {
    PathBuf::from_str("docker-images/spark-hadoop/Dockerfile").unwrap()
}

fn default_jar_base() -> PathBuf {
    PathBuf::from_str("jars").unwrap()
}

fn default_data_base() -> PathBuf {
    PathBuf::from_str("data").unwrap()
}

fn default_results_base() -> PathBuf {
    PathBuf::from_str("results").unwrap()
}

fn default_hdfs_base() -> String {
    "hdfs://master:8020".to_owned()
}

fn default_database_path() -> PathBuf {
    PathBuf::from_str("swarmlab.db").unwrap()
}

fn default_poll_interval() -> u64 {
    5
}
