//! Configuration for Jobstage.
//!
//! Holds the clap structs for command line arguments and the project file
//! (`jobstage.yaml`) that fixes what gets staged, where results go, and which
//! remote the project is synchronized with.

use std::fs::File;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use crate::error::{JobstageError, Result};
use crate::job::JobEnv;
use crate::script::PbsDirectives;
use crate::sync::{default_push_set, PushEntry, RemoteEndpoint};

#[derive(Parser)]
#[command(version, author, about)]
pub struct Config {
    #[command(subcommand)]
    pub mode: Mode,

    /// Project file to use. Defaults to `jobstage.yaml`
    #[arg(long, short, global = true, default_value = "jobstage.yaml")]
    pub config: PathBuf,

    /// Log debug messages. `RUST_LOG` takes precedence when set.
    #[arg(long, short, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Mode {
    /// Stage, run and collect one job instance (what the PBS script calls)
    Run {
        #[command(flatten)]
        env: EnvArgs,

        /// How often to print output. Giving 0 will suppress stdout/stderr.
        #[arg(long, short, default_value = "1")]
        print_period: usize,
    },
    /// Only prepare the scratch directory
    Stage {
        #[command(flatten)]
        env: EnvArgs,
    },
    /// Only move scratch outputs back and remove the scratch directory
    Collect {
        #[command(flatten)]
        env: EnvArgs,
    },
    /// Send the project files to the remote endpoint
    Push,
    /// Fetch the remote output directory
    Pull {
        /// Local directory to pull into. Defaults to the project's output directory
        #[arg(long)]
        into: Option<PathBuf>,
    },
    /// Render the PBS submission script
    Script {
        /// Write the script here instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

/// Values the scheduler hands to a running job through its environment.
#[derive(Args, Clone, Debug)]
pub struct EnvArgs {
    /// Directory the job was submitted from. Defaults to the current directory
    #[arg(long, env = "PBS_O_WORKDIR")]
    pub workdir: Option<PathBuf>,

    /// Scheduler-assigned job id
    #[arg(long, env = "PBS_JOBID")]
    pub job_id: String,

    /// Index of this instance within the job array. Absent for single runs
    #[arg(long, env = "PBS_ARRAY_INDEX")]
    pub array_index: Option<u32>,

    /// Owner of the scratch directory
    #[arg(long, env = "USER")]
    pub user: String,
}

impl EnvArgs {
    pub fn into_env(self) -> Result<JobEnv> {
        let workdir = match self.workdir {
            Some(workdir) => workdir,
            None => std::env::current_dir()?,
        };
        Ok(JobEnv {
            workdir,
            job_id: self.job_id,
            array_index: self.array_index,
            user: self.user,
        })
    }
}

fn default_container_runtime() -> String {
    "singularity".to_string()
}

fn default_scratch_root() -> PathBuf {
    PathBuf::from("/scratch")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

/// Contents of `jobstage.yaml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Name of the executable under `target/release/`.
    pub binary: String,
    /// Container image to run the binary in.
    #[serde(default)]
    pub container: Option<PathBuf>,
    /// Program that executes the container image.
    #[serde(default = "default_container_runtime")]
    pub container_runtime: String,
    /// Directories the binary needs next to it at runtime.
    #[serde(default)]
    pub aux_dirs: Vec<PathBuf>,
    /// Node-local filesystem where scratch directories are created.
    #[serde(default = "default_scratch_root")]
    pub scratch_root: PathBuf,
    /// Permanent output directory, relative to the working directory.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub remote: Option<RemoteEndpoint>,
    #[serde(default = "default_push_set")]
    pub push: Vec<PushEntry>,
    #[serde(default)]
    pub pbs: PbsDirectives,
}

impl ProjectConfig {
    /// Minimal configuration for a binary with everything else defaulted.
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
            container: None,
            container_runtime: default_container_runtime(),
            aux_dirs: vec![],
            scratch_root: default_scratch_root(),
            output_dir: default_output_dir(),
            remote: None,
            push: default_push_set(),
            pbs: PbsDirectives::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            JobstageError::Config(format!("Failed to open {}: {}", path.display(), e))
        })?;
        let config: Self = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.binary.is_empty() || self.binary.contains('/') {
            return Err(JobstageError::Config(format!(
                "'binary' must be a bare file name, got '{}'",
                self.binary
            )));
        }
        if self.output_dir.is_absolute() {
            return Err(JobstageError::Config(
                "'output_dir' must be relative to the working directory".to_string(),
            ));
        }
        Ok(())
    }

    /// The remote endpoint, or an error naming the missing key.
    pub fn remote(&self) -> Result<&RemoteEndpoint> {
        self.remote
            .as_ref()
            .ok_or_else(|| JobstageError::Config("No 'remote' configured".to_string()))
    }
}
