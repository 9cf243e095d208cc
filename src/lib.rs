//! Jobstage: Scratch Staging and Result Collection for PBS Job Arrays.

// Command line arguments and the project file.
pub mod config;
// Job identity and scheduler environment.
pub mod job;
// Preparing the scratch directory.
pub mod stager;
// Running the staged binary.
pub mod runner;
// Moving results back and cleaning up.
pub mod collector;
// Stage, run and collect in sequence.
pub mod pipeline;
// Pushing to and pulling from the cluster.
pub mod sync;
// PBS submission script.
pub mod script;
// Error handling.
pub mod error;

pub use collector::{CollectReport, Collector};
pub use config::{Config, EnvArgs, Mode, ProjectConfig};
pub use error::{JobstageError, Result};
pub use job::{scratch_name, Job, JobEnv};
pub use pipeline::{JobState, Outcome, Pipeline};
pub use runner::{exit_code, Executor, Invocation, LocalExecutor, Runner};
pub use stager::{StagedJob, Stager};
pub use sync::{default_push_set, PushEntry, RemoteEndpoint, Rsync, SyncClient, Transport};
