//! Stage → Run → Collect for one job instance.
//!
//! Each step returns early on error. Once the binary has terminated, the
//! collector always runs, whatever the binary's exit status was, so partial
//! results make it back and no scratch state is left behind.

use std::fmt;
use std::process::ExitStatus;

use tracing::{error, info, warn};

use crate::collector::{CollectReport, Collector};
use crate::config::ProjectConfig;
use crate::error::Result;
use crate::job::Job;
use crate::runner::{exit_code, Executor, Runner};
use crate::stager::Stager;

/// Lifecycle of a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    NotStarted,
    Staged,
    Running,
    Collected,
    CleanedUp,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            JobState::NotStarted => "not started",
            JobState::Staged => "staged",
            JobState::Running => "running",
            JobState::Collected => "collected",
            JobState::CleanedUp => "cleaned up",
        };
        f.write_str(name)
    }
}

/// Result of a job whose binary ran to termination and whose outputs were collected.
#[derive(Debug)]
pub struct Outcome {
    pub status: ExitStatus,
    pub report: CollectReport,
}

impl Outcome {
    /// Exit code to hand back to the scheduler.
    pub fn exit_code(&self) -> u8 {
        exit_code(&self.status)
    }
}

pub struct Pipeline {
    stager: Stager,
    runner: Runner,
    collector: Collector,
    executor: Box<dyn Executor + Send + Sync>,
}

impl Pipeline {
    pub fn new(project: &ProjectConfig, executor: Box<dyn Executor + Send + Sync>) -> Self {
        Self {
            stager: Stager::new(project),
            runner: Runner::new(project),
            collector: Collector::new(),
            executor,
        }
    }

    pub async fn execute(&self, job: &Job) -> Result<Outcome> {
        let mut state = JobState::NotStarted;
        info!("{} {}", job, state);

        let staged = match self.stager.stage(job).await {
            Ok(staged) => staged,
            Err(e) => {
                // The stager has already removed what it created. Nothing ran,
                // so there is nothing to collect.
                error!("{} Staging failed: {}", job, e);
                return Err(e);
            }
        };
        state = JobState::Staged;
        info!("{} {}", job, state);

        state = JobState::Running;
        info!("{} {}", job, state);
        let status = self.runner.run(self.executor.as_ref(), &staged).await;
        if let Ok(status) = &status {
            if !status.success() {
                warn!("{} Binary exited with {}. Collecting anyway.", job, status);
            }
        }

        let report = self.collector.collect(job).await;
        // A launch failure outranks a collection failure.
        let status = status?;
        let report = report?;
        state = JobState::Collected;
        info!("{} {}", job, state);
        state = JobState::CleanedUp;
        info!("{} {}", job, state);

        Ok(Outcome { status, report })
    }
}
