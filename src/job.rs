//! Job instances.
//!
//! One `Job` is one instance of a (possibly array) PBS submission. Everything
//! it knows about the scheduler comes in through `JobEnv`, so the stager,
//! runner and collector never read the environment themselves.

use std::fmt;
use std::path::{Path, PathBuf};

use colored::*;

use crate::config::ProjectConfig;

/// Scheduler-provided environment of a running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEnv {
    /// Submission directory (`PBS_O_WORKDIR`).
    pub workdir: PathBuf,
    /// Scheduler job id (`PBS_JOBID`).
    pub job_id: String,
    /// Array index (`PBS_ARRAY_INDEX`). `None` in single-run mode.
    pub array_index: Option<u32>,
    /// Submitting user (`USER`).
    pub user: String,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub env: JobEnv,
    /// Private directory on the scratch filesystem.
    pub scratch_dir: PathBuf,
    /// Shared permanent output directory.
    pub output_dir: PathBuf,
}

impl Job {
    pub fn new(env: JobEnv, project: &ProjectConfig) -> Self {
        let scratch_dir = project
            .scratch_root
            .join(scratch_name(&env.user, &env.job_id));
        let output_dir = env.workdir.join(&project.output_dir);
        Self {
            env,
            scratch_dir,
            output_dir,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.env.workdir
    }

    pub fn array_index(&self) -> Option<u32> {
        self.env.array_index
    }

    /// Where the binary writes its results inside the scratch directory.
    pub fn scratch_output(&self) -> PathBuf {
        self.scratch_dir.join("output")
    }

    /// For prefixing streamed output.
    pub fn prettify(&self) -> ColoredString {
        format!("{}", self).cyan()
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.env.array_index {
            Some(index) => write!(f, "[{} #{}]", self.env.job_id, index),
            None => write!(f, "[{}]", self.env.job_id),
        }
    }
}

/// Scratch directory name for a user and job id.
///
/// Keyed on the job id only. PBS Pro gives each subjob its own id
/// (`1234[5].server`), but a scheduler that hands one id to every array
/// member makes those members share this directory.
pub fn scratch_name(user: &str, job_id: &str) -> String {
    let job_id: String = job_id
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    format!("{}_{}", user, job_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(job_id: &str, index: Option<u32>) -> JobEnv {
        JobEnv {
            workdir: PathBuf::from("/home/alice/ff"),
            job_id: job_id.to_string(),
            array_index: index,
            user: "alice".to_string(),
        }
    }

    fn project() -> ProjectConfig {
        let mut project = ProjectConfig::new("free_fermions");
        project.scratch_root = PathBuf::from("/scratch");
        project
    }

    #[test]
    fn test_paths() {
        let job = Job::new(env("1234.pbs", Some(3)), &project());
        assert_eq!(job.scratch_dir, PathBuf::from("/scratch/alice_1234.pbs"));
        assert_eq!(job.scratch_output(), PathBuf::from("/scratch/alice_1234.pbs/output"));
        assert_eq!(job.output_dir, PathBuf::from("/home/alice/ff/output"));
    }

    #[test]
    fn test_distinct_job_ids_give_distinct_scratch() {
        let a = Job::new(env("1234[1].pbs", Some(1)), &project());
        let b = Job::new(env("1234[2].pbs", Some(2)), &project());
        assert_ne!(a.scratch_dir, b.scratch_dir);
    }

    #[test]
    fn test_shared_job_id_shares_scratch() {
        // Uniqueness only holds per job id, not per array index.
        let a = Job::new(env("1234.pbs", Some(1)), &project());
        let b = Job::new(env("1234.pbs", Some(2)), &project());
        assert_eq!(a.scratch_dir, b.scratch_dir);
    }

    #[test]
    fn test_job_id_cannot_escape_scratch_root() {
        assert_eq!(scratch_name("bob", "../../etc"), "bob_.._.._etc");
        let job = Job::new(env("a/b", None), &project());
        assert_eq!(job.scratch_dir.parent(), Some(Path::new("/scratch")));
    }

    #[test]
    fn test_display() {
        assert_eq!(Job::new(env("77", Some(4)), &project()).to_string(), "[77 #4]");
        assert_eq!(Job::new(env("77", None), &project()).to_string(), "[77]");
    }
}
