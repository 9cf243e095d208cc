//! Scratch staging.
//!
//! Prepares the private scratch directory of a job: the directory itself, its
//! `output` subdirectory, the release binary and, when configured, the
//! container image and auxiliary directories the binary needs at runtime.

use std::io;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::ProjectConfig;
use crate::error::{JobstageError, Result};
use crate::job::Job;

/// A job whose scratch directory is ready to run in.
#[derive(Debug, Clone)]
pub struct StagedJob {
    pub scratch_dir: PathBuf,
    /// File name of the binary inside the scratch directory.
    pub binary: String,
    /// File name of the container image inside the scratch directory.
    pub image: Option<PathBuf>,
    pub array_index: Option<u32>,
}

pub struct Stager {
    binary: String,
    container: Option<PathBuf>,
    aux_dirs: Vec<PathBuf>,
}

impl Stager {
    pub fn new(project: &ProjectConfig) -> Self {
        Self {
            binary: project.binary.clone(),
            container: project.container.clone(),
            aux_dirs: project.aux_dirs.clone(),
        }
    }

    /// Where the binary is expected before submission.
    pub fn binary_source(&self, workdir: &Path) -> PathBuf {
        workdir.join("target").join("release").join(&self.binary)
    }

    pub async fn stage(&self, job: &Job) -> Result<StagedJob> {
        let binary_src = self.binary_source(job.workdir());
        // Fail before touching the scratch filesystem.
        let metadata = fs::metadata(&binary_src)
            .await
            .map_err(|e| JobstageError::stage(&binary_src, e))?;
        if !metadata.is_file() {
            return Err(JobstageError::stage(
                &binary_src,
                io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }

        let existed = fs::symlink_metadata(&job.scratch_dir).await.is_ok();
        if existed {
            warn!(
                "{} Scratch directory {} already exists. Another job with the same id may be using it.",
                job,
                job.scratch_dir.display()
            );
        }

        let staged = self.populate(job, &binary_src).await;
        // Only undo what this call created; an existing directory may belong
        // to a running job.
        if staged.is_err() && !existed {
            if let Err(e) = fs::remove_dir_all(&job.scratch_dir).await {
                warn!(
                    "{} Failed to remove {}: {}",
                    job,
                    job.scratch_dir.display(),
                    e
                );
            }
        }
        staged
    }

    async fn populate(&self, job: &Job, binary_src: &Path) -> Result<StagedJob> {
        let scratch_output = job.scratch_output();
        fs::create_dir_all(&scratch_output)
            .await
            .map_err(|e| JobstageError::stage(&scratch_output, e))?;

        let binary_dst = job.scratch_dir.join(&self.binary);
        fs::copy(binary_src, &binary_dst)
            .await
            .map_err(|e| JobstageError::stage(binary_src, e))?;
        debug!("{} Copied {}", job, binary_src.display());

        let image = match &self.container {
            Some(container) => {
                let src = job.workdir().join(container);
                let name = file_name(&src)?;
                fs::copy(&src, job.scratch_dir.join(&name))
                    .await
                    .map_err(|e| JobstageError::stage(&src, e))?;
                debug!("{} Copied container image {}", job, src.display());
                Some(name)
            }
            None => None,
        };

        for dir in &self.aux_dirs {
            let src = job.workdir().join(dir);
            let dst = job.scratch_dir.join(file_name(&src)?);
            copy_dir(&src, &dst)
                .await
                .map_err(|e| JobstageError::stage(&src, e))?;
            debug!("{} Copied {}", job, src.display());
        }

        info!("{} Staged into {}", job, job.scratch_dir.display());
        Ok(StagedJob {
            scratch_dir: job.scratch_dir.clone(),
            binary: self.binary.clone(),
            image,
            array_index: job.array_index(),
        })
    }
}

fn file_name(path: &Path) -> Result<PathBuf> {
    path.file_name().map(PathBuf::from).ok_or_else(|| {
        JobstageError::stage(
            path,
            io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"),
        )
    })
}

/// Recursively copies `src` into `dst`, creating `dst` as needed.
pub(crate) fn copy_dir<'a>(src: &'a Path, dst: &'a Path) -> BoxFuture<'a, io::Result<()>> {
    Box::pin(async move {
        fs::create_dir_all(dst).await?;
        let mut entries = fs::read_dir(src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = dst.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                copy_dir(&entry.path(), &target).await?;
            } else {
                fs::copy(entry.path(), &target).await?;
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobEnv;
    use tempfile::TempDir;

    fn setup(project: &mut ProjectConfig) -> (TempDir, TempDir, Job) {
        let workdir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        project.scratch_root = scratch.path().to_path_buf();
        let env = JobEnv {
            workdir: workdir.path().to_path_buf(),
            job_id: "42.pbs".to_string(),
            array_index: Some(7),
            user: "alice".to_string(),
        };
        let job = Job::new(env, project);
        (workdir, scratch, job)
    }

    fn write_binary(workdir: &Path) {
        let release = workdir.join("target/release");
        std::fs::create_dir_all(&release).unwrap();
        std::fs::write(release.join("ff"), b"#!/bin/sh\n").unwrap();
    }

    #[tokio::test]
    async fn test_stage_binary_only() {
        let mut project = ProjectConfig::new("ff");
        let (workdir, _scratch, job) = setup(&mut project);
        write_binary(workdir.path());

        let staged = Stager::new(&project).stage(&job).await.unwrap();
        assert!(job.scratch_dir.join("ff").is_file());
        assert!(job.scratch_output().is_dir());
        assert_eq!(staged.binary, "ff");
        assert_eq!(staged.image, None);
        assert_eq!(staged.array_index, Some(7));
    }

    #[tokio::test]
    async fn test_stage_image_and_aux_dirs() {
        let mut project = ProjectConfig::new("ff");
        project.container = Some(PathBuf::from("sage.sif"));
        project.aux_dirs = vec![PathBuf::from("pysrc")];
        let (workdir, _scratch, job) = setup(&mut project);
        write_binary(workdir.path());
        std::fs::write(workdir.path().join("sage.sif"), b"image").unwrap();
        let nested = workdir.path().join("pysrc/lib");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(workdir.path().join("pysrc/main.py"), b"print(1)").unwrap();
        std::fs::write(nested.join("util.py"), b"x = 1").unwrap();

        let staged = Stager::new(&project).stage(&job).await.unwrap();
        assert_eq!(staged.image, Some(PathBuf::from("sage.sif")));
        assert!(job.scratch_dir.join("sage.sif").is_file());
        assert!(job.scratch_dir.join("pysrc/main.py").is_file());
        assert_eq!(
            std::fs::read(job.scratch_dir.join("pysrc/lib/util.py")).unwrap(),
            b"x = 1"
        );
    }

    #[tokio::test]
    async fn test_missing_binary_fails_before_scratch_is_created() {
        let mut project = ProjectConfig::new("ff");
        let (_workdir, _scratch, job) = setup(&mut project);

        let err = Stager::new(&project).stage(&job).await.unwrap_err();
        assert!(matches!(err, JobstageError::Stage { .. }));
        assert_eq!(err.exit_code(), 2);
        assert!(!job.scratch_dir.exists());
    }

    #[tokio::test]
    async fn test_missing_image_fails_and_removes_own_scratch() {
        let mut project = ProjectConfig::new("ff");
        project.container = Some(PathBuf::from("missing.sif"));
        let (workdir, _scratch, job) = setup(&mut project);
        write_binary(workdir.path());

        let err = Stager::new(&project).stage(&job).await.unwrap_err();
        match err {
            JobstageError::Stage { path, .. } => assert!(path.ends_with("missing.sif")),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!job.scratch_dir.exists());
    }

    #[tokio::test]
    async fn test_failed_stage_leaves_existing_scratch_alone() {
        // Another member of the array holds the same scratch directory.
        let mut project = ProjectConfig::new("ff");
        project.container = Some(PathBuf::from("missing.sif"));
        let (workdir, _scratch, job) = setup(&mut project);
        write_binary(workdir.path());
        std::fs::create_dir_all(job.scratch_output()).unwrap();
        std::fs::write(job.scratch_output().join("partial.json"), b"{}").unwrap();

        Stager::new(&project).stage(&job).await.unwrap_err();
        assert_eq!(
            std::fs::read(job.scratch_output().join("partial.json")).unwrap(),
            b"{}"
        );
    }

    #[tokio::test]
    async fn test_restaging_existing_scratch_succeeds() {
        let mut project = ProjectConfig::new("ff");
        let (workdir, _scratch, job) = setup(&mut project);
        write_binary(workdir.path());

        let stager = Stager::new(&project);
        stager.stage(&job).await.unwrap();
        stager.stage(&job).await.unwrap();
        assert!(job.scratch_dir.join("ff").is_file());
    }
}
