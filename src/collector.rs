//! Result collection.
//!
//! Moves everything the binary left in the scratch `output` directory into
//! the shared output directory and then deletes the scratch directory.
//!
//! The shared output directory is not locked or namespaced. When two array
//! instances produce files with the same name, whichever collects last wins
//! and the other's file is gone. `CollectReport::replaced` lists such files
//! but nothing fails because of them. Directories that already exist are
//! merged into, so differently named files from other instances survive.

use std::io;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{JobstageError, Result};
use crate::job::Job;
use crate::stager::copy_dir;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CollectReport {
    /// Paths in the output directory that were written.
    pub moved: Vec<PathBuf>,
    /// Files that replaced an existing file of the same name.
    pub replaced: Vec<PathBuf>,
}

#[derive(Debug, Default)]
pub struct Collector;

impl Collector {
    pub fn new() -> Self {
        Self
    }

    /// Moves outputs back and removes the scratch directory.
    ///
    /// The scratch directory is removed even when moving fails; the move error
    /// is returned afterwards. Collecting an already removed scratch directory
    /// is a no-op.
    pub async fn collect(&self, job: &Job) -> Result<CollectReport> {
        if fs::symlink_metadata(&job.scratch_dir).await.is_err() {
            debug!("{} Scratch directory already removed.", job);
            return Ok(CollectReport::default());
        }

        let moved = self.move_outputs(job).await;
        let cleaned = remove_scratch(&job.scratch_dir).await;

        let report = moved?;
        cleaned.map_err(|e| JobstageError::collect(&job.scratch_dir, e))?;
        info!(
            "{} Collected {} entries into {}",
            job,
            report.moved.len(),
            job.output_dir.display()
        );
        Ok(report)
    }

    async fn move_outputs(&self, job: &Job) -> Result<CollectReport> {
        let mut report = CollectReport::default();
        fs::create_dir_all(&job.output_dir)
            .await
            .map_err(|e| JobstageError::collect(&job.output_dir, e))?;

        let scratch_output = job.scratch_output();
        let mut entries = match fs::read_dir(&scratch_output).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("{} No output directory in scratch.", job);
                return Ok(report);
            }
            Err(e) => return Err(JobstageError::collect(&scratch_output, e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| JobstageError::collect(&scratch_output, e))?
        {
            let src = entry.path();
            let dst = job.output_dir.join(entry.file_name());
            let before = report.replaced.len();
            move_entry(&src, &dst, &mut report.replaced)
                .await
                .map_err(|e| JobstageError::collect(&src, e))?;
            for path in &report.replaced[before..] {
                debug!("{} Replaced {}", job, path.display());
            }
            report.moved.push(dst);
        }
        Ok(report)
    }
}

/// Moves `src` to `dst`.
///
/// A directory that already exists at `dst` is merged into and only files
/// with the same name are replaced; their paths are pushed onto `replaced`.
/// A file and a directory meeting under one name is an error.
fn move_entry<'a>(
    src: &'a Path,
    dst: &'a Path,
    replaced: &'a mut Vec<PathBuf>,
) -> BoxFuture<'a, io::Result<()>> {
    Box::pin(async move {
        let src_is_dir = fs::symlink_metadata(src).await?.is_dir();
        match fs::symlink_metadata(dst).await {
            Ok(existing) if existing.is_dir() && src_is_dir => {
                let mut entries = fs::read_dir(src).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let target = dst.join(entry.file_name());
                    move_entry(&entry.path(), &target, replaced).await?;
                }
                return fs::remove_dir(src).await;
            }
            Ok(existing) if existing.is_dir() || src_is_dir => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists as a different kind of entry", dst.display()),
                ));
            }
            Ok(_) => replaced.push(dst.to_path_buf()),
            Err(_) => {}
        }

        if fs::rename(src, dst).await.is_err() {
            // Scratch and output usually live on different filesystems.
            if src_is_dir {
                copy_dir(src, dst).await?;
                fs::remove_dir_all(src).await?;
            } else {
                fs::copy(src, dst).await?;
                fs::remove_file(src).await?;
            }
        }
        Ok(())
    })
}

async fn remove_scratch(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        result => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use crate::job::JobEnv;
    use tempfile::TempDir;

    fn job(workdir: &Path, scratch_root: &Path, job_id: &str) -> Job {
        let mut project = ProjectConfig::new("ff");
        project.scratch_root = scratch_root.to_path_buf();
        let env = JobEnv {
            workdir: workdir.to_path_buf(),
            job_id: job_id.to_string(),
            array_index: Some(1),
            user: "alice".to_string(),
        };
        Job::new(env, &project)
    }

    #[tokio::test]
    async fn test_collect_moves_outputs_and_cleans_up() {
        let workdir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let job = job(workdir.path(), scratch.path(), "1");
        std::fs::create_dir_all(job.scratch_output().join("plots")).unwrap();
        std::fs::write(job.scratch_output().join("sparse_1.json"), b"{}").unwrap();
        std::fs::write(job.scratch_output().join("plots/a.txt"), b"a").unwrap();
        std::fs::write(job.scratch_dir.join("ff"), b"binary").unwrap();

        let report = Collector::new().collect(&job).await.unwrap();
        assert_eq!(report.moved.len(), 2);
        assert!(report.replaced.is_empty());
        assert_eq!(
            std::fs::read(workdir.path().join("output/sparse_1.json")).unwrap(),
            b"{}"
        );
        assert!(workdir.path().join("output/plots/a.txt").is_file());
        assert!(!job.scratch_dir.exists());
    }

    #[tokio::test]
    async fn test_collect_twice_is_a_noop() {
        let workdir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let job = job(workdir.path(), scratch.path(), "2");
        std::fs::create_dir_all(job.scratch_output()).unwrap();

        let collector = Collector::new();
        collector.collect(&job).await.unwrap();
        let second = collector.collect(&job).await.unwrap();
        assert_eq!(second, CollectReport::default());
    }

    #[tokio::test]
    async fn test_collect_without_scratch_output_still_cleans_up() {
        let workdir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let job = job(workdir.path(), scratch.path(), "3");
        std::fs::create_dir_all(&job.scratch_dir).unwrap();

        let report = Collector::new().collect(&job).await.unwrap();
        assert!(report.moved.is_empty());
        assert!(workdir.path().join("output").is_dir());
        assert!(!job.scratch_dir.exists());
    }

    #[tokio::test]
    async fn test_collect_merges_existing_directories() {
        let workdir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let job = job(workdir.path(), scratch.path(), "4");
        let shared = workdir.path().join("output/sparse");
        std::fs::create_dir_all(&shared).unwrap();
        std::fs::write(shared.join("1.json"), b"one").unwrap();
        std::fs::write(shared.join("same.json"), b"old").unwrap();
        std::fs::create_dir_all(job.scratch_output().join("sparse")).unwrap();
        std::fs::write(job.scratch_output().join("sparse/2.json"), b"two").unwrap();
        std::fs::write(job.scratch_output().join("sparse/same.json"), b"new").unwrap();

        let report = Collector::new().collect(&job).await.unwrap();
        assert_eq!(report.moved, vec![shared.clone()]);
        assert_eq!(report.replaced, vec![shared.join("same.json")]);
        assert_eq!(std::fs::read(shared.join("1.json")).unwrap(), b"one");
        assert_eq!(std::fs::read(shared.join("2.json")).unwrap(), b"two");
        assert_eq!(std::fs::read(shared.join("same.json")).unwrap(), b"new");
        assert!(!job.scratch_dir.exists());
    }

    #[tokio::test]
    async fn test_collect_refuses_to_replace_directory_with_file() {
        let workdir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let job = job(workdir.path(), scratch.path(), "5");
        std::fs::create_dir_all(workdir.path().join("output/sparse")).unwrap();
        std::fs::write(workdir.path().join("output/sparse/1.json"), b"one").unwrap();
        std::fs::create_dir_all(job.scratch_output()).unwrap();
        std::fs::write(job.scratch_output().join("sparse"), b"file").unwrap();

        let err = Collector::new().collect(&job).await.unwrap_err();
        assert!(matches!(err, JobstageError::Collect { .. }));
        assert_eq!(
            std::fs::read(workdir.path().join("output/sparse/1.json")).unwrap(),
            b"one"
        );
        assert!(!job.scratch_dir.exists());
    }

    #[tokio::test]
    async fn test_failed_move_still_removes_scratch() {
        let workdir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let job = job(workdir.path(), scratch.path(), "6");
        // The output directory cannot be created over a file.
        std::fs::write(workdir.path().join("output"), b"not a directory").unwrap();
        std::fs::create_dir_all(job.scratch_output()).unwrap();
        std::fs::write(job.scratch_output().join("a.json"), b"{}").unwrap();

        let err = Collector::new().collect(&job).await.unwrap_err();
        match &err {
            JobstageError::Collect { path, .. } => assert_eq!(path, &job.output_dir),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(err.exit_code(), 4);
        assert!(!job.scratch_dir.exists());
    }
}
