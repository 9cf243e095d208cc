//! File synchronization with the cluster.
//!
//! Pushes the project files a job needs to a remote endpoint and pulls the
//! remote output directory back. The transfer itself is rsync's job; this
//! module only decides what gets sent where and with which options.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use itertools::Itertools;
use serde::Deserialize;
use tokio::fs;
use tokio::process::Command;
use tracing::info;

use crate::error::{JobstageError, Result};

/// rsync options shared by push and pull: archive mode, verbose and
/// human-readable output with progress, over an uncompressed ssh tunnel with
/// a cheap AEAD cipher.
pub const RSYNC_OPTIONS: [&str; 4] = [
    "-avh",
    "--progress",
    "-e",
    "ssh -T -c aes128-gcm@openssh.com -o Compression=no -x",
];

/// A project directory on the cluster, or a local directory when `host` is absent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteEndpoint {
    /// SSH host alias.
    #[serde(default)]
    pub host: Option<String>,
    pub path: String,
}

impl RemoteEndpoint {
    pub fn new(host: Option<&str>, path: &str) -> Self {
        Self {
            host: host.map(str::to_string),
            path: path.to_string(),
        }
    }

    /// rsync argument naming `sub` inside this endpoint, as a directory.
    pub fn dir_arg(&self, sub: Option<&Path>) -> String {
        let mut path = self.path.trim_end_matches('/').to_string();
        if let Some(sub) = sub {
            path = format!("{}/{}", path, sub.display());
        }
        match &self.host {
            Some(host) => format!("{}:{}/", host, path),
            None => format!("{}/", path),
        }
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.host {
            Some(host) => write!(f, "{}:{}", host, self.path),
            None => write!(f, "{}", self.path),
        }
    }
}

/// One path of the push set. Either a bare path or a mapping with `path` and
/// `relative`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "PushSpec")]
pub struct PushEntry {
    path: PathBuf,
    /// Keep the full relative path on the remote (`rsync --relative`).
    relative: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PushSpec {
    Bare(PathBuf),
    Full(PushPath),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PushPath {
    path: PathBuf,
    #[serde(default)]
    relative: bool,
}

impl From<PushSpec> for PushEntry {
    fn from(spec: PushSpec) -> Self {
        match spec {
            PushSpec::Bare(path) => Self {
                path,
                relative: false,
            },
            PushSpec::Full(PushPath { path, relative }) => Self { path, relative },
        }
    }
}

impl PushEntry {
    pub fn new(path: &str, relative: bool) -> Self {
        Self {
            path: PathBuf::from(path),
            relative,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_relative(&self) -> bool {
        self.relative
    }
}

/// Run script, dependency manifest and lock file, config file and source tree.
pub fn default_push_set() -> Vec<PushEntry> {
    vec![
        PushEntry::new("run.pbs", false),
        PushEntry::new("Cargo.toml", false),
        PushEntry::new("Cargo.lock", false),
        PushEntry::new("config.toml", false),
        PushEntry::new("src", true),
    ]
}

#[async_trait]
pub trait Transport {
    /// Runs one transfer with `args`, resolving relative sources against `cwd`.
    async fn transfer(&self, args: &[String], cwd: &Path) -> Result<ExitStatus>;
}

/// Transfers with the `rsync` executable, output going straight to the terminal.
pub struct Rsync {
    program: String,
}

impl Rsync {
    pub fn new() -> Self {
        Self {
            program: "rsync".to_string(),
        }
    }
}

impl Default for Rsync {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for Rsync {
    async fn transfer(&self, args: &[String], cwd: &Path) -> Result<ExitStatus> {
        let status = Command::new(&self.program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|source| JobstageError::Run {
                program: self.program.clone(),
                source,
            })?;
        Ok(status)
    }
}

pub struct SyncClient {
    transport: Box<dyn Transport + Send + Sync>,
    /// Local project directory push sources are relative to.
    workdir: PathBuf,
}

impl SyncClient {
    pub fn new(transport: Box<dyn Transport + Send + Sync>, workdir: &Path) -> Self {
        Self {
            transport,
            workdir: workdir.to_path_buf(),
        }
    }

    /// Argument vectors for pushing `entries`. Plain and `relative` entries
    /// need separate rsync calls since `--relative` applies to every source.
    pub fn push_commands(&self, entries: &[PushEntry], remote: &RemoteEndpoint) -> Vec<Vec<String>> {
        let (relative, plain): (Vec<_>, Vec<_>) =
            entries.iter().partition(|entry| entry.is_relative());
        let mut commands = vec![];
        for (group, flag) in [(plain, None), (relative, Some("--relative"))] {
            if group.is_empty() {
                continue;
            }
            let mut args: Vec<String> = RSYNC_OPTIONS.iter().map(|s| s.to_string()).collect();
            args.extend(flag.map(str::to_string));
            args.extend(group.iter().map(|entry| entry.path().display().to_string()));
            args.push(remote.dir_arg(None));
            commands.push(args);
        }
        commands
    }

    pub fn pull_command(&self, remote: &RemoteEndpoint, remote_dir: &Path, local: &Path) -> Vec<String> {
        let mut args: Vec<String> = RSYNC_OPTIONS.iter().map(|s| s.to_string()).collect();
        args.push(remote.dir_arg(Some(remote_dir)));
        args.push(format!("{}/", local.display()));
        args
    }

    pub async fn push(&self, entries: &[PushEntry], remote: &RemoteEndpoint) -> Result<()> {
        info!(
            "Pushing {} to {}",
            entries.iter().map(|entry| entry.path().display()).join(", "),
            remote
        );
        for args in self.push_commands(entries, remote) {
            self.run("push", &args).await?;
        }
        Ok(())
    }

    /// Pulls `<remote>/<remote_dir>/` into `local`, creating `local` first.
    pub async fn pull(&self, remote: &RemoteEndpoint, remote_dir: &Path, local: &Path) -> Result<()> {
        let local = self.workdir.join(local);
        fs::create_dir_all(&local).await?;
        info!(
            "Pulling {} into {}",
            remote.dir_arg(Some(remote_dir)),
            local.display()
        );
        let args = self.pull_command(remote, remote_dir, &local);
        self.run("pull", &args).await
    }

    async fn run(&self, direction: &str, args: &[String]) -> Result<()> {
        let status = self.transport.transfer(args, &self.workdir).await?;
        if !status.success() {
            return Err(JobstageError::Sync {
                direction: direction.to_string(),
                status: status.to_string(),
            });
        }
        Ok(())
    }
}
