//! Running the staged binary.
//!
//! The binary gets the array index as its only argument (nothing in
//! single-run mode) and runs inside the scratch directory, either directly or
//! through a container runtime when an image was staged.

use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use colored::ColoredString;
use futures::future::join;
use itertools::Itertools;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::ProjectConfig;
use crate::error::{JobstageError, Result};
use crate::stager::StagedJob;

/// A fully resolved process launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.program)
        } else {
            write!(f, "{} {}", self.program, self.args.iter().join(" "))
        }
    }
}

#[async_trait]
pub trait Executor {
    /// Runs the invocation to completion and returns how it exited.
    async fn execute(&self, invocation: &Invocation) -> Result<ExitStatus>;
}

pub struct Runner {
    container_runtime: String,
}

impl Runner {
    pub fn new(project: &ProjectConfig) -> Self {
        Self {
            container_runtime: project.container_runtime.clone(),
        }
    }

    pub fn invocation(&self, staged: &StagedJob) -> Invocation {
        let index = staged.array_index.map(|index| index.to_string());
        match &staged.image {
            Some(image) => {
                let mut args = vec![
                    "exec".to_string(),
                    image.display().to_string(),
                    format!("./{}", staged.binary),
                ];
                args.extend(index);
                Invocation {
                    program: self.container_runtime.clone(),
                    args,
                    cwd: staged.scratch_dir.clone(),
                }
            }
            None => Invocation {
                program: staged
                    .scratch_dir
                    .join(&staged.binary)
                    .display()
                    .to_string(),
                args: index.into_iter().collect(),
                cwd: staged.scratch_dir.clone(),
            },
        }
    }

    pub async fn run(
        &self,
        executor: &(dyn Executor + Send + Sync),
        staged: &StagedJob,
    ) -> Result<ExitStatus> {
        let invocation = self.invocation(staged);
        info!("=== run '{}' ===", invocation);
        let status = executor.execute(&invocation).await?;
        info!("=== done ({}) ===", status);
        Ok(status)
    }
}

/// The exit code a shell would report for `status`.
pub fn exit_code(status: &ExitStatus) -> u8 {
    if let Some(code) = status.code() {
        return (code & 0xff) as u8;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return (128 + signal).min(255) as u8;
        }
    }
    1
}

/// Runs invocations as child processes on this node, streaming their output.
pub struct LocalExecutor {
    prefix: ColoredString,
    print_period: usize,
}

impl LocalExecutor {
    pub fn new(prefix: ColoredString, print_period: usize) -> Self {
        Self {
            prefix,
            print_period,
        }
    }

    async fn stream<B: AsyncRead + Unpin>(&self, stream: Option<B>) {
        let stream = match stream {
            Some(stream) => stream,
            None => return,
        };
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::with_capacity(reader.buffer().len());
        loop {
            // Read into the buffer until either \r or \n is met.
            // Skip the first `print_period-1` occurances.
            if let Err(e) =
                read_until2(&mut reader, b'\r', b'\n', &mut buf, self.print_period).await
            {
                warn!("{} Failed to read job output: {}", self.prefix, e);
                break;
            }
            // An empty buffer means that EOF was reached.
            if buf.is_empty() {
                break;
            }
            {
                let line = String::from_utf8_lossy(&buf);
                // Hold the lock so that stdout and stderr lines don't interleave.
                let stdout = std::io::stdout();
                let mut guard = stdout.lock();
                let _ = writeln!(
                    guard,
                    "{} {}",
                    self.prefix,
                    line.trim_end_matches(&['\r', '\n'][..])
                );
            }
            buf.clear();
        }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn execute(&self, invocation: &Invocation) -> Result<ExitStatus> {
        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args).current_dir(&invocation.cwd);
        if self.print_period == 0 {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        } else {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        let mut child = command.spawn().map_err(|source| JobstageError::Run {
            program: invocation.program.clone(),
            source,
        })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let status = tokio::select! {
            status = async {
                join(self.stream(stdout), self.stream(stderr)).await;
                child.wait().await
            } => status?,
            _ = shutdown_signal() => {
                warn!("{} Termination requested. Killing the job.", self.prefix);
                child.kill().await?;
                child.wait().await?
            }
        };
        Ok(status)
    }
}

/// Resolves on Ctrl-C, or on SIGTERM which PBS sends when walltime runs out.
/// Never resolves if no handler could be installed.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    Ok(()) = tokio::signal::ctrl_c() => {}
                    Some(()) = term.recv() => {}
                    else => std::future::pending::<()>().await,
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn read_until2<B: AsyncRead + Unpin>(
    reader: &mut BufReader<B>,
    delimiter1: u8,
    delimiter2: u8,
    buf: &mut Vec<u8>,
    mut skip: usize,
) -> std::io::Result<()> {
    loop {
        let (done, used) = {
            let available = reader.fill_buf().await?;
            if let Some(i) = memchr::memchr2(delimiter1, delimiter2, available) {
                if skip <= 1 {
                    buf.extend_from_slice(&available[..=i]);
                    (true, i + 1)
                } else {
                    skip -= 1;
                    buf.clear();
                    (false, i + 1)
                }
            } else {
                buf.extend_from_slice(available);
                (false, available.len())
            }
        };
        reader.consume(used);
        if done || used == 0 {
            return Ok(());
        }
    }
}
