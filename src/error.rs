use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, JobstageError>;

#[derive(Error, Debug)]
pub enum JobstageError {
    #[error("Failed to load configuration: {0}")]
    Config(String),
    #[error("Failed to stage {path}: {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to launch '{program}': {source}")]
    Run {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to collect {path}: {source}")]
    Collect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("rsync {direction} exited with {status}")]
    Sync { direction: String, status: String },
    #[error("Failed to render job script: {0}")]
    Template(String),
    #[error("Failed to execute local command: {0}")]
    Io(#[from] std::io::Error),
}

impl JobstageError {
    pub fn stage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Stage {
            path: path.into(),
            source,
        }
    }

    pub fn collect(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Collect {
            path: path.into(),
            source,
        }
    }

    /// Process exit code reported to the scheduler for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Stage { .. } => 2,
            Self::Run { .. } => 3,
            Self::Collect { .. } => 4,
            Self::Sync { .. } => 5,
            Self::Config(_) | Self::Template(_) => 6,
            Self::Io(_) => 1,
        }
    }
}

impl From<serde_yaml::Error> for JobstageError {
    fn from(error: serde_yaml::Error) -> Self {
        Self::Config(error.to_string())
    }
}

impl From<handlebars::RenderError> for JobstageError {
    fn from(error: handlebars::RenderError) -> Self {
        Self::Template(error.to_string())
    }
}

impl From<handlebars::TemplateError> for JobstageError {
    fn from(error: handlebars::TemplateError) -> Self {
        Self::Template(error.to_string())
    }
}
