//! PBS submission script.
//!
//! Renders the directive block the scheduler reads before the job starts,
//! followed by the body that hands control to `jobstage run`. The directive
//! values are passed through untouched; PBS is the one validating them.

use std::path::{Path, PathBuf};

use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::config::ProjectConfig;
use crate::error::{JobstageError, Result};

const TEMPLATE_NAME: &str = "pbs";

const DEFAULT_TEMPLATE: &str = r#"#!/bin/bash
#PBS -N {{pbs.name}}
{{#if pbs.array}}#PBS -J {{pbs.array}}
{{/if}}#PBS -l walltime={{pbs.walltime}}
#PBS -l select={{pbs.select}}
#PBS -o {{pbs.log_dir}}/
#PBS -e {{pbs.log_dir}}/
{{#if pbs.mail_events}}#PBS -m {{pbs.mail_events}}
{{/if}}{{#if pbs.mail_to}}#PBS -M {{pbs.mail_to}}
{{/if}}{{#each pbs.extra}}#PBS {{this}}
{{/each}}
cd "$PBS_O_WORKDIR"
exec jobstage --config {{config_arg}} run
"#;

/// Scheduler directives from the `pbs` section of the project file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PbsDirectives {
    /// Job name (`-N`).
    pub name: String,
    /// Array range such as `1-20` (`-J`). Absent for a single run.
    pub array: Option<String>,
    /// Wall-clock limit (`-l walltime`).
    pub walltime: String,
    /// Resource selection (`-l select`).
    pub select: String,
    /// Where PBS writes the job's stdout and stderr.
    pub log_dir: PathBuf,
    /// Mail events (`-m`), e.g. `abe`.
    pub mail_events: Option<String>,
    /// Mail recipient (`-M`).
    pub mail_to: Option<String>,
    /// Additional raw directives, without the `#PBS` prefix.
    pub extra: Vec<String>,
    /// Handlebars template to use instead of the built-in one.
    pub template: Option<PathBuf>,
}

impl Default for PbsDirectives {
    fn default() -> Self {
        Self {
            name: "jobstage".to_string(),
            array: None,
            walltime: "24:00:00".to_string(),
            select: "1:ncpus=1:mem=4gb".to_string(),
            log_dir: PathBuf::from("log"),
            mail_events: None,
            mail_to: None,
            extra: vec![],
            template: None,
        }
    }
}

#[derive(Serialize)]
struct ScriptContext<'a> {
    pbs: &'a PbsDirectives,
    binary: &'a str,
    config: String,
    /// `config`, quoted for the shell.
    config_arg: String,
}

/// Renders the submission script. `template` overrides the built-in template.
pub fn render(project: &ProjectConfig, config_path: &Path, template: Option<&str>) -> Result<String> {
    let mut registry = Handlebars::new();
    registry.register_escape_fn(handlebars::no_escape);
    registry.set_strict_mode(false);
    handlebars_misc_helpers::register(&mut registry);
    registry.register_template_string(TEMPLATE_NAME, template.unwrap_or(DEFAULT_TEMPLATE))?;

    let config = config_path.display().to_string();
    let context = ScriptContext {
        pbs: &project.pbs,
        binary: &project.binary,
        config_arg: shell_quote(&config),
        config,
    };
    Ok(registry.render(TEMPLATE_NAME, &context)?)
}

/// Single-quotes `s` unless every character is safe in a shell word.
fn shell_quote(s: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c);
    if !s.is_empty() && s.chars().all(safe) {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// Reads the custom template named in the project file, if any.
pub async fn load_template(project: &ProjectConfig, workdir: &Path) -> Result<Option<String>> {
    match &project.pbs.template {
        Some(path) => {
            let path = workdir.join(path);
            let template = fs::read_to_string(&path).await.map_err(|e| {
                JobstageError::Template(format!("Failed to read {}: {}", path.display(), e))
            })?;
            Ok(Some(template))
        }
        None => Ok(None),
    }
}

/// PBS refuses to start a job whose log directory is missing.
pub async fn create_log_dir(project: &ProjectConfig, workdir: &Path) -> Result<PathBuf> {
    let log_dir = workdir.join(&project.pbs.log_dir);
    fs::create_dir_all(&log_dir).await?;
    Ok(log_dir)
}
