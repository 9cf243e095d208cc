use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use jobstage::script;
use jobstage::{
    Collector, Config, EnvArgs, Job, LocalExecutor, Mode, Pipeline, ProjectConfig, Result, Rsync,
    Stager, SyncClient,
};

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn job_from_env(project: &ProjectConfig, env: EnvArgs) -> Result<Job> {
    Ok(Job::new(env.into_env()?, project))
}

async fn run_job(project: &ProjectConfig, env: EnvArgs, print_period: usize) -> Result<u8> {
    let job = job_from_env(project, env)?;
    let executor = LocalExecutor::new(job.prettify(), print_period);
    let pipeline = Pipeline::new(project, Box::new(executor));
    let outcome = pipeline.execute(&job).await?;
    if !outcome.report.replaced.is_empty() {
        warn!(
            "{} {} output entries replaced existing ones.",
            job,
            outcome.report.replaced.len()
        );
    }
    Ok(outcome.exit_code())
}

async fn run_stage(project: &ProjectConfig, env: EnvArgs) -> Result<u8> {
    let job = job_from_env(project, env)?;
    let staged = Stager::new(project).stage(&job).await?;
    println!("{}", staged.scratch_dir.display());
    Ok(0)
}

async fn run_collect(project: &ProjectConfig, env: EnvArgs) -> Result<u8> {
    let job = job_from_env(project, env)?;
    let report = Collector::new().collect(&job).await?;
    for path in &report.moved {
        println!("{}", path.display());
    }
    Ok(0)
}

async fn run_push(project: &ProjectConfig, workdir: &Path) -> Result<u8> {
    let client = SyncClient::new(Box::new(Rsync::new()), workdir);
    client.push(&project.push, project.remote()?).await?;
    Ok(0)
}

async fn run_pull(project: &ProjectConfig, workdir: &Path, into: Option<PathBuf>) -> Result<u8> {
    let client = SyncClient::new(Box::new(Rsync::new()), workdir);
    let local = into.unwrap_or_else(|| project.output_dir.clone());
    client
        .pull(project.remote()?, &project.output_dir, &local)
        .await?;
    Ok(0)
}

async fn run_script(
    project: &ProjectConfig,
    config_path: &Path,
    workdir: &Path,
    output: Option<PathBuf>,
) -> Result<u8> {
    let template = script::load_template(project, workdir).await?;
    let rendered = script::render(project, config_path, template.as_deref())?;
    let log_dir = script::create_log_dir(project, workdir).await?;
    info!("Log directory {} is ready.", log_dir.display());
    match output {
        Some(path) => {
            tokio::fs::write(&path, rendered).await?;
            info!("Wrote {}", path.display());
        }
        None => print!("{}", rendered),
    }
    Ok(0)
}

async fn run(cli: Config) -> Result<u8> {
    let project = ProjectConfig::load(&cli.config)?;
    let workdir = std::env::current_dir()?;

    match cli.mode {
        Mode::Run { env, print_period } => run_job(&project, env, print_period).await,
        Mode::Stage { env } => run_stage(&project, env).await,
        Mode::Collect { env } => run_collect(&project, env).await,
        Mode::Push => run_push(&project, &workdir).await,
        Mode::Pull { into } => run_pull(&project, &workdir, into).await,
        Mode::Script { output } => run_script(&project, &cli.config, &workdir, output).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Config::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
