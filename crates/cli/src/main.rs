use crate::{
    commands::{Commands, ConfigCommand, SourceCommand},
    env::EnvManager,
    error::CliError,
    shutdown::{ExitCode, wait_for_signal},
};
use clap::Parser;
use connectors::factory::DefaultDataSourceFactory;
use engine_config::settings::{job::MigrationJobSpec, process::ProcessConfiguration};
use engine_core::{coordination::SledCoordinationService, repository::PipelineRepository};
use engine_runtime::api::migration::MigrationJobApi;
use model::core::identifiers::JobId;
use std::{path::PathBuf, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod commands;
mod conn;
mod env;
mod error;
mod output;
mod shutdown;

#[derive(Parser)]
#[command(name = "pipectl", version = "0.1.0", about = "Online table migration tool")]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "PIPECTL_STATE_DIR",
        help = "Directory of the job state store, defaults to ~/.pipectl/state"
    )]
    state_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "File of KEY=VALUE variables for ${VAR} in source URLs")]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "Command failed");
            eprintln!("Error: {err}");
            ExitCode::GeneralError
        }
    };
    std::process::exit(code.as_i32());
}

async fn run(cli: Cli) -> Result<ExitCode, CliError> {
    let (api, store) = open_api(cli.state_dir)?;
    let mut env = EnvManager::from_system();
    if let Some(path) = &cli.env_file {
        env.load_from_file(path)?;
    }

    let code = match cli.command {
        Commands::Source { command } => {
            match command {
                SourceCommand::Add { sources } => {
                    let sources = conn::parse_sources(&sources, &env)?;
                    let count = sources.len();
                    api.add_source_connections(sources).await?;
                    println!("Registered {count} source resource(s)");
                }
                SourceCommand::List { json } => {
                    let sources = api.list_source_connections().await?;
                    if json {
                        output::print_json(&sources)?;
                    } else {
                        output::print_sources(&sources);
                    }
                }
                SourceCommand::Drop { names } => {
                    api.drop_source_connections(&names).await?;
                    println!("Dropped {} source resource(s)", names.len());
                }
            }
            ExitCode::Success
        }
        Commands::Migrate {
            sources,
            target,
            target_table,
            unique_key,
            concurrency,
            retry_times,
            process_config,
        } => {
            if let Some(path) = process_config {
                let config = ProcessConfiguration::from_json_file(&path)?;
                api.alter_process_configuration(&config).await?;
            }
            let mut spec = MigrationJobSpec::new(sources, conn::parse_url(&target, &env)?)
                .with_concurrency(concurrency)
                .with_retry_times(retry_times);
            if let Some(table) = &target_table {
                spec = spec.with_target_table(table);
            }
            if let Some(key) = &unique_key {
                spec = spec.with_unique_key(key);
            }
            let job_id = api.create_and_start(&spec).await?;
            println!("Job {job_id} started, press Ctrl+C to stop");
            run_until_shutdown(&api, &job_id).await
        }
        Commands::Start { job_id } => {
            let job_id = JobId::new(job_id);
            api.start(&job_id).await?;
            println!("Job {job_id} resumed, press Ctrl+C to stop");
            run_until_shutdown(&api, &job_id).await
        }
        Commands::Stop { job_id } => {
            api.stop(&JobId::new(job_id.as_str())).await?;
            println!("Job {job_id} stopped");
            ExitCode::Success
        }
        Commands::Progress { job_id, json } => {
            let progress = api.get_progress(&JobId::new(job_id.as_str())).await?;
            if json {
                output::print_json(&progress)?;
            } else {
                output::print_progress(&job_id, &progress);
            }
            ExitCode::Success
        }
        Commands::Check {
            job_id,
            algorithm,
            props,
            json,
        } => {
            let algorithm = conn::parse_algorithm(&algorithm, &props)?;
            let results = api
                .check_jobs()
                .check(&JobId::new(job_id), &algorithm)
                .await?;
            if json {
                output::print_json(&results)?;
            } else {
                output::print_check_results(&results);
            }
            ExitCode::Success
        }
        Commands::CheckStatus { job_id, json } => {
            match api.check_jobs().latest_results(&JobId::new(job_id.as_str())).await? {
                Some(report) if json => output::print_json(&report)?,
                Some(report) => output::print_check_report(&report),
                None => println!("Job {job_id} has not been checked"),
            }
            ExitCode::Success
        }
        Commands::Commit { job_id } => {
            api.commit(&JobId::new(job_id.as_str())).await?;
            println!("Job {job_id} committed");
            ExitCode::Success
        }
        Commands::Rollback { job_id } => {
            api.rollback(&JobId::new(job_id.as_str())).await?;
            println!("Job {job_id} rolled back");
            ExitCode::Success
        }
        Commands::Jobs { json } => {
            let jobs = api.list_jobs().await?;
            if json {
                output::print_json(&jobs)?;
            } else {
                output::print_jobs(&jobs);
            }
            ExitCode::Success
        }
        Commands::Config { command } => {
            let config = match command {
                ConfigCommand::Show => api.show_process_configuration().await?,
                ConfigCommand::Set { key, value } => api.set_process_setting(&key, &value).await?,
            };
            output::print_json(&config)?;
            ExitCode::Success
        }
    };

    store
        .flush()
        .map_err(|e| CliError::Unexpected(format!("Failed to flush state store: {e}")))?;
    Ok(code)
}

async fn run_until_shutdown(api: &MigrationJobApi, job_id: &JobId) -> ExitCode {
    let signal = wait_for_signal().await;
    info!(job_id = %job_id, "Stopping jobs before exit");
    api.shutdown().await;
    signal.exit_code()
}

fn open_api(state_dir: Option<PathBuf>) -> Result<(MigrationJobApi, Arc<SledCoordinationService>), CliError> {
    let path = match state_dir {
        Some(path) => path,
        None => dirs::home_dir()
            .ok_or_else(|| CliError::Unexpected("Could not determine home directory".into()))?
            .join(".pipectl/state"),
    };
    let store = Arc::new(SledCoordinationService::open(&path).map_err(|source| {
        CliError::StateStore {
            path: path.display().to_string(),
            source,
        }
    })?);
    let repository = PipelineRepository::new(store.clone());
    let api = MigrationJobApi::new(repository, Arc::new(DefaultDataSourceFactory::new()));
    Ok((api, store))
}
