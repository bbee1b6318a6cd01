//! fleetroll - Entry Point
//!
//! Runs deploy jobs defined in a deploy file against the fleet provider.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{error, info, warn};

use fleetroll::config::registry::DEFAULT_FILE;
use fleetroll::config::Registry;
use fleetroll::deploy::migration::ENVIRONMENT_VAR;
use fleetroll::deploy::ssh_commands::{run_ssh_command, ssh_commands};
use fleetroll::deploy::{Job, Runner};
use fleetroll::errors::DeployError;
use fleetroll::fleet::http::HttpFleetProvider;
use fleetroll::fleet::FleetProvider;
use fleetroll::logs::{init_logging, LogLevel, LogOptions};
use fleetroll::remote::openssh::OpensshTransport;
use fleetroll::remote::RemoteTransport;
use fleetroll::utils::{current_build_id, version_info};

#[derive(Debug, Parser)]
#[command(name = "fleetroll", version, about = "Rolling fleet replacement deploys")]
struct Cli {
    /// Deploy file
    #[arg(short = 'f', long = "file", default_value = DEFAULT_FILE, global = true)]
    file: PathBuf,

    /// Runtime environment used by migrations
    #[arg(long = "env", env = ENVIRONMENT_VAR, global = true)]
    environment: Option<String>,

    #[arg(long, default_value = "info", global = true)]
    log_level: LogLevel,

    #[arg(long, global = true)]
    json_logs: bool,

    /// Also write daily log files into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print a login command for each instance of the deploy
    Ssh {
        deploy: String,
        /// Run the first command
        #[arg(long)]
        run: bool,
    },
    Migrate { deploy: String },
    CreateGroup { deploy: String },
    Wait { deploy: String },
    StopApp { deploy: String },
    DestroyOld { deploy: String },
    DestroyNew { deploy: String },
    PostDeploy { deploy: String },
    /// Migrate and create the group
    Prep { deploy: String },
    /// Wait, stop the old app, destroy old groups and run the post deploy hook
    Release { deploy: String },
    All { deploy: String },
    /// Like `all` with migration and group creation running concurrently
    AllAsync { deploy: String },
    /// Deploy every member of an env concurrently
    Env {
        name: String,
        #[arg(long = "async")]
        concurrent: bool,
    },
    Version,
}

impl Commands {
    fn job(&self) -> Option<(&str, Job)> {
        let (deploy, job) = match self {
            Commands::Migrate { deploy } => (deploy, Job::Migrate),
            Commands::CreateGroup { deploy } => (deploy, Job::CreateGroup),
            Commands::Wait { deploy } => (deploy, Job::Wait),
            Commands::StopApp { deploy } => (deploy, Job::StopApp),
            Commands::DestroyOld { deploy } => (deploy, Job::DestroyOld),
            Commands::DestroyNew { deploy } => (deploy, Job::DestroyNew),
            Commands::PostDeploy { deploy } => (deploy, Job::PostDeploy),
            Commands::Prep { deploy } => (deploy, Job::Prep),
            Commands::Release { deploy } => (deploy, Job::Release),
            Commands::All { deploy } => (deploy, Job::All),
            Commands::AllAsync { deploy } => (deploy, Job::AllAsync),
            Commands::Ssh { .. } | Commands::Env { .. } | Commands::Version => return None,
        };
        Some((deploy.as_str(), job))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        return match serde_json::to_string_pretty(&version_info()) {
            Ok(version) => {
                println!("{}", version);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Failed to render version: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let log_options = LogOptions {
        log_level: cli.log_level.clone(),
        json_format: cli.json_logs,
        log_dir: cli.log_dir.clone(),
        ..Default::default()
    };
    let _guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            eprintln!("{} {}", "error:".red().bold(), e);
            match e.root() {
                DeployError::NotFound(_) | DeployError::ConfigError(_) => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, DeployError> {
    let registry = Arc::new(Registry::load(&cli.file).await?);
    let base_url = registry.provider().resolved_base_url()?;
    let provider: Arc<dyn FleetProvider> = Arc::new(HttpFleetProvider::from_env(&base_url)?);
    let transport: Arc<dyn RemoteTransport> = Arc::new(OpensshTransport::new());

    if let Commands::Ssh { deploy, run } = &cli.command {
        return ssh(&registry, provider, deploy, *run).await;
    }

    let build_id = current_build_id().await;
    info!("Build {}", build_id);
    let mut runner =
        Runner::new(registry, provider, transport, build_id).with_environment(cli.environment);

    let work = async {
        match &cli.command {
            Commands::Env { name, concurrent } => {
                let job = if *concurrent { Job::AllAsync } else { Job::All };
                runner.deploy_env(name, job).await
            }
            command => match command.job() {
                Some((deploy, job)) => {
                    runner
                        .with_deploy(deploy, move |r| Box::pin(r.run_job(job)))
                        .await
                }
                None => Ok(()),
            },
        }
    };

    tokio::select! {
        result = work => result.map(|_| ExitCode::SUCCESS),
        _ = await_shutdown_signal() => {
            warn!("Deploy interrupted");
            Ok(ExitCode::from(130))
        }
    }
}

async fn ssh(
    registry: &Registry,
    provider: Arc<dyn FleetProvider>,
    name: &str,
    run: bool,
) -> Result<ExitCode, DeployError> {
    let deploy = registry
        .deploy(name)
        .ok_or_else(|| DeployError::NotFound(format!("No deploy named '{}'", name)))?;

    let provider = match &deploy.assume_role {
        Some(role) => provider.assume_role(role, "fleetroll-ssh").await?,
        None => provider,
    };

    let commands = ssh_commands(provider.as_ref(), &deploy).await?;
    for command in &commands {
        println!("{}", command);
    }

    match commands.first() {
        Some(first) if run => {
            let code = run_ssh_command(first).await?;
            Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
        }
        _ => Ok(ExitCode::SUCCESS),
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, shutting down...");
                    }
                    Ok(()) = tokio::signal::ctrl_c() => {
                        info!("Ctrl+C received, shutting down...");
                    }
                }
            }
            Err(e) => {
                warn!("Unable to listen for SIGTERM: {}", e);
                if tokio::signal::ctrl_c().await.is_err() {
                    futures::future::pending::<()>().await;
                }
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            futures::future::pending::<()>().await;
        }
        info!("Ctrl+C received, shutting down...");
    }
}
