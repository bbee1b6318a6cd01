//! Database migrations through an SSH port forward

use std::sync::Arc;

use tokio::process::Command;
use tracing::{info, warn};

use crate::config::{database, Deploy};
use crate::errors::DeployError;
use crate::remote::RemoteTransport;
use crate::utils::random_open_port;

/// Variable naming the runtime environment
pub const ENVIRONMENT_VAR: &str = "DEPLOY_ENV";

/// Outcome of a completed migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationSession {
    pub local_port: u16,
    /// `host:port` of the database as seen from the SSH host
    pub remote: String,
    pub exit_status: Option<i32>,
}

/// Forwards a local port to the database and runs the migration command
pub struct MigrationTunnel {
    transport: Arc<dyn RemoteTransport>,
}

impl MigrationTunnel {
    pub fn new(transport: Arc<dyn RemoteTransport>) -> Self {
        Self { transport }
    }

    /// Run the deploy's migration; `Ok(None)` when migrations are disabled
    pub async fn run(
        &self,
        deploy: &Deploy,
        environment: Option<&str>,
    ) -> Result<Option<MigrationSession>, DeployError> {
        let Some(db_config_path) = deploy.db_config_path.as_deref() else {
            info!("No database config for {}, skipping migration", deploy.name);
            return Ok(None);
        };

        let environment = environment
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| {
                DeployError::ConfigError(format!(
                    "{} must be set to run migrations",
                    ENVIRONMENT_VAR
                ))
            })?
            .to_string();

        let command = deploy.migration_command.clone().ok_or_else(|| {
            DeployError::ConfigError(format!("deploy '{}' has no migration_command", deploy.name))
        })?;

        let db = database::load(db_config_path, &environment).await?;
        let local_port = random_open_port()?;
        let child_env = db.child_env(local_port, &environment)?;
        let remote_host = db.host.clone();
        let remote_port = db.remote_port();

        info!(
            "Forwarding 127.0.0.1:{} to {}:{}",
            local_port, remote_host, remote_port
        );

        let exit_status = deploy
            .migration_ssh_ref()
            .with_connection(self.transport.as_ref(), None, move |session| {
                Box::pin(async move {
                    session
                        .forward_local(local_port, &remote_host, remote_port)
                        .await?;

                    let result = run_child(&command, &child_env).await;

                    if let Err(e) = session
                        .close_forward(local_port, &remote_host, remote_port)
                        .await
                    {
                        warn!("Failed to close forward on port {}: {}", local_port, e);
                    }
                    result
                })
            })
            .await?;

        info!("Migration for {} finished", deploy.name);
        Ok(Some(MigrationSession {
            local_port,
            remote: format!("{}:{}", db.host, db.remote_port()),
            exit_status,
        }))
    }
}

/// Run `command` through `sh -c`; the child is killed if this future is dropped
async fn run_child(command: &str, env: &[(String, String)]) -> Result<Option<i32>, DeployError> {
    info!("Running migration: {}", command);
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .kill_on_drop(true)
        .spawn()?;

    let status = child.wait().await?;
    if status.success() {
        return Ok(status.code());
    }

    let code = status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "terminated by signal".to_string());
    Err(DeployError::MigrationError(format!("migration failed: {}", code)))
}
