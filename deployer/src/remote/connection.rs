//! Logical SSH connections

use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fleet_api::Instance;

use crate::errors::DeployError;
use crate::remote::transport::{Gateway, RemoteSession, RemoteTransport, SshTarget};

/// Jump host used to reach otherwise unreachable targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JumpHost {
    pub host: String,

    /// Defaults to the connection's user
    #[serde(default)]
    pub user: Option<String>,
}

/// What to connect to
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    Host(&'a str),
    Instance(&'a Instance),
}

/// A named, declarative SSH connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    /// Registry key, filled in when the registry is built
    #[serde(skip)]
    pub name: String,

    #[serde(default)]
    pub user: Option<String>,

    /// Literal host; instance targets override it
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub jump: Option<JumpHost>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Copied from the owning deploy
    #[serde(skip)]
    pub prefer_private_ip: bool,
}

fn default_connect_timeout_secs() -> u64 {
    20
}

impl Connection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Resolve the endpoint for `target`, falling back to the configured host
    pub fn resolve(&self, target: Option<Target<'_>>) -> Result<SshTarget, DeployError> {
        let user = self
            .user
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| {
                DeployError::ConfigError(format!("connection '{}' has no user", self.name))
            })?;

        let host = match target {
            Some(Target::Host(host)) => Some(host.to_string()),
            Some(Target::Instance(instance)) => instance
                .address(self.prefer_private_ip)
                .map(str::to_string),
            None => self.host.clone(),
        }
        .filter(|h| !h.trim().is_empty())
        .ok_or_else(|| {
            DeployError::ConfigError(format!("connection '{}' has no host", self.name))
        })?;

        Ok(SshTarget {
            user,
            host,
            port: self.port,
            connect_timeout: self.connect_timeout(),
        })
    }

    /// Resolve the jump host, if one is configured
    pub fn resolve_jump(&self) -> Option<SshTarget> {
        let jump = self.jump.as_ref()?;
        let user = jump.user.clone().or_else(|| self.user.clone())?;
        Some(SshTarget {
            user,
            host: jump.host.clone(),
            port: None,
            connect_timeout: self.connect_timeout(),
        })
    }

    /// Open a session to `target` and run `body` with it.
    ///
    /// The session, and the gateway when a jump host is configured, are
    /// closed after `body` completes whether it succeeded or not. If the
    /// returned future is dropped early both are dropped with it.
    pub async fn with_connection<T, F>(
        &self,
        transport: &dyn RemoteTransport,
        target: Option<Target<'_>>,
        body: F,
    ) -> Result<T, DeployError>
    where
        F: for<'s> FnOnce(&'s dyn RemoteSession) -> BoxFuture<'s, Result<T, DeployError>>,
    {
        let resolved = self.resolve(target)?;
        let (session, gateway) = self.open(transport, &resolved).await?;

        let result = body(session.as_ref()).await;

        if let Err(e) = session.close().await {
            debug!("Error closing session to {}: {}", resolved, e);
        }
        if let Some(gateway) = gateway {
            info!("Shutting down gateway connection");
            if let Err(e) = gateway.shutdown().await {
                warn!("Error shutting down gateway: {}", e);
            }
        }

        result
    }

    async fn open(
        &self,
        transport: &dyn RemoteTransport,
        target: &SshTarget,
    ) -> Result<(Box<dyn RemoteSession>, Option<Box<dyn Gateway>>), DeployError> {
        let timeout = self.connect_timeout();

        match self.resolve_jump() {
            Some(jump) => {
                info!("Connecting to gateway {}", jump);
                let gateway = tokio::time::timeout(timeout, transport.open_gateway(&jump))
                    .await
                    .map_err(|_| {
                        DeployError::ConnectionError(format!(
                            "timed out connecting to gateway {}",
                            jump
                        ))
                    })??;

                info!("Connecting to {} through gateway", target);
                let connected = match tokio::time::timeout(timeout, gateway.connect(target)).await {
                    Ok(connected) => connected,
                    Err(_) => Err(DeployError::ConnectionError(format!(
                        "timed out connecting to {} through {}",
                        target, jump
                    ))),
                };
                let session = match connected {
                    Ok(session) => session,
                    Err(e) => {
                        if let Err(shutdown) = gateway.shutdown().await {
                            debug!("Error shutting down gateway {}: {}", jump, shutdown);
                        }
                        return Err(e);
                    }
                };
                Ok((session, Some(gateway)))
            }
            None => {
                info!("Connecting to {}", target);
                let session = tokio::time::timeout(timeout, transport.connect(target))
                    .await
                    .map_err(|_| {
                        DeployError::ConnectionError(format!("timed out connecting to {}", target))
                    })??;
                Ok((session, None))
            }
        }
    }
}
