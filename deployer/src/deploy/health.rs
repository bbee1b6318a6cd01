//! Instance health probes

use std::sync::Arc;

use tracing::debug;

use fleet_api::Instance;

use crate::config::{Deploy, IsAliveProbe};
use crate::errors::DeployError;
use crate::fleet::FleetProvider;
use crate::remote::{RemoteTransport, Target};

/// Default probe: fetch the live check URL from the instance itself
pub fn default_probe_command(url: &str, ssl: bool) -> String {
    let insecure = if ssl { "--no-check-certificate " } else { "" };
    format!("wget -q {}'{}' -O /dev/null", insecure, url)
}

/// Judges whether a single instance is serving
#[derive(Clone)]
pub struct HealthChecker {
    provider: Arc<dyn FleetProvider>,
    transport: Arc<dyn RemoteTransport>,
}

impl HealthChecker {
    pub fn new(provider: Arc<dyn FleetProvider>, transport: Arc<dyn RemoteTransport>) -> Self {
        Self {
            provider,
            transport,
        }
    }

    /// True when the instance is running and its probe passes.
    ///
    /// Any error along the way counts as unhealthy.
    pub async fn healthy(&self, deploy: &Arc<Deploy>, instance_id: &str) -> bool {
        match self.check(deploy, instance_id).await {
            Ok(healthy) => {
                debug!("Instance {} healthy: {}", instance_id, healthy);
                healthy
            }
            Err(e) => {
                debug!("Instance {} failed health check: {}", instance_id, e);
                false
            }
        }
    }

    async fn check(&self, deploy: &Arc<Deploy>, instance_id: &str) -> Result<bool, DeployError> {
        let instance = match self.provider.describe_instance(instance_id).await? {
            Some(instance) => instance,
            None => {
                debug!("Instance {} no longer exists", instance_id);
                return Ok(false);
            }
        };
        if !instance.is_running() {
            debug!("Instance {} is {:?}", instance_id, instance.state);
            return Ok(false);
        }
        self.probe(deploy, &instance).await
    }

    async fn probe(&self, deploy: &Arc<Deploy>, instance: &Instance) -> Result<bool, DeployError> {
        let probe = deploy.is_alive.clone();
        let url = deploy.live_check_url();
        let ssl = deploy.ssl;
        let context = Arc::clone(deploy);

        deploy
            .ssh
            .with_connection(
                self.transport.as_ref(),
                Some(Target::Instance(instance)),
                move |session| {
                    Box::pin(async move {
                        match probe {
                            IsAliveProbe::Custom(custom) => {
                                Ok(custom.is_alive(session, &context).await?)
                            }
                            IsAliveProbe::Command(command) => {
                                Ok(session.exec(&command).await?.success())
                            }
                            IsAliveProbe::None => {
                                let command = default_probe_command(&url, ssl);
                                Ok(session.exec(&command).await?.success())
                            }
                        }
                    })
                },
            )
            .await
    }
}
