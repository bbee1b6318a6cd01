//! Deploy orchestration
//!
//! A [`Runner`] drives the phases of one deploy at a time. The active deploy
//! is set with [`Runner::with_deploy`] and restored when the body finishes,
//! fails, or is dropped. Each phase method reads the active deploy; calling
//! one without it is an error.

use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::{join_all, try_join_all, BoxFuture};
use tokio::process::Command;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use fleet_api::{FleetGroup, Instance};

use crate::config::{Deploy, Registry};
use crate::deploy::health::HealthChecker;
use crate::deploy::migration::{MigrationTunnel, ENVIRONMENT_VAR};
use crate::deploy::tail::LogTailer;
use crate::deploy::workflow::{Job, Phase, PhaseEvent, WorkflowFsm};
use crate::errors::DeployError;
use crate::fleet::provider::{all_groups, group_exists, launch_template_exists};
use crate::fleet::{FleetProvider, FleetSelector};
use crate::remote::{RemoteTransport, Target};

/// Delay between wait loop rounds
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// How many times a deleted group is checked before its template is removed
const DELETE_CHECKS: u32 = 3;
const DELETE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Runs deploy phases against a provider and a remote transport
pub struct Runner {
    registry: Arc<Registry>,
    /// Replaced when this runner's deploy assumes a role
    provider: RwLock<Arc<dyn FleetProvider>>,
    transport: Arc<dyn RemoteTransport>,
    build_id: String,
    environment: Option<String>,
    poll_interval: Duration,
    deploy: Option<Arc<Deploy>>,
    tailer: LogTailer,
}

/// Restores the previously active deploy when dropped
struct DeployScope<'a> {
    runner: &'a mut Runner,
    previous: Option<Arc<Deploy>>,
}

impl Deref for DeployScope<'_> {
    type Target = Runner;

    fn deref(&self) -> &Runner {
        self.runner
    }
}

impl DerefMut for DeployScope<'_> {
    fn deref_mut(&mut self) -> &mut Runner {
        self.runner
    }
}

impl Drop for DeployScope<'_> {
    fn drop(&mut self) {
        self.runner.deploy = self.previous.take();
    }
}

impl Runner {
    pub fn new(
        registry: Arc<Registry>,
        provider: Arc<dyn FleetProvider>,
        transport: Arc<dyn RemoteTransport>,
        build_id: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            provider: RwLock::new(provider),
            tailer: LogTailer::new(Arc::clone(&transport)),
            transport,
            build_id: build_id.into(),
            environment: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            deploy: None,
        }
    }

    /// Runtime environment used by migrations
    pub fn with_environment(mut self, environment: Option<String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// An independent runner acting through `provider`
    fn fork_with(&self, provider: Arc<dyn FleetProvider>) -> Runner {
        Runner::new(
            Arc::clone(&self.registry),
            provider,
            Arc::clone(&self.transport),
            self.build_id.clone(),
        )
        .with_environment(self.environment.clone())
        .with_poll_interval(self.poll_interval)
    }

    /// Provider for this runner's current credentials
    pub fn provider(&self) -> Arc<dyn FleetProvider> {
        let provider = self
            .provider
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&provider)
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn tailer(&self) -> &LogTailer {
        &self.tailer
    }

    pub fn active_deploy(&self) -> Option<&Arc<Deploy>> {
        self.deploy.as_ref()
    }

    fn deploy(&self) -> Result<Arc<Deploy>, DeployError> {
        self.deploy
            .clone()
            .ok_or_else(|| DeployError::Internal("no active deploy".to_string()))
    }

    /// Make `name` the active deploy while `body` runs
    pub async fn with_deploy<T, F>(&mut self, name: &str, body: F) -> Result<T, DeployError>
    where
        F: for<'a> FnOnce(&'a mut Runner) -> BoxFuture<'a, Result<T, DeployError>>,
    {
        let deploy = self
            .registry
            .deploy(name)
            .ok_or_else(|| DeployError::NotFound(format!("No deploy named '{}'", name)))?;

        let previous = self.deploy.replace(deploy);
        let mut scope = DeployScope {
            runner: self,
            previous,
        };
        let result = body(&mut *scope).await;
        drop(scope);
        result
    }

    /// Run `job` for the active deploy
    pub async fn run_job(&self, job: Job) -> Result<(), DeployError> {
        let deploy = self.deploy()?;
        let mut fsm = WorkflowFsm::new();
        info!("Running {:?} for {} (build {})", job, deploy.name, self.build_id);

        for step in job.plan() {
            for phase in &step {
                fsm.process(PhaseEvent::Enter(*phase))
                    .map_err(DeployError::Internal)?;
            }

            let outcome = try_join_all(step.iter().map(|phase| {
                let phase = *phase;
                async move { self.run_phase(phase).await.map_err(|e| (phase, e)) }
            }))
            .await;

            match outcome {
                Ok(_) => {
                    for phase in &step {
                        fsm.process(PhaseEvent::Complete(*phase))
                            .map_err(DeployError::Internal)?;
                    }
                }
                Err((phase, e)) => {
                    error!("Phase {} failed for {}: {}", phase, deploy.name, e);
                    fsm.process(PhaseEvent::Fail(phase, e.to_string()))
                        .map_err(DeployError::Internal)?;
                    return Err(e.in_phase(phase));
                }
            }
        }

        fsm.process(PhaseEvent::Finish)
            .map_err(DeployError::Internal)?;
        info!("{:?} finished for {}", job, deploy.name);
        Ok(())
    }

    pub async fn run_phase(&self, phase: Phase) -> Result<(), DeployError> {
        debug!("Entering phase {}", phase);
        match phase {
            Phase::AssumeRole => self.assume_role().await,
            Phase::Migrate => self.run_migration().await,
            Phase::Provision => self.create_fleet_group().await,
            Phase::WaitHealthy => self.wait_for_new_instances().await,
            Phase::StopOldApp => self.stop_app().await,
            Phase::DestroyOld => self.destroy_old_groups().await,
            Phase::DestroyNew => self.destroy_new_groups().await,
            Phase::PostDeploy => self.run_post_deploy().await,
        }
    }

    /// Run `job` for every deploy of an env concurrently, one runner each
    pub async fn deploy_env(&self, name: &str, job: Job) -> Result<(), DeployError> {
        let env = self
            .registry
            .env(name)
            .cloned()
            .ok_or_else(|| DeployError::NotFound(format!("No env named '{}'", name)))?;

        let provider = match &env.assume_role {
            Some(role) => {
                info!("Assuming role {} for env {}", role, env.name);
                self.provider()
                    .assume_role(role, &role_session_name(&self.build_id))
                    .await
                    .map_err(|e| e.in_phase(Phase::AssumeRole))?
            }
            None => self.provider(),
        };

        let runs = env.deploys.iter().map(|deploy| {
            let mut runner = self.fork_with(Arc::clone(&provider));
            let deploy = deploy.clone();
            async move {
                let result = runner
                    .with_deploy(&deploy, move |r| Box::pin(r.run_job(job)))
                    .await;
                (deploy, result)
            }
        });

        let failures: Vec<String> = join_all(runs)
            .await
            .into_iter()
            .filter_map(|(deploy, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    error!("Deploy {} failed: {}", deploy, e);
                    Some(deploy)
                }
            })
            .collect();

        if failures.is_empty() {
            info!("Env {} deployed", env.name);
            Ok(())
        } else {
            Err(DeployError::PartialFailure(format!(
                "env {}: {} of {} deploys failed ({})",
                env.name,
                failures.len(),
                env.deploys.len(),
                failures.join(", ")
            )))
        }
    }

    pub async fn assume_role(&self) -> Result<(), DeployError> {
        let deploy = self.deploy()?;
        if let Some(role) = &deploy.assume_role {
            info!("Assuming role {}", role);
            let assumed = self
                .provider()
                .assume_role(role, &role_session_name(&self.build_id))
                .await?;
            *self
                .provider
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = assumed;
        }
        Ok(())
    }

    pub async fn run_migration(&self) -> Result<(), DeployError> {
        let deploy = self.deploy()?;
        MigrationTunnel::new(Arc::clone(&self.transport))
            .run(&deploy, self.environment.as_deref())
            .await?;
        Ok(())
    }

    /// Create the launch template and group for this build unless they exist
    pub async fn create_fleet_group(&self) -> Result<(), DeployError> {
        let deploy = self.deploy()?;
        let provider = self.provider();
        let provider = provider.as_ref();

        let template = deploy.launch_template_name(&self.build_id);
        if launch_template_exists(provider, &template).await? {
            info!("Launch template {} already exists", template);
        } else {
            info!("Creating launch template {}", template);
            provider
                .create_launch_template(&deploy.create_launch_template_request(&self.build_id))
                .await?;
        }

        let group = deploy.group_name(&self.build_id);
        if group_exists(provider, &group).await? {
            info!("Fleet group {} already exists", group);
        } else {
            info!("Creating fleet group {}", group);
            provider
                .create_group(&deploy.create_group_request(&self.build_id))
                .await?;
        }
        Ok(())
    }

    /// Groups of the active deploy created by this build
    pub async fn current_groups(&self) -> Result<Vec<FleetGroup>, DeployError> {
        Ok(self.partition_groups().await?.0)
    }

    /// Groups of the active deploy created by any other build
    pub async fn previous_groups(&self) -> Result<Vec<FleetGroup>, DeployError> {
        Ok(self.partition_groups().await?.1)
    }

    async fn partition_groups(&self) -> Result<(Vec<FleetGroup>, Vec<FleetGroup>), DeployError> {
        let deploy = self.deploy()?;
        let groups = all_groups(self.provider().as_ref()).await?;
        let tag = deploy.deploy_tag();
        let (current, previous) = FleetSelector::new(&tag, &self.build_id).partition(&groups);
        Ok((
            current.into_iter().cloned().collect(),
            previous.into_iter().cloned().collect(),
        ))
    }

    async fn instances_of(&self, groups: &[FleetGroup]) -> Result<Vec<Instance>, DeployError> {
        let provider = self.provider();
        let mut instances = Vec::new();
        for group in groups {
            instances.extend(provider.list_instances(&group.name).await?);
        }
        Ok(instances)
    }

    /// Wait until every instance of the current groups passes its health check.
    ///
    /// Log tails started along the way are stopped before returning, and
    /// aborted if this future is dropped first.
    pub async fn wait_for_new_instances(&self) -> Result<(), DeployError> {
        let deploy = self.deploy()?;
        let grace = deploy.instance_live_grace_period;
        info!("Waiting for new instances of {}", deploy.name);

        let tails = self.tailer.scope();
        let result = tokio::time::timeout(grace, self.poll_until_healthy(&deploy)).await;
        tails.stop().await;

        match result {
            Ok(result) => result,
            Err(_) => Err(DeployError::Timeout(format!(
                "site live check timed out after {} seconds",
                grace.as_secs()
            ))),
        }
    }

    async fn poll_until_healthy(&self, deploy: &Arc<Deploy>) -> Result<(), DeployError> {
        let checker = HealthChecker::new(self.provider(), Arc::clone(&self.transport));
        let mut live: HashSet<String> = HashSet::new();

        loop {
            let groups = self.current_groups().await?;
            let required: usize = groups.iter().map(|g| g.min_size as usize).sum();
            let instances = self.instances_of(&groups).await?;

            if groups.is_empty() {
                info!("No fleet group for build {} yet", self.build_id);
            } else if instances.len() < required {
                info!(
                    "Waiting for instances to come up ({}/{})",
                    instances.len(),
                    required
                );
            } else {
                for instance in &instances {
                    self.tailer.start(deploy, instance);
                }

                let remaining: Vec<&Instance> = instances
                    .iter()
                    .filter(|i| !live.contains(&i.id))
                    .collect();
                info!(
                    "Waiting for instances to be live ({} remaining)",
                    remaining.len()
                );
                for instance in remaining {
                    if checker.healthy(deploy, &instance.id).await {
                        info!("Instance {} is live", instance.id);
                        live.insert(instance.id.clone());
                    }
                }

                if instances.iter().all(|i| live.contains(&i.id)) {
                    info!("New instances are up");
                    return Ok(());
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Stop the application on every instance of the previous groups
    pub async fn stop_app(&self) -> Result<(), DeployError> {
        let deploy = self.deploy()?;
        let Some(stop_command) = deploy.stop_command.clone() else {
            warn!(
                "No stop command for {}, old instances keep serving until destroyed",
                deploy.name
            );
            return Ok(());
        };

        info!("Stopping old app");
        let previous = self.previous_groups().await?;
        let mut to_stop = self.instances_of(&previous).await?;
        info!("Starting with {} instances to stop", to_stop.len());

        for round in 0..=deploy.stop_app_retries {
            if to_stop.is_empty() {
                break;
            }
            debug!("Stop app round {}: {} instances remaining", round + 1, to_stop.len());

            let mut failed = Vec::new();
            for instance in to_stop {
                if !self.stop_one_app(&deploy, &instance, &stop_command).await {
                    failed.push(instance);
                }
            }
            to_stop = failed;
        }

        if to_stop.is_empty() {
            info!("Successfully stopped the app on each old instance");
        } else if deploy.continue_if_stop_app_fails {
            warn!(
                "Failed to stop app on {} instances, continuing",
                to_stop.len()
            );
        } else {
            return Err(DeployError::PartialFailure(format!(
                "Failed to stop app on {} instances",
                to_stop.len()
            )));
        }
        Ok(())
    }

    async fn stop_one_app(&self, deploy: &Deploy, instance: &Instance, stop_command: &str) -> bool {
        debug!("Attempting to stop app on {}", instance.id);
        let command = stop_command.to_string();
        let result = deploy
            .ssh
            .with_connection(
                self.transport.as_ref(),
                Some(Target::Instance(instance)),
                move |session| Box::pin(async move { session.exec(&command).await }),
            )
            .await;

        match result {
            Ok(output) if output.success() => {
                info!("Successfully stopped app on {}", instance.id);
                true
            }
            Ok(output) => {
                warn!(
                    "Stop app failed on {}: exit status {:?}",
                    instance.id, output.exit_status
                );
                false
            }
            Err(e) => {
                warn!("Stop app failed on {} due to: {}", instance.id, e);
                false
            }
        }
    }

    pub async fn destroy_old_groups(&self) -> Result<(), DeployError> {
        let deploy = self.deploy()?;
        info!("Destroying old fleet groups");
        tokio::time::sleep(deploy.sleep_before_termination).await;
        for group in self.previous_groups().await? {
            self.destroy_group(&group).await?;
        }
        info!("Destroyed old fleet groups");
        Ok(())
    }

    pub async fn destroy_new_groups(&self) -> Result<(), DeployError> {
        let deploy = self.deploy()?;
        info!("Destroying new fleet groups");
        tokio::time::sleep(deploy.sleep_before_termination).await;
        for group in self.current_groups().await? {
            self.destroy_group(&group).await?;
        }
        info!("Destroyed new fleet groups");
        Ok(())
    }

    async fn destroy_group(&self, group: &FleetGroup) -> Result<(), DeployError> {
        info!("Deleting fleet group {}", group.name);
        let provider = self.provider();
        provider.delete_group(&group.name, true).await?;

        for _ in 0..DELETE_CHECKS {
            match provider.describe_group(&group.name).await {
                Ok(None) => break,
                Ok(Some(g)) if g.is_deleting() => break,
                Ok(Some(_)) => {}
                Err(e) => debug!("Describing {} failed: {}", group.name, e),
            }
            tokio::time::sleep(DELETE_CHECK_INTERVAL).await;
        }

        if let Some(template) = &group.launch_template {
            if let Err(e) = provider.delete_launch_template(template).await {
                info!(
                    "Launch template {} for {} was not deleted: {}",
                    template, group.name, e
                );
            }
        }
        Ok(())
    }

    /// Run the post deploy hook locally
    pub async fn run_post_deploy(&self) -> Result<(), DeployError> {
        let deploy = self.deploy()?;
        let Some(command) = &deploy.post_deploy_command else {
            debug!("No post deploy command for {}", deploy.name);
            return Ok(());
        };

        info!("Running post deploy: {}", command);
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).kill_on_drop(true);
        if let Some(environment) = &self.environment {
            cmd.env(ENVIRONMENT_VAR, environment);
        }

        let status = cmd.status().await?;
        if !status.success() {
            return Err(DeployError::Internal(format!(
                "post deploy command exited with {}",
                status
            )));
        }
        info!("Post deploy finished");
        Ok(())
    }
}

fn role_session_name(build_id: &str) -> String {
    format!("fleetroll-{}-{}", build_id, Uuid::new_v4().simple())
}
