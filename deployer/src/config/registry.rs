//! Registry of named deploys loaded from the deploy file

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::deploy::{
    normalize_live_check, AliveProbe, Deploy, FleetGroupSpec, IsAliveProbe, LaunchTemplateSpec,
};
use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::remote::Connection;

/// Default deploy file name
pub const DEFAULT_FILE: &str = "fleetroll.json";

/// Environment variable overriding the provider URL
pub const PROVIDER_URL_ENV_VAR: &str = "FLEET_API_URL";

/// Provider endpoint settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ProviderSettings {
    /// The configured URL, with the environment taking precedence
    pub fn resolved_base_url(&self) -> Result<String, DeployError> {
        std::env::var(PROVIDER_URL_ENV_VAR)
            .ok()
            .filter(|u| !u.is_empty())
            .or_else(|| self.base_url.clone())
            .ok_or_else(|| {
                DeployError::ConfigError(format!(
                    "provider.base_url is not set and {} is empty",
                    PROVIDER_URL_ENV_VAR
                ))
            })
    }
}

/// Scaling group as written in the deploy file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetGroupConfig {
    pub launch_template: String,
    pub min_size: u32,
    pub max_size: u32,
    #[serde(default)]
    pub desired_capacity: Option<u32>,
    #[serde(default)]
    pub availability_zones: Vec<String>,
    #[serde(default)]
    pub vpc_zone_identifier: Option<String>,
    #[serde(default)]
    pub default_cooldown: Option<u32>,
    #[serde(default)]
    pub health_check_grace_period: Option<u32>,
    #[serde(default)]
    pub health_check_type: Option<String>,
    #[serde(default)]
    pub load_balancer_names: Vec<String>,
    #[serde(default)]
    pub placement_group: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Deploy as written in the deploy file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Connection name
    pub ssh: String,

    #[serde(default)]
    pub migration_ssh: Option<String>,

    #[serde(default)]
    pub local_ssh: Option<String>,

    /// Fleet group name
    pub fleet_group: String,

    #[serde(default)]
    pub stop_command: Option<String>,

    /// Migrations are disabled when unset
    #[serde(default)]
    pub db_config_path: Option<PathBuf>,

    #[serde(default)]
    pub migration_command: Option<String>,

    #[serde(default = "default_grace_period")]
    pub instance_live_grace_period_secs: u64,

    #[serde(default = "default_app_port")]
    pub app_port: u16,

    #[serde(default)]
    pub continue_if_stop_app_fails: bool,

    #[serde(default = "default_stop_app_retries")]
    pub stop_app_retries: u32,

    #[serde(default = "default_sleep_before_termination")]
    pub sleep_before_termination_secs: u64,

    #[serde(default)]
    pub post_deploy_command: Option<String>,

    #[serde(default = "default_live_check")]
    pub live_check: String,

    #[serde(default)]
    pub ssl: bool,

    #[serde(default = "default_log_files")]
    pub log_files: Vec<String>,

    #[serde(default)]
    pub tail_logs: bool,

    /// Remote command replacing the default HTTP probe
    #[serde(default)]
    pub is_alive_command: Option<String>,

    #[serde(default)]
    pub assume_role: Option<String>,

    #[serde(default)]
    pub prefer_private_ip: bool,
}

fn default_grace_period() -> u64 {
    30 * 60
}

fn default_app_port() -> u16 {
    80
}

fn default_stop_app_retries() -> u32 {
    2
}

fn default_sleep_before_termination() -> u64 {
    20
}

fn default_live_check() -> String {
    "/".to_string()
}

fn default_log_files() -> Vec<String> {
    vec!["/var/log/syslog".to_string()]
}

/// A set of deploys released together
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Env {
    #[serde(skip)]
    pub name: String,

    #[serde(default)]
    pub assume_role: Option<String>,

    pub deploys: Vec<String>,
}

/// The deploy file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryFile {
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default)]
    pub provider: ProviderSettings,

    #[serde(default)]
    pub connections: BTreeMap<String, Connection>,

    #[serde(default)]
    pub launch_templates: BTreeMap<String, LaunchTemplateSpec>,

    #[serde(default)]
    pub fleet_groups: BTreeMap<String, FleetGroupConfig>,

    #[serde(default)]
    pub deploys: BTreeMap<String, DeployConfig>,

    #[serde(default)]
    pub envs: BTreeMap<String, Env>,
}

/// Resolved, indexed deploy definitions
#[derive(Debug, Clone, Default)]
pub struct Registry {
    namespace: Option<String>,
    provider: ProviderSettings,
    deploys: HashMap<String, Arc<Deploy>>,
    by_fleet_group: HashMap<String, String>,
    envs: HashMap<String, Env>,
}

impl Registry {
    /// Load and resolve a deploy file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, DeployError> {
        let file = File::new(path.as_ref());
        debug!("Loading deploy file {}", file.path().display());
        let raw: RegistryFile = file.read_json().await?;
        Self::build(raw)
    }

    /// Resolve every reference in `raw` once
    pub fn build(raw: RegistryFile) -> Result<Self, DeployError> {
        let mut deploys = HashMap::new();
        let mut by_fleet_group = HashMap::new();

        for (name, config) in &raw.deploys {
            let deploy = resolve_deploy(&raw, name, config)?;
            if let Some(other) = by_fleet_group.insert(config.fleet_group.clone(), name.clone()) {
                return Err(DeployError::ConfigError(format!(
                    "fleet group '{}' is used by both '{}' and '{}'",
                    config.fleet_group, other, name
                )));
            }
            deploys.insert(name.clone(), Arc::new(deploy));
        }

        let mut envs = HashMap::new();
        for (name, env) in &raw.envs {
            if let Some(missing) = env.deploys.iter().find(|d| !deploys.contains_key(*d)) {
                return Err(DeployError::ConfigError(format!(
                    "env '{}' references unknown deploy '{}'",
                    name, missing
                )));
            }
            let mut env = env.clone();
            env.name = name.clone();
            envs.insert(name.clone(), env);
        }

        Ok(Self {
            namespace: raw.namespace,
            provider: raw.provider,
            deploys,
            by_fleet_group,
            envs,
        })
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn provider(&self) -> &ProviderSettings {
        &self.provider
    }

    pub fn deploy(&self, name: &str) -> Option<Arc<Deploy>> {
        self.deploys.get(name).cloned()
    }

    /// Deploy names in sorted order
    pub fn deploy_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.deploys.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// The deploy owning the named fleet group
    pub fn deploy_for_fleet_group(&self, fleet_group: &str) -> Option<Arc<Deploy>> {
        self.by_fleet_group
            .get(fleet_group)
            .and_then(|name| self.deploy(name))
    }

    pub fn env(&self, name: &str) -> Option<&Env> {
        self.envs.get(name)
    }

    /// Replace the health probe of a deploy with a custom one
    pub fn set_alive_probe(
        &mut self,
        deploy: &str,
        probe: Arc<dyn AliveProbe>,
    ) -> Result<(), DeployError> {
        let entry = self
            .deploys
            .get_mut(deploy)
            .ok_or_else(|| DeployError::NotFound(format!("deploy '{}'", deploy)))?;
        Arc::make_mut(entry).is_alive = IsAliveProbe::Custom(probe);
        Ok(())
    }

    /// Add or replace a resolved deploy
    pub fn insert(&mut self, deploy: Deploy) {
        self.by_fleet_group
            .insert(deploy.fleet_group.name.clone(), deploy.name.clone());
        self.deploys.insert(deploy.name.clone(), Arc::new(deploy));
    }
}

fn connection(
    raw: &RegistryFile,
    deploy: &str,
    name: &str,
    prefer_private_ip: bool,
) -> Result<Connection, DeployError> {
    let mut conn = raw.connections.get(name).cloned().ok_or_else(|| {
        DeployError::ConfigError(format!(
            "deploy '{}' references unknown connection '{}'",
            deploy, name
        ))
    })?;
    conn.name = name.to_string();
    conn.prefer_private_ip = prefer_private_ip;
    Ok(conn)
}

fn fleet_group(raw: &RegistryFile, deploy: &str, name: &str) -> Result<FleetGroupSpec, DeployError> {
    let config = raw.fleet_groups.get(name).ok_or_else(|| {
        DeployError::ConfigError(format!(
            "deploy '{}' references unknown fleet group '{}'",
            deploy, name
        ))
    })?;

    if config.min_size > config.max_size {
        return Err(DeployError::ConfigError(format!(
            "fleet group '{}' has min_size {} above max_size {}",
            name, config.min_size, config.max_size
        )));
    }
    if config.availability_zones.is_empty() && config.vpc_zone_identifier.is_none() {
        return Err(DeployError::ConfigError(format!(
            "fleet group '{}' needs availability_zones or vpc_zone_identifier",
            name
        )));
    }

    let mut launch_template = raw
        .launch_templates
        .get(&config.launch_template)
        .cloned()
        .ok_or_else(|| {
            DeployError::ConfigError(format!(
                "fleet group '{}' references unknown launch template '{}'",
                name, config.launch_template
            ))
        })?;
    launch_template.name = config.launch_template.clone();

    Ok(FleetGroupSpec {
        name: name.to_string(),
        min_size: config.min_size,
        max_size: config.max_size,
        desired_capacity: config.desired_capacity,
        availability_zones: config.availability_zones.clone(),
        vpc_zone_identifier: config.vpc_zone_identifier.clone(),
        default_cooldown: config.default_cooldown,
        health_check_grace_period: config.health_check_grace_period,
        health_check_type: config.health_check_type.clone(),
        load_balancer_names: config.load_balancer_names.clone(),
        placement_group: config.placement_group.clone(),
        tags: config.tags.clone(),
        launch_template,
    })
}

fn resolve_deploy(raw: &RegistryFile, name: &str, config: &DeployConfig) -> Result<Deploy, DeployError> {
    let private = config.prefer_private_ip;
    let ssh = connection(raw, name, &config.ssh, private)?;
    let migration_ssh = config
        .migration_ssh
        .as_deref()
        .map(|c| connection(raw, name, c, private))
        .transpose()?;
    let local_ssh = config
        .local_ssh
        .as_deref()
        .map(|c| connection(raw, name, c, private))
        .transpose()?;

    let is_alive = match &config.is_alive_command {
        Some(cmd) => IsAliveProbe::Command(cmd.clone()),
        None => IsAliveProbe::None,
    };

    Ok(Deploy {
        name: name.to_string(),
        namespace: raw.namespace.clone(),
        stop_command: config.stop_command.clone(),
        db_config_path: config.db_config_path.clone(),
        migration_command: config.migration_command.clone(),
        instance_live_grace_period: Duration::from_secs(config.instance_live_grace_period_secs),
        app_port: config.app_port,
        continue_if_stop_app_fails: config.continue_if_stop_app_fails,
        stop_app_retries: config.stop_app_retries,
        sleep_before_termination: Duration::from_secs(config.sleep_before_termination_secs),
        post_deploy_command: config.post_deploy_command.clone(),
        live_check: normalize_live_check(&config.live_check),
        ssl: config.ssl,
        log_files: config.log_files.clone(),
        tail_logs: config.tail_logs,
        is_alive,
        assume_role: config.assume_role.clone(),
        prefer_private_ip: private,
        ssh,
        migration_ssh,
        local_ssh,
        fleet_group: fleet_group(raw, name, &config.fleet_group)?,
    })
}
