//! Resolved deploy definitions

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use fleet_api::{CreateGroupRequest, CreateLaunchTemplateRequest, BUILD_ID_TAG, DEPLOY_TAG};

use crate::remote::{Connection, RemoteSession};
use crate::utils::strip_indent;

/// Custom health probe supplied by library users.
///
/// Errors count as unhealthy and are logged at debug level.
#[async_trait]
pub trait AliveProbe: Send + Sync {
    async fn is_alive(&self, session: &dyn RemoteSession, deploy: &Deploy)
        -> anyhow::Result<bool>;
}

/// How an instance is judged healthy
#[derive(Clone, Default)]
pub enum IsAliveProbe {
    /// Fetch the live check URL on the instance
    #[default]
    None,
    /// Remote shell command; exit status zero means healthy
    Command(String),
    Custom(Arc<dyn AliveProbe>),
}

impl fmt::Debug for IsAliveProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsAliveProbe::None => f.write_str("None"),
            IsAliveProbe::Command(cmd) => f.debug_tuple("Command").field(cmd).finish(),
            IsAliveProbe::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Instance blueprint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchTemplateSpec {
    #[serde(skip)]
    pub name: String,
    pub image_id: String,
    pub instance_type: String,
    #[serde(default)]
    pub security_groups: Vec<String>,
    #[serde(default)]
    pub user_data: Option<String>,
    #[serde(default)]
    pub iam_instance_profile: Option<String>,
    #[serde(default)]
    pub kernel_id: Option<String>,
    #[serde(default)]
    pub key_name: Option<String>,
    #[serde(default)]
    pub spot_price: Option<String>,
    #[serde(default)]
    pub block_device_mappings: Option<serde_json::Value>,
    #[serde(default)]
    pub network_interfaces: Option<serde_json::Value>,
    #[serde(default)]
    pub ebs_optimized: Option<bool>,
}

impl LaunchTemplateSpec {
    /// User data with shared indentation removed, base64 encoded
    pub fn encoded_user_data(&self) -> String {
        BASE64.encode(strip_indent(self.user_data.as_deref().unwrap_or_default()))
    }

    pub fn to_request(&self, name: String) -> CreateLaunchTemplateRequest {
        CreateLaunchTemplateRequest {
            name,
            image_id: self.image_id.clone(),
            instance_type: self.instance_type.clone(),
            security_group_ids: self.security_groups.clone(),
            user_data: Some(self.encoded_user_data()),
            iam_instance_profile: self.iam_instance_profile.clone(),
            kernel_id: self.kernel_id.clone(),
            key_name: self.key_name.clone(),
            spot_price: self.spot_price.clone(),
            block_device_mappings: self.block_device_mappings.clone(),
            network_interfaces: self.network_interfaces.clone(),
            ebs_optimized: self.ebs_optimized,
            monitoring: true,
        }
    }
}

/// Scaling parameters of a deploy's group
#[derive(Debug, Clone, PartialEq)]
pub struct FleetGroupSpec {
    pub name: String,
    pub min_size: u32,
    pub max_size: u32,
    pub desired_capacity: Option<u32>,
    pub availability_zones: Vec<String>,
    pub vpc_zone_identifier: Option<String>,
    pub default_cooldown: Option<u32>,
    pub health_check_grace_period: Option<u32>,
    pub health_check_type: Option<String>,
    pub load_balancer_names: Vec<String>,
    pub placement_group: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub launch_template: LaunchTemplateSpec,
}

/// A named deploy with every reference resolved
#[derive(Debug, Clone)]
pub struct Deploy {
    pub name: String,
    pub namespace: Option<String>,
    pub stop_command: Option<String>,
    pub db_config_path: Option<PathBuf>,
    pub migration_command: Option<String>,
    pub instance_live_grace_period: Duration,
    pub app_port: u16,
    pub continue_if_stop_app_fails: bool,
    pub stop_app_retries: u32,
    pub sleep_before_termination: Duration,
    pub post_deploy_command: Option<String>,
    pub live_check: String,
    pub ssl: bool,
    pub log_files: Vec<String>,
    pub tail_logs: bool,
    pub is_alive: IsAliveProbe,
    pub assume_role: Option<String>,
    pub prefer_private_ip: bool,
    pub ssh: Connection,
    pub migration_ssh: Option<Connection>,
    pub local_ssh: Option<Connection>,
    pub fleet_group: FleetGroupSpec,
}

/// `<namespace->name-build`
pub fn resource_name(namespace: Option<&str>, name: &str, build_id: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}-{}-{}", ns, name, build_id),
        _ => format!("{}-{}", name, build_id),
    }
}

/// Prefix `path` with `/` when missing
pub fn normalize_live_check(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

impl Deploy {
    /// Value of the `Deploy` tag on this deploy's groups
    pub fn deploy_tag(&self) -> String {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => format!("{}-{}", ns, self.name),
            _ => self.name.clone(),
        }
    }

    pub fn group_name(&self, build_id: &str) -> String {
        resource_name(self.namespace.as_deref(), &self.fleet_group.name, build_id)
    }

    pub fn launch_template_name(&self, build_id: &str) -> String {
        resource_name(
            self.namespace.as_deref(),
            &self.fleet_group.launch_template.name,
            build_id,
        )
    }

    pub fn live_check_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{}://localhost:{}{}", scheme, self.app_port, self.live_check)
    }

    pub fn migrate(&self) -> bool {
        self.db_config_path.is_some()
    }

    /// Connection used for the migration tunnel
    pub fn migration_ssh_ref(&self) -> &Connection {
        self.migration_ssh.as_ref().unwrap_or(&self.ssh)
    }

    /// Connection printed for interactive logins
    pub fn local_ssh_ref(&self) -> &Connection {
        self.local_ssh.as_ref().unwrap_or(&self.ssh)
    }

    pub fn create_group_request(&self, build_id: &str) -> CreateGroupRequest {
        let spec = &self.fleet_group;
        let mut tags = spec.tags.clone();
        tags.insert(DEPLOY_TAG.to_string(), self.deploy_tag());
        tags.insert(BUILD_ID_TAG.to_string(), build_id.to_string());

        CreateGroupRequest {
            name: self.group_name(build_id),
            launch_template: self.launch_template_name(build_id),
            min_size: spec.min_size,
            max_size: spec.max_size,
            desired_capacity: spec.desired_capacity,
            availability_zones: spec.availability_zones.clone(),
            vpc_zone_identifier: spec.vpc_zone_identifier.clone(),
            default_cooldown: spec.default_cooldown,
            health_check_grace_period: spec.health_check_grace_period,
            health_check_type: spec.health_check_type.clone(),
            load_balancer_names: spec.load_balancer_names.clone(),
            placement_group: spec.placement_group.clone(),
            tags,
        }
    }

    pub fn create_launch_template_request(&self, build_id: &str) -> CreateLaunchTemplateRequest {
        self.fleet_group
            .launch_template
            .to_request(self.launch_template_name(build_id))
    }
}
