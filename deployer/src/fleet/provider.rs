//! Fleet provider trait

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use fleet_api::{
    CreateGroupRequest, CreateLaunchTemplateRequest, FleetGroup, Instance, LaunchTemplate, Page,
};

use crate::errors::DeployError;

/// Typed access to the cloud fleet API
#[async_trait]
pub trait FleetProvider: Send + Sync {
    /// One page of scaling groups; `None` requests the first page
    async fn list_groups(&self, next_token: Option<&str>) -> Result<Page<FleetGroup>, DeployError>;

    async fn describe_group(&self, name: &str) -> Result<Option<FleetGroup>, DeployError>;

    async fn create_group(&self, request: &CreateGroupRequest) -> Result<FleetGroup, DeployError>;

    async fn delete_group(&self, name: &str, force: bool) -> Result<(), DeployError>;

    async fn list_instances(&self, group: &str) -> Result<Vec<Instance>, DeployError>;

    async fn describe_instance(&self, id: &str) -> Result<Option<Instance>, DeployError>;

    async fn list_launch_templates(
        &self,
        next_token: Option<&str>,
    ) -> Result<Page<LaunchTemplate>, DeployError>;

    async fn create_launch_template(
        &self,
        request: &CreateLaunchTemplateRequest,
    ) -> Result<LaunchTemplate, DeployError>;

    async fn delete_launch_template(&self, name: &str) -> Result<(), DeployError>;

    /// A provider acting under `role_arn`.
    ///
    /// `self` keeps its own credentials, so concurrent deploys holding it
    /// are unaffected.
    async fn assume_role(
        &self,
        role_arn: &str,
        session_name: &str,
    ) -> Result<Arc<dyn FleetProvider>, DeployError>;
}

/// Every scaling group, following continuation tokens in order
pub async fn all_groups(provider: &dyn FleetProvider) -> Result<Vec<FleetGroup>, DeployError> {
    let mut groups = Vec::new();
    let mut next_token: Option<String> = None;
    loop {
        let page = provider.list_groups(next_token.as_deref()).await?;
        debug!("Fetched {} groups", page.items.len());
        groups.extend(page.items);
        match page.next_token.filter(|t| !t.is_empty()) {
            Some(token) => next_token = Some(token),
            None => return Ok(groups),
        }
    }
}

/// Every launch template, following continuation tokens in order
pub async fn all_launch_templates(
    provider: &dyn FleetProvider,
) -> Result<Vec<LaunchTemplate>, DeployError> {
    let mut templates = Vec::new();
    let mut next_token: Option<String> = None;
    loop {
        let page = provider.list_launch_templates(next_token.as_deref()).await?;
        templates.extend(page.items);
        match page.next_token.filter(|t| !t.is_empty()) {
            Some(token) => next_token = Some(token),
            None => return Ok(templates),
        }
    }
}

pub async fn group_exists(provider: &dyn FleetProvider, name: &str) -> Result<bool, DeployError> {
    Ok(provider.describe_group(name).await?.is_some())
}

pub async fn launch_template_exists(
    provider: &dyn FleetProvider,
    name: &str,
) -> Result<bool, DeployError> {
    Ok(all_launch_templates(provider)
        .await?
        .iter()
        .any(|t| t.name == name))
}
