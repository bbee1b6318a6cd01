//! HTTP fleet provider client

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error, info};

use fleet_api::{
    AssumeRoleRequest, AssumeRoleResponse, CreateGroupRequest, CreateLaunchTemplateRequest,
    FleetGroup, Instance, InstanceList, LaunchTemplate, Page,
};

use crate::errors::DeployError;
use crate::fleet::provider::FleetProvider;

/// Environment variable holding the API bearer token
pub const TOKEN_ENV_VAR: &str = "FLEET_API_TOKEN";

/// JSON-over-HTTP client for the fleet provider API
pub struct HttpFleetProvider {
    client: Client,
    base_url: String,
    token: Option<SecretString>,
}

impl HttpFleetProvider {
    /// Create a new client
    pub fn new(base_url: &str, token: Option<SecretString>) -> Result<Self, DeployError> {
        url::Url::parse(base_url)
            .map_err(|e| DeployError::ConfigError(format!("invalid provider url {base_url}: {e}")))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Create a client using the token from the environment
    pub fn from_env(base_url: &str) -> Result<Self, DeployError> {
        let token = std::env::var(TOKEN_ENV_VAR).ok().map(SecretString::from);
        Self::new(base_url, token)
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);

        let request = self.client.request(method, &url);
        match &self.token {
            Some(token) => request.header(
                header::AUTHORIZATION,
                format!("Bearer {}", token.expose_secret()),
            ),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(request: RequestBuilder) -> Result<Option<T>, DeployError> {
        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Provider request failed: {} - {}", status, body);
            return Err(DeployError::ProviderError(format!("{}: {}", status, body)));
        }

        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(Some(serde_json::from_value(serde_json::Value::Null)?));
        }
        Ok(Some(serde_json::from_slice(&body)?))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, DeployError> {
        Self::send(self.request(Method::GET, path)).await
    }

    async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, DeployError> {
        let request = self.request(Method::POST, path).json(body);
        Self::send(request)
            .await?
            .ok_or_else(|| DeployError::ProviderError(format!("POST {path}: not found")))
    }

    async fn delete(&self, path: &str) -> Result<(), DeployError> {
        let request = self.request(Method::DELETE, path);
        let deleted: Option<serde_json::Value> = Self::send(request).await?;
        deleted
            .map(|_| ())
            .ok_or_else(|| DeployError::ProviderError(format!("DELETE {path}: not found")))
    }
}

fn page_query(next_token: Option<&str>) -> String {
    match next_token {
        Some(token) => {
            let escaped: String = url::form_urlencoded::byte_serialize(token.as_bytes()).collect();
            format!("?next_token={}", escaped)
        }
        None => String::new(),
    }
}

#[async_trait]
impl FleetProvider for HttpFleetProvider {
    async fn list_groups(&self, next_token: Option<&str>) -> Result<Page<FleetGroup>, DeployError> {
        let path = format!("/groups{}", page_query(next_token));
        Ok(self.get(&path).await?.unwrap_or_else(|| Page::last(vec![])))
    }

    async fn describe_group(&self, name: &str) -> Result<Option<FleetGroup>, DeployError> {
        self.get(&format!("/groups/{}", name)).await
    }

    async fn create_group(&self, request: &CreateGroupRequest) -> Result<FleetGroup, DeployError> {
        self.post("/groups", request).await
    }

    async fn delete_group(&self, name: &str, force: bool) -> Result<(), DeployError> {
        self.delete(&format!("/groups/{}?force={}", name, force)).await
    }

    async fn list_instances(&self, group: &str) -> Result<Vec<Instance>, DeployError> {
        let list: Option<InstanceList> = self.get(&format!("/groups/{}/instances", group)).await?;
        list.map(|l| l.instances)
            .ok_or_else(|| DeployError::ProviderError(format!("group {group} not found")))
    }

    async fn describe_instance(&self, id: &str) -> Result<Option<Instance>, DeployError> {
        self.get(&format!("/instances/{}", id)).await
    }

    async fn list_launch_templates(
        &self,
        next_token: Option<&str>,
    ) -> Result<Page<LaunchTemplate>, DeployError> {
        let path = format!("/launch-templates{}", page_query(next_token));
        Ok(self.get(&path).await?.unwrap_or_else(|| Page::last(vec![])))
    }

    async fn create_launch_template(
        &self,
        request: &CreateLaunchTemplateRequest,
    ) -> Result<LaunchTemplate, DeployError> {
        self.post("/launch-templates", request).await
    }

    async fn delete_launch_template(&self, name: &str) -> Result<(), DeployError> {
        self.delete(&format!("/launch-templates/{}", name)).await
    }

    async fn assume_role(
        &self,
        role_arn: &str,
        session_name: &str,
    ) -> Result<Arc<dyn FleetProvider>, DeployError> {
        info!("Assuming role {}", role_arn);
        let body = AssumeRoleRequest {
            role_arn: role_arn.to_string(),
            role_session_name: session_name.to_string(),
        };
        let response: AssumeRoleResponse = self.post("/sts/assume-role", &body).await?;
        Ok(Arc::new(Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: Some(SecretString::from(response.session_token)),
        }))
    }
}
