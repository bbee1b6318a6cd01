//! Database settings used by migrations
//!
//! The database file is YAML keyed by runtime environment. Values may
//! reference process environment variables as `${NAME}` or
//! `${NAME:-default}`; references are substituted before parsing.

use std::collections::BTreeMap;
use std::path::Path;

use regex::{Captures, Regex};
use serde::Deserialize;

use crate::errors::DeployError;
use crate::filesys::file::File;

/// Connection settings for one environment
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub adapter: Option<String>,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl DatabaseConfig {
    fn is_postgres(&self) -> bool {
        self.adapter
            .as_deref()
            .map(|a| a.starts_with("postg"))
            .unwrap_or(false)
    }

    /// Port on the database host, defaulted from the adapter
    pub fn remote_port(&self) -> u16 {
        self.port
            .unwrap_or(if self.is_postgres() { 5432 } else { 3306 })
    }

    /// URL pointing at the local end of a forwarded port
    pub fn local_url(&self, local_port: u16) -> Result<String, DeployError> {
        let scheme = if self.is_postgres() { "postgres" } else { "mysql" };
        let mut url = url::Url::parse(&format!("{}://127.0.0.1:{}/", scheme, local_port))
            .map_err(|e| DeployError::Internal(e.to_string()))?;

        let invalid = |field: &str| DeployError::ConfigError(format!("invalid database {field}"));
        if let Some(username) = &self.username {
            url.set_username(username).map_err(|_| invalid("username"))?;
        }
        if let Some(password) = &self.password {
            url.set_password(Some(password)).map_err(|_| invalid("password"))?;
        }
        if let Some(database) = &self.database {
            url.set_path(database);
        }
        Ok(url.to_string())
    }

    /// Environment handed to the migration process
    pub fn child_env(
        &self,
        local_port: u16,
        environment: &str,
    ) -> Result<Vec<(String, String)>, DeployError> {
        let mut env = vec![
            ("DATABASE_URL".to_string(), self.local_url(local_port)?),
            ("DB_HOST".to_string(), "127.0.0.1".to_string()),
            ("DB_PORT".to_string(), local_port.to_string()),
            (crate::deploy::migration::ENVIRONMENT_VAR.to_string(), environment.to_string()),
        ];
        if let Some(database) = &self.database {
            env.push(("DB_NAME".to_string(), database.clone()));
        }
        if let Some(username) = &self.username {
            env.push(("DB_USER".to_string(), username.clone()));
        }
        if let Some(password) = &self.password {
            env.push(("DB_PASSWORD".to_string(), password.clone()));
        }
        Ok(env)
    }
}

/// Substitute `${NAME}` and `${NAME:-default}` references
pub fn render<F>(text: &str, lookup: F) -> Result<String, DeployError>
where
    F: Fn(&str) -> Option<String>,
{
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .map_err(|e| DeployError::Internal(e.to_string()))?;

    let mut missing = Vec::new();
    let rendered = pattern.replace_all(text, |caps: &Captures<'_>| {
        let name = &caps[1];
        match (lookup(name), caps.get(2)) {
            (Some(value), _) => value,
            (None, Some(default)) => default.as_str().to_string(),
            (None, None) => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(DeployError::ConfigError(format!(
            "database config references unset variables: {}",
            missing.join(", ")
        )));
    }
    Ok(rendered.into_owned())
}

/// Pick the block for `environment` out of a rendered database file
pub fn parse(text: &str, environment: &str) -> Result<DatabaseConfig, DeployError> {
    let mut blocks: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(text)?;
    let block = blocks.remove(environment).ok_or_else(|| {
        DeployError::ConfigError(format!("database config has no '{}' section", environment))
    })?;
    Ok(serde_yaml::from_value(block)?)
}

/// Read, render and parse the database file
pub async fn load(path: &Path, environment: &str) -> Result<DatabaseConfig, DeployError> {
    let text = File::new(path).read_string().await?;
    let rendered = render(&text, |name| std::env::var(name).ok())?;
    parse(&rendered, environment)
}
