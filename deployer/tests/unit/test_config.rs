//! Deploy file loading tests

use std::io::Write;
use std::time::Duration;

use tempfile::NamedTempFile;

use fleetroll::config::{IsAliveProbe, Registry};
use fleetroll::errors::DeployError;

use crate::support::{deploy_file, registry_from};

fn build(file: serde_json::Value) -> Result<Registry, DeployError> {
    Registry::build(serde_json::from_value(file).unwrap())
}

#[tokio::test]
async fn test_load_applies_defaults() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(deploy_file().to_string().as_bytes()).unwrap();

    let registry = Registry::load(file.path()).await.unwrap();
    assert_eq!(registry.deploy_names(), vec!["app", "worker"]);

    let worker = registry.deploy("worker").unwrap();
    assert_eq!(worker.instance_live_grace_period, Duration::from_secs(30 * 60));
    assert_eq!(worker.stop_app_retries, 2);
    assert_eq!(worker.sleep_before_termination, Duration::from_secs(20));
    assert_eq!(worker.app_port, 80);
    assert_eq!(worker.live_check, "/");
    assert_eq!(worker.log_files, vec!["/var/log/syslog".to_string()]);
    assert!(!worker.ssl);
    assert!(!worker.tail_logs);
    assert!(!worker.continue_if_stop_app_fails);
    assert!(!worker.migrate());
    assert!(matches!(worker.is_alive, IsAliveProbe::None));
    assert_eq!(worker.ssh.connect_timeout(), Duration::from_secs(20));
}

#[tokio::test]
async fn test_missing_file_is_not_found() {
    let err = Registry::load("/nonexistent/fleetroll.json").await.unwrap_err();
    assert!(matches!(err, DeployError::NotFound(_)));
}

#[test]
fn test_live_check_is_normalized() {
    let mut file = deploy_file();
    file["deploys"]["app"]["live_check"] = "health".into();
    file["deploys"]["app"]["ssl"] = true.into();
    file["deploys"]["app"]["app_port"] = 8443.into();

    let registry = registry_from(file);
    let app = registry.deploy("app").unwrap();
    assert_eq!(app.live_check, "/health");
    assert_eq!(app.live_check_url(), "https://localhost:8443/health");
}

#[test]
fn test_connections_are_resolved() {
    let registry = registry_from(deploy_file());
    let app = registry.deploy("app").unwrap();
    assert_eq!(app.ssh.name, "app");
    assert_eq!(app.migration_ssh_ref().name, "db");
    assert_eq!(app.local_ssh_ref().name, "app");
    assert_eq!(
        registry.deploy_for_fleet_group("worker-group").unwrap().name,
        "worker"
    );
    assert_eq!(registry.env("production").unwrap().deploys.len(), 2);
}

#[test]
fn test_unknown_references_are_rejected() {
    let mut file = deploy_file();
    file["deploys"]["app"]["ssh"] = "nope".into();
    assert!(matches!(build(file), Err(DeployError::ConfigError(_))));

    let mut file = deploy_file();
    file["fleet_groups"]["web-group"]["launch_template"] = "nope".into();
    assert!(matches!(build(file), Err(DeployError::ConfigError(_))));

    let mut file = deploy_file();
    file["envs"]["production"]["deploys"] = serde_json::json!(["app", "nope"]);
    assert!(matches!(build(file), Err(DeployError::ConfigError(_))));
}

#[test]
fn test_fleet_group_constraints() {
    let mut file = deploy_file();
    file["fleet_groups"]["web-group"]["min_size"] = 5.into();
    assert!(matches!(build(file), Err(DeployError::ConfigError(_))));

    let mut file = deploy_file();
    file["fleet_groups"]["web-group"]["availability_zones"] = serde_json::json!([]);
    assert!(matches!(build(file), Err(DeployError::ConfigError(_))));

    let mut file = deploy_file();
    file["deploys"]["worker"]["fleet_group"] = "web-group".into();
    assert!(matches!(build(file), Err(DeployError::ConfigError(_))));
}
