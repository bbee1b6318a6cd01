//! Interactive login commands for a deploy's instances

use tokio::process::Command;
use tracing::info;

use fleet_api::Instance;

use crate::config::Deploy;
use crate::errors::DeployError;
use crate::fleet::provider::all_groups;
use crate::fleet::{FleetProvider, FleetSelector};
use crate::remote::Connection;

/// `ssh` invocation reaching `instance` through `connection`
pub fn ssh_command(connection: &Connection, instance: &Instance) -> Result<String, DeployError> {
    let host = instance
        .address(connection.prefer_private_ip)
        .ok_or_else(|| DeployError::NotFound(format!("instance {} has no address", instance.id)))?;

    let mut command =
        String::from("ssh -o 'UserKnownHostsFile=/dev/null' -o 'StrictHostKeyChecking=no' ");
    if let Some(jump) = &connection.jump {
        command.push_str("-o 'ProxyCommand=ssh -W %h:%p ");
        if let Some(user) = jump.user.as_ref().or(connection.user.as_ref()) {
            command.push_str(user);
            command.push('@');
        }
        command.push_str(&jump.host);
        command.push_str("' ");
    }
    if let Some(port) = connection.port {
        command.push_str(&format!("-p {} ", port));
    }
    if let Some(user) = connection.user.as_deref().filter(|u| !u.is_empty()) {
        command.push_str(user);
        command.push('@');
    }
    command.push_str(host);
    Ok(command)
}

/// One login command per running instance of the deploy's newest group
pub async fn ssh_commands(
    provider: &dyn FleetProvider,
    deploy: &Deploy,
) -> Result<Vec<String>, DeployError> {
    let groups = all_groups(provider).await?;
    let tag = deploy.deploy_tag();
    let group = FleetSelector::new(&tag, "")
        .latest(&groups)
        .ok_or_else(|| {
            DeployError::NotFound(format!(
                "Could not find any fleet groups for this deploy ({})",
                deploy.name
            ))
        })?;
    info!("[{}] found group: {}", deploy.name, group.name);

    let connection = deploy.local_ssh_ref();
    let commands = provider
        .list_instances(&group.name)
        .await?
        .iter()
        .filter(|i| i.is_running() && i.address(connection.prefer_private_ip).is_some())
        .map(|i| ssh_command(connection, i))
        .collect::<Result<Vec<_>, _>>()?;

    if commands.is_empty() {
        return Err(DeployError::NotFound(format!(
            "Could not find any instances for fleet group {}",
            group.name
        )));
    }
    Ok(commands)
}

/// Run a printed login command attached to the terminal
pub async fn run_ssh_command(command: &str) -> Result<i32, DeployError> {
    let status = Command::new("sh").arg("-c").arg(command).status().await?;
    Ok(status.code().unwrap_or(1))
}
