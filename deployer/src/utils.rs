//! Utility functions

use std::net::{Ipv4Addr, TcpListener};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::errors::DeployError;

/// Build identifier used when the working tree is not a git checkout
pub const UNKNOWN_BUILD: &str = "unknown";

/// Version information for the binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("FLEETROLL_GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("FLEETROLL_BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Short sha of the commit checked out in the current directory
pub async fn current_build_id() -> String {
    let output = Command::new("git")
        .args(["rev-parse", "--short=7", "HEAD"])
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => {
            let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if sha.is_empty() {
                UNKNOWN_BUILD.to_string()
            } else {
                sha
            }
        }
        Ok(output) => {
            debug!("git rev-parse exited with {}", output.status);
            UNKNOWN_BUILD.to_string()
        }
        Err(e) => {
            debug!("Unable to run git: {}", e);
            UNKNOWN_BUILD.to_string()
        }
    }
}

/// Ask the OS for a free loopback port.
///
/// The listener is closed again before returning, so the port is only
/// likely (not guaranteed) to still be free when it is used.
pub fn random_open_port() -> Result<u16, DeployError> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    Ok(port)
}

/// Quote a value for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-:=@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Remove the indentation shared by every non-blank line
pub fn strip_indent(text: &str) -> String {
    let indent = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);

    text.lines()
        .map(|line| line.get(indent..).unwrap_or_else(|| line.trim_start()))
        .collect::<Vec<_>>()
        .join("\n")
}
