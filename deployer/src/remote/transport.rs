//! Transport abstraction over remote shell sessions
//!
//! The orchestrator only talks to these traits. [`crate::remote::openssh`]
//! provides the production implementation; tests plug in in-memory fakes.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::DeployError;

/// A fully resolved remote endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
    pub port: Option<u16>,
    pub connect_timeout: Duration,
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

/// Which output stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => f.write_str("stdout"),
            Stream::Stderr => f.write_str("stderr"),
        }
    }
}

/// Raw output of a streaming command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: Stream,
    pub data: Vec<u8>,
}

/// Collected output of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the remote side did not report a status (killed by signal)
    pub exit_status: Option<i32>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// An open remote shell session
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run a command and collect its output
    async fn exec(&self, command: &str) -> Result<ExecOutput, DeployError>;

    /// Run a command, sending output chunks to `output` as they arrive.
    ///
    /// Returns the exit status once the command finishes. Dropping the future
    /// abandons the remote command.
    async fn exec_streaming(
        &self,
        command: &str,
        output: mpsc::Sender<OutputChunk>,
    ) -> Result<Option<i32>, DeployError>;

    /// Forward `127.0.0.1:local_port` to `remote_host:remote_port` as seen from the remote side
    async fn forward_local(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<(), DeployError>;

    /// Tear down a forward created by [`RemoteSession::forward_local`]
    async fn close_forward(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<(), DeployError>;

    /// Close the session
    async fn close(self: Box<Self>) -> Result<(), DeployError>;
}

/// A tunnel through a jump host
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Open a session to `target` through this gateway
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, DeployError>;

    /// Shut the gateway down
    async fn shutdown(self: Box<Self>) -> Result<(), DeployError>;
}

/// Factory for sessions and gateways
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Open a direct session
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, DeployError>;

    /// Open a gateway through the jump host described by `jump`
    async fn open_gateway(&self, jump: &SshTarget) -> Result<Box<dyn Gateway>, DeployError>;
}
