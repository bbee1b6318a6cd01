//! SSH transport backed by the system `ssh` client
//!
//! Sessions are control-master connections driven through the `openssh`
//! crate's native mux client, which gives us command execution, streaming
//! output and local port forwarding over a single authenticated channel.

use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use openssh::{ForwardType, KnownHosts, Session, SessionBuilder, Socket, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::errors::DeployError;
use crate::remote::transport::{
    ExecOutput, Gateway, OutputChunk, RemoteSession, RemoteTransport, SshTarget, Stream,
};

/// Production transport
#[derive(Debug, Clone)]
pub struct OpensshTransport {
    known_hosts: KnownHosts,
}

impl OpensshTransport {
    pub fn new() -> Self {
        Self {
            // Fleet instances are ephemeral; their host keys are never known ahead of time
            known_hosts: KnownHosts::Accept,
        }
    }

    pub fn with_known_hosts(known_hosts: KnownHosts) -> Self {
        Self { known_hosts }
    }

    fn builder(&self, target: &SshTarget) -> SessionBuilder {
        let mut builder = SessionBuilder::default();
        builder
            .user(target.user.clone())
            .known_hosts_check(self.known_hosts.clone())
            .connect_timeout(target.connect_timeout);
        if let Some(port) = target.port {
            builder.port(port);
        }
        builder
    }
}

impl Default for OpensshTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteTransport for OpensshTransport {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, DeployError> {
        let session = self.builder(target).connect_mux(&target.host).await?;
        Ok(Box::new(OpensshSession { session }))
    }

    async fn open_gateway(&self, jump: &SshTarget) -> Result<Box<dyn Gateway>, DeployError> {
        // Holding a session to the jump host verifies it is reachable and keeps
        // the agent forwarding path warm for the tunneled connections.
        let session = self.builder(jump).connect_mux(&jump.host).await?;
        Ok(Box::new(OpensshGateway {
            transport: self.clone(),
            jump: jump.clone(),
            session,
        }))
    }
}

struct OpensshGateway {
    transport: OpensshTransport,
    jump: SshTarget,
    session: Session,
}

#[async_trait]
impl Gateway for OpensshGateway {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, DeployError> {
        let mut builder = self.transport.builder(target);
        builder.jump_hosts([format!("{}@{}", self.jump.user, self.jump.host)]);
        let session = builder.connect_mux(&target.host).await?;
        Ok(Box::new(OpensshSession { session }))
    }

    async fn shutdown(self: Box<Self>) -> Result<(), DeployError> {
        self.session.close().await?;
        Ok(())
    }
}

struct OpensshSession {
    session: Session,
}

#[async_trait]
impl RemoteSession for OpensshSession {
    async fn exec(&self, command: &str) -> Result<ExecOutput, DeployError> {
        debug!("exec: {}", command);
        let output = self.session.raw_command(command).output().await?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_status: output.status.code(),
        })
    }

    async fn exec_streaming(
        &self,
        command: &str,
        output: mpsc::Sender<OutputChunk>,
    ) -> Result<Option<i32>, DeployError> {
        debug!("exec (streaming): {}", command);
        let mut cmd = self.session.raw_command(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().await?;

        let stdout = child.stdout().take();
        let stderr = child.stderr().take();
        tokio::try_join!(
            pump(stdout, Stream::Stdout, output.clone()),
            pump(stderr, Stream::Stderr, output),
        )?;

        let status = child.wait().await?;
        Ok(status.code())
    }

    async fn forward_local(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<(), DeployError> {
        let listen = SocketAddr::from((Ipv4Addr::LOCALHOST, local_port));
        self.session
            .request_port_forward(
                ForwardType::Local,
                listen,
                Socket::new(remote_host, remote_port),
            )
            .await?;
        Ok(())
    }

    async fn close_forward(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<(), DeployError> {
        let listen = SocketAddr::from((Ipv4Addr::LOCALHOST, local_port));
        self.session
            .close_port_forward(
                ForwardType::Local,
                listen,
                Socket::new(remote_host, remote_port),
            )
            .await?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), DeployError> {
        self.session.close().await?;
        Ok(())
    }
}

async fn pump<R>(
    reader: Option<R>,
    stream: Stream,
    output: mpsc::Sender<OutputChunk>,
) -> Result<(), DeployError>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(());
    };

    let mut buf = [0u8; 4096];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let chunk = OutputChunk {
            stream,
            data: buf[..n].to_vec(),
        };
        if output.send(chunk).await.is_err() {
            // Receiver is gone; nobody wants the rest
            return Ok(());
        }
    }
}
