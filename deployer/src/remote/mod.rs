//! Remote shell access to fleet instances

pub mod connection;
pub mod openssh;
pub mod transport;

pub use connection::{Connection, JumpHost, Target};
pub use transport::{ExecOutput, Gateway, OutputChunk, RemoteSession, RemoteTransport, SshTarget, Stream};
