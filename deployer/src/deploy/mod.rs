//! Deploy orchestration

pub mod health;
pub mod migration;
pub mod runner;
pub mod ssh_commands;
pub mod tail;
pub mod workflow;

pub use health::HealthChecker;
pub use migration::{MigrationSession, MigrationTunnel};
pub use runner::Runner;
pub use tail::{LineBuffer, LogTailer, TailScope};
pub use workflow::{Job, Phase, PhaseEvent, RunState, WorkflowFsm};
