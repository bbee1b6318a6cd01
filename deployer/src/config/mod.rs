//! Deploy configuration

pub mod database;
pub mod deploy;
pub mod registry;

pub use deploy::{AliveProbe, Deploy, FleetGroupSpec, IsAliveProbe, LaunchTemplateSpec};
pub use registry::{Env, Registry, RegistryFile};
