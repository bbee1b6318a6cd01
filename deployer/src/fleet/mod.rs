//! Fleet provider access and group selection

pub mod http;
pub mod provider;
pub mod selector;

pub use provider::FleetProvider;
pub use selector::FleetSelector;
