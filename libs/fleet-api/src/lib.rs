//! Fleet provider API models
//!
//! Wire types shared by the provider client and the deploy orchestrator.

pub mod models;

pub use models::*;
