//! fleetroll library
//!
//! Rolling replacement of scaling-group backed fleets: migrate, provision a
//! group for the current build, wait for it to become healthy, stop the app
//! on the previous fleet and tear it down.

pub mod config;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod fleet;
pub mod logs;
pub mod remote;
pub mod utils;
