//! Tunnel Switch - shares serial DCEs among several DTE terminals.
//!
//! The binary reads a config describing serial endpoints and tunnels, opens
//! each endpoint through [`serial::DeviceOpener`] and runs every tunnel with a
//! single monitor session shared by all of them.

pub mod config;
pub mod console;
pub mod serial;
pub mod system;

pub use config::{ConfigError, FileConfig, load_config};
pub use system::{System, SystemError};
