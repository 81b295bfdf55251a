//! pw-core: Core abstractions and configuration for portwarden
//!
//! This crate provides the configuration structures, the error taxonomy and
//! the network-interface lookup shared by the supervisor components.

pub mod config;
pub mod error;
pub mod netif;

pub use error::{ConfigError, InterfaceError, PwError, RemoteError, SettingsError};
pub use netif::{AddressResolver, SystemResolver};
