//! Cogworks - a host that hot-loads and unloads modules from compiled units
//!
//! Units are loaded into their own isolation scope, their modules are
//! activated, and on unload every module is drained of in-flight work before
//! the unit's code is released.
//!
//! # Modules
//!
//! - [`module`]: The module contract and its background work tracker
//! - [`unit`]: Isolated load units, manifests and unit storage
//! - [`registry`]: Catalog of loaded units and reclamation tracking
//! - [`services`]: Host capabilities shared with modules
//! - [`admin`]: Operator command parsing
//! - [`host`]: Process wiring around the registry
//! - [`config`]: Configuration management and serialization

pub mod admin;
pub mod config;
pub mod error;
pub mod host;
pub mod module;
pub mod registry;
pub mod services;
pub mod unit;

pub use error::{LoadError, ModuleFault, UnitError, UnloadError};
pub use module::{Module, ModuleBase, ModuleState, WorkTracker};
pub use registry::{LogEntry, ModuleRegistry, RegistryHandle, Severity};
pub use services::{CapabilityProvider, ServiceCollection};
pub use unit::{
    DylibStorage, LoadedUnit, ModuleDescriptor, StaticStorage, UnitManifest, UnitStorage,
};

/// Re-exported for `#[async_trait]` on module implementations.
pub use async_trait::async_trait;

// Native units must use the runtime crates through these paths so that they
// link the host's copy instead of their own.
pub use anyhow;
pub use tokio;
