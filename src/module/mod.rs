//! Module contract
//!
//! A module is the unit of hot-loadable behavior. Modules are built by the
//! loader through a no-argument constructor, receive a registry handle, and go
//! through `on_load` / `on_pre_unload` / `on_unload`. Background work is
//! wrapped in the module's [`WorkTracker`] so that unload can wait for it.

mod tracker;

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::registry::RegistryHandle;

pub use tracker::WorkTracker;

/// Lifecycle callbacks every module implements.
///
/// Errors and panics from callbacks are contained by the loader and reported
/// through the registry log stream.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Shared base state embedded in the module.
    fn base(&self) -> &ModuleBase;

    /// Called once after construction and handle injection.
    async fn on_load(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when unload begins. Stop accepting new work here; in-flight
    /// work may keep running.
    async fn on_pre_unload(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after all tracked work finished. Release every external
    /// resource and subscription.
    async fn on_unload(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModuleState {
    Created = 0,
    Loaded = 1,
    PreUnloading = 2,
    Draining = 3,
    Unloaded = 4,
}

impl ModuleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Loaded,
            2 => Self::PreUnloading,
            3 => Self::Draining,
            _ => Self::Unloaded,
        }
    }
}

/// State shared by all modules: the registry back-reference, the lifecycle
/// state and the background work tracker.
pub struct ModuleBase {
    registry: RwLock<Option<RegistryHandle>>,
    state: AtomicU8,
    work: WorkTracker,
}

impl ModuleBase {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(None),
            state: AtomicU8::new(ModuleState::Created as u8),
            work: WorkTracker::new(),
        }
    }

    /// Handle to the registry this module is loaded into, if any.
    #[must_use]
    pub fn registry(&self) -> Option<RegistryHandle> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Look up a host capability through the registry.
    #[must_use]
    pub fn capability<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.registry()?.capability::<T>()
    }

    #[must_use]
    pub fn state(&self) -> ModuleState {
        ModuleState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn work(&self) -> &WorkTracker {
        &self.work
    }

    /// Spawn tracked background work. Dropped silently once draining.
    pub fn spawn<F>(&self, work: F) -> Option<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.work.spawn(work)
    }

    /// Run tracked synchronous work. Skipped once draining.
    pub fn run<R>(&self, work: impl FnOnce() -> R) -> Option<R> {
        self.work.run(work)
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.work.is_draining()
    }

    pub(crate) fn set_state(&self, state: ModuleState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Inject the registry handle. Only the first call has an effect.
    pub(crate) fn attach(&self, handle: RegistryHandle) -> bool {
        let mut slot = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(handle);
        true
    }

    pub(crate) fn release(&self) -> Option<RegistryHandle> {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Default for ModuleBase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ModuleBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleBase")
            .field("state", &self.state())
            .field("attached", &self.registry().is_some())
            .field("work", &self.work)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_base_is_detached() {
        let base = ModuleBase::new();
        assert_eq!(base.state(), ModuleState::Created);
        assert!(base.registry().is_none());
        assert!(base.capability::<String>().is_none());
        assert!(!base.is_draining());
    }

    #[test]
    fn test_state_round_trips() {
        let base = ModuleBase::default();
        for state in [
            ModuleState::Loaded,
            ModuleState::PreUnloading,
            ModuleState::Draining,
            ModuleState::Unloaded,
        ] {
            base.set_state(state);
            assert_eq!(base.state(), state);
        }
    }

    #[test]
    fn test_draining_base_skips_work() {
        let base = ModuleBase::new();
        base.work().begin_draining();
        assert!(base.run(|| 1).is_none());
    }
}
