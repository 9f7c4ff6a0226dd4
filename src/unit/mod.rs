//! Isolated load units
//!
//! A [`LoadedUnit`] owns every module instantiated from one compiled unit and
//! tears them down as a group. Activated modules each hold a lease on the
//! shared [`UnitImage`]; after [`LoadedUnit::detach`] only those leases keep
//! the unit's code alive, and the registry tracks the image weakly until the
//! last lease is gone.

mod manifest;
mod storage;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{panic_to_error, ModuleFault, UnitError};
use crate::module::{Module, ModuleState};
use crate::registry::{ModuleRegistry, RegistryHandle};

pub use manifest::{
    ModuleConstructor, ModuleDescriptor, UnitManifest, UnitManifestFn, UNIT_ABI_VERSION,
    UNIT_MANIFEST_SYMBOL,
};
pub use storage::{
    DependencyManifest, DependencyResolver, DylibStorage, StaticStorage, UnitImage, UnitStorage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    NotLoaded,
    Loaded,
    /// Modules were asked to unload; the unit can never be loaded again.
    Unloaded,
    /// The unit released its own reference to the code.
    Detached,
}

/// A module that finished `on_load`.
///
/// `module` is declared before `lease` so the instance drops while its code
/// is still mapped.
struct ActiveModule {
    type_name: &'static str,
    module: Box<dyn Module>,
    lease: Arc<UnitImage>,
}

/// Run a module callback, turning a panic into an error.
async fn contained<F>(callback: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(callback).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(panic_to_error(payload)),
    }
}

/// Wait for a discarded or unloading module's work, optionally run
/// `on_unload`, then drop it together with its lease.
async fn finalize(unit: String, active: ActiveModule, handle: RegistryHandle, run_unload: bool) {
    let ActiveModule {
        type_name,
        mut module,
        lease,
    } = active;

    module.base().work().all_work_complete().await;
    if run_unload {
        if let Err(cause) = contained(module.on_unload()).await {
            handle.report_fault(
                &unit,
                ModuleFault::UnloadCallbackFailed {
                    module_type: type_name,
                    cause,
                },
            );
        }
    }
    module.base().set_state(ModuleState::Unloaded);
    module.base().release();
    // `type_name` points into the unit's code; last use before the lease goes.
    debug!("Module {} from unit `{}` finalized", type_name, unit);
    drop(module);
    drop(lease);
}

/// One compiled unit and the modules activated from it.
pub struct LoadedUnit {
    name: String,
    id: Uuid,
    source: PathBuf,
    storage: Arc<dyn UnitStorage>,
    modules: Vec<ActiveModule>,
    image: Option<Arc<UnitImage>>,
    state: UnitState,
    loaded_at: Option<DateTime<Utc>>,
}

impl LoadedUnit {
    /// Create a loader for the unit `name` in `storage`. Nothing is read yet.
    pub fn new(name: impl Into<String>, storage: Arc<dyn UnitStorage>) -> Self {
        let name = name.into();
        let source = storage.locate(&name);
        Self {
            name,
            id: Uuid::new_v4(),
            source,
            storage,
            modules: Vec::new(),
            image: None,
            state: UnitState::NotLoaded,
            loaded_at: None,
        }
    }

    /// Unit name as requested from the registry.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity of this incarnation; a reload gets a new one.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Where storage locates the compiled unit.
    #[must_use]
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Current lifecycle state; never returns to `Loaded` once unloaded.
    #[must_use]
    pub fn state(&self) -> UnitState {
        self.state
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.state == UnitState::Loaded
    }

    /// Number of active modules, or `None` unless loaded.
    #[must_use]
    pub fn module_count(&self) -> Option<usize> {
        self.is_loaded().then_some(self.modules.len())
    }

    /// Type names of the active modules in activation order.
    #[must_use]
    pub fn module_types(&self) -> Vec<&'static str> {
        self.modules.iter().map(|m| m.type_name).collect()
    }

    /// When `load_modules` completed.
    #[must_use]
    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }

    /// Open the unit and activate every module candidate in it.
    ///
    /// A module whose constructor or `on_load` fails is logged and skipped.
    /// Returns the number of activated modules. No-op when already loaded.
    pub async fn load_modules(&mut self, registry: &ModuleRegistry) -> Result<usize, UnitError> {
        match self.state {
            UnitState::Loaded => return Ok(self.modules.len()),
            UnitState::Unloaded | UnitState::Detached => return Err(UnitError::Retired),
            UnitState::NotLoaded => {}
        }

        if !self.storage.exists(&self.source) {
            return Err(UnitError::FileNotFound(self.source.clone()));
        }
        let image = Arc::new(self.storage.open(&self.source).map_err(UnitError::Load)?);

        let descriptors = image.manifest().modules.clone();
        for descriptor in descriptors {
            let Some(constructor) = descriptor.candidate() else {
                debug!(
                    "Skipping {} in unit `{}`: not a constructible module",
                    descriptor.type_name, self.name
                );
                continue;
            };
            if let Some(active) = self
                .activate(descriptor.type_name, constructor, &image, registry)
                .await
            {
                self.modules.push(active);
            }
        }

        self.image = Some(image);
        self.state = UnitState::Loaded;
        self.loaded_at = Some(Utc::now());
        Ok(self.modules.len())
    }

    async fn activate(
        &self,
        type_name: &'static str,
        constructor: ModuleConstructor,
        image: &Arc<UnitImage>,
        registry: &ModuleRegistry,
    ) -> Option<ActiveModule> {
        let module = match std::panic::catch_unwind(constructor) {
            Ok(module) => module,
            Err(payload) => {
                registry.report_fault(
                    &self.name,
                    ModuleFault::ConstructorPanicked {
                        module_type: type_name,
                        cause: panic_to_error(payload),
                    },
                );
                return None;
            }
        };

        let mut active = ActiveModule {
            type_name,
            module,
            lease: Arc::clone(image),
        };
        active.module.base().attach(registry.handle());

        match contained(active.module.on_load()).await {
            Ok(()) => {
                active.module.base().set_state(ModuleState::Loaded);
                debug!("Activated module {} from unit `{}`", type_name, self.name);
                Some(active)
            }
            Err(cause) => {
                registry.report_fault(
                    &self.name,
                    ModuleFault::LoadCallbackFailed {
                        module_type: type_name,
                        cause,
                    },
                );
                // Work the module started before failing still runs unit code.
                active.module.base().work().begin_draining();
                registry
                    .finalizers()
                    .spawn(finalize(self.name.clone(), active, registry.handle(), false));
                None
            }
        }
    }

    /// Begin unloading every active module, in activation order.
    ///
    /// Returns once every `on_pre_unload` ran. Waiting for in-flight work and
    /// calling `on_unload` continues in the background. No-op unless loaded.
    pub async fn unload_modules(&mut self, registry: &ModuleRegistry) {
        if self.state != UnitState::Loaded {
            return;
        }
        self.state = UnitState::Unloaded;

        for mut active in std::mem::take(&mut self.modules) {
            let base = active.module.base();
            base.work().begin_draining();
            base.set_state(ModuleState::PreUnloading);

            if let Err(cause) = contained(active.module.on_pre_unload()).await {
                registry.report_fault(
                    &self.name,
                    ModuleFault::PreUnloadCallbackFailed {
                        module_type: active.type_name,
                        cause,
                    },
                );
            }

            active.module.base().set_state(ModuleState::Draining);
            registry
                .finalizers()
                .spawn(finalize(self.name.clone(), active, registry.handle(), true));
        }
    }

    /// Drop this unit's own reference to the code and return a weak handle
    /// for reclamation tracking. Must follow [`unload_modules`](Self::unload_modules).
    pub fn detach(&mut self) -> Result<Weak<UnitImage>, UnitError> {
        match self.state {
            UnitState::Loaded => Err(UnitError::StillLoaded),
            UnitState::NotLoaded | UnitState::Unloaded | UnitState::Detached => {
                let weak = self
                    .image
                    .take()
                    .map(|image| Arc::downgrade(&image))
                    .unwrap_or_default();
                self.state = UnitState::Detached;
                Ok(weak)
            }
        }
    }
}

impl Drop for LoadedUnit {
    fn drop(&mut self) {
        if self.state == UnitState::Loaded && !self.modules.is_empty() {
            warn!(
                "Unit `{}` dropped while {} modules were still loaded",
                self.name,
                self.modules.len()
            );
        }
    }
}

impl std::fmt::Debug for LoadedUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedUnit")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("source", &self.source)
            .field("state", &self.state)
            .field("modules", &self.module_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleBase;
    use crate::services::ServiceCollection;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    static UNLOADS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Default)]
    struct Counter {
        base: ModuleBase,
    }

    #[async_trait]
    impl Module for Counter {
        fn base(&self) -> &ModuleBase {
            &self.base
        }

        async fn on_unload(&mut self) -> anyhow::Result<()> {
            UNLOADS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Faulty {
        base: ModuleBase,
    }

    #[async_trait]
    impl Module for Faulty {
        fn base(&self) -> &ModuleBase {
            &self.base
        }

        async fn on_load(&mut self) -> anyhow::Result<()> {
            anyhow::bail!("cannot start")
        }
    }

    fn fixture() -> (ModuleRegistry, Arc<dyn UnitStorage>) {
        let storage = StaticStorage::new();
        storage.insert("counter", || {
            UnitManifest::new(vec![
                ModuleDescriptor::abstract_type("Base"),
                ModuleDescriptor::concrete::<Counter>(),
                ModuleDescriptor::concrete::<Faulty>(),
                ModuleDescriptor::without_constructor("NeedsArgs"),
            ])
        });
        let storage: Arc<dyn UnitStorage> = Arc::new(storage);
        let registry = ModuleRegistry::new(Arc::clone(&storage), Arc::new(ServiceCollection::new()));
        (registry, storage)
    }

    #[tokio::test]
    async fn test_load_skips_non_candidates_and_failures() {
        let (registry, storage) = fixture();
        let mut unit = LoadedUnit::new("counter", storage);
        assert_eq!(unit.state(), UnitState::NotLoaded);
        assert_eq!(unit.module_count(), None);

        let count = unit.load_modules(&registry).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(unit.module_types(), vec!["Counter"]);
        assert!(unit.loaded_at().is_some());

        // Loading again is a no-op.
        assert_eq!(unit.load_modules(&registry).await.unwrap(), 1);

        unit.unload_modules(&registry).await;
        unit.detach().unwrap();
    }

    #[tokio::test]
    async fn test_missing_unit() {
        let (registry, storage) = fixture();
        let mut unit = LoadedUnit::new("absent", storage);
        match unit.load_modules(&registry).await {
            Err(UnitError::FileNotFound(path)) => assert!(path.ends_with("absent")),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(unit.state(), UnitState::NotLoaded);
    }

    #[tokio::test]
    async fn test_unload_is_idempotent_and_final() {
        let (registry, storage) = fixture();
        let mut unit = LoadedUnit::new("counter", storage);
        unit.load_modules(&registry).await.unwrap();

        let before = UNLOADS.load(Ordering::SeqCst);
        unit.unload_modules(&registry).await;
        unit.unload_modules(&registry).await;
        assert_eq!(unit.state(), UnitState::Unloaded);
        assert_eq!(unit.module_count(), None);

        tokio::time::timeout(Duration::from_secs(1), async {
            while UNLOADS.load(Ordering::SeqCst) < before + 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("on_unload should run");

        assert!(matches!(
            unit.load_modules(&registry).await,
            Err(UnitError::Retired)
        ));
    }

    #[tokio::test]
    async fn test_detach_requires_unload() {
        let (registry, storage) = fixture();
        let mut unit = LoadedUnit::new("counter", storage);
        unit.load_modules(&registry).await.unwrap();
        assert!(matches!(unit.detach(), Err(UnitError::StillLoaded)));

        unit.unload_modules(&registry).await;
        let weak = unit.detach().unwrap();
        assert_eq!(unit.state(), UnitState::Detached);

        registry.finalizers().close();
        registry.finalizers().wait().await;
        assert_eq!(weak.strong_count(), 0);
    }
}
