//! Module registry
//!
//! Process-wide catalog of loaded units. Load and unload decisions for a name
//! are made under one lock together with a per-name reservation, so two
//! concurrent callers can never both win the same name. Detached units are
//! tracked weakly until their code has actually been released.

mod log;

use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use uuid::Uuid;

use crate::error::{LoadError, ModuleFault, UnitError, UnloadError};
use crate::services::{self, CapabilityProvider};
use crate::unit::{LoadedUnit, UnitImage, UnitStorage};

pub use log::{LogEntry, Severity};

const SOURCE: &str = "ModuleRegistry";

/// Default capacity of the log event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

static UNIT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").expect("valid unit name regex"));

/// Unit names map straight onto file names, so they may not escape the
/// units directory.
#[must_use]
pub fn is_valid_unit_name(name: &str) -> bool {
    UNIT_NAME.is_match(name) && !name.contains("..")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Loading,
    Unloading,
}

/// A detached unit waiting for its last lease to go away.
struct DetachedUnit {
    id: Uuid,
    image: Weak<UnitImage>,
    detached_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryState {
    loaded: HashMap<String, LoadedUnit>,
    unloading: HashMap<String, DetachedUnit>,
    in_transition: HashMap<String, Transition>,
}

pub(crate) struct RegistryShared {
    storage: Arc<dyn UnitStorage>,
    capabilities: Arc<dyn CapabilityProvider>,
    state: Mutex<RegistryState>,
    events: broadcast::Sender<LogEntry>,
    finalizers: TaskTracker,
}

impl RegistryShared {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log(&self, entry: LogEntry) {
        entry.trace();
        // No subscribers is fine; lagging ones lose the oldest entries.
        let _ = self.events.send(entry);
    }
}

/// Clears a name's in-transition marker unless finished explicitly, so a
/// failed load or unload never wedges the name.
struct Reservation {
    shared: Arc<RegistryShared>,
    name: String,
    armed: bool,
}

impl Reservation {
    fn finish(mut self, apply: impl FnOnce(&mut RegistryState)) {
        let mut state = self.shared.lock();
        state.in_transition.remove(&self.name);
        apply(&mut state);
        self.armed = false;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            self.shared.lock().in_transition.remove(&self.name);
        }
    }
}

/// Snapshot of a loaded unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    pub name: String,
    pub id: Uuid,
    pub source: PathBuf,
    /// Owned copies: type names of native units live in the unit's code.
    pub modules: Vec<String>,
    pub loaded_at: Option<DateTime<Utc>>,
}

/// Snapshot of a unit awaiting reclamation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReclamation {
    pub name: String,
    pub id: Uuid,
    pub detached_at: DateTime<Utc>,
    pub live_leases: usize,
}

/// Catalog of loaded units. Cloning shares the same registry.
#[derive(Clone)]
pub struct ModuleRegistry {
    shared: Arc<RegistryShared>,
}

/// Non-owning registry reference handed to modules.
#[derive(Clone)]
pub struct RegistryHandle {
    shared: Weak<RegistryShared>,
}

impl RegistryHandle {
    /// The registry, while it still exists.
    #[must_use]
    pub fn registry(&self) -> Option<ModuleRegistry> {
        self.shared.upgrade().map(|shared| ModuleRegistry { shared })
    }

    /// Look up a host capability; `None` once the registry is gone.
    #[must_use]
    pub fn capability<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let shared = self.shared.upgrade()?;
        services::lookup::<T>(shared.capabilities.as_ref())
    }

    /// Publish a log entry on the registry's stream.
    pub fn log(&self, entry: LogEntry) {
        match self.shared.upgrade() {
            Some(shared) => shared.log(entry),
            None => entry.trace(),
        }
    }

    pub(crate) fn report_fault(&self, unit: &str, fault: ModuleFault) {
        self.log(LogEntry::fault(unit, &fault));
    }
}

impl std::fmt::Debug for RegistryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryHandle")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

impl ModuleRegistry {
    /// Registry reading units from `storage` and handing `capabilities` to
    /// every module.
    pub fn new(storage: Arc<dyn UnitStorage>, capabilities: Arc<dyn CapabilityProvider>) -> Self {
        Self::with_event_capacity(storage, capabilities, DEFAULT_EVENT_CAPACITY)
    }

    /// Like [`new`](Self::new) with a custom log stream capacity.
    pub fn with_event_capacity(
        storage: Arc<dyn UnitStorage>,
        capabilities: Arc<dyn CapabilityProvider>,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            shared: Arc::new(RegistryShared {
                storage,
                capabilities,
                state: Mutex::new(RegistryState::default()),
                events,
                finalizers: TaskTracker::new(),
            }),
        }
    }

    /// Non-owning handle, as injected into modules.
    #[must_use]
    pub fn handle(&self) -> RegistryHandle {
        RegistryHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    #[must_use]
    pub fn capabilities(&self) -> Arc<dyn CapabilityProvider> {
        Arc::clone(&self.shared.capabilities)
    }

    /// Stream of log entries raised while loading and unloading units.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.shared.events.subscribe()
    }

    /// Publish `entry` to subscribers and `tracing`.
    pub fn log(&self, entry: LogEntry) {
        self.shared.log(entry);
    }

    pub(crate) fn report_fault(&self, unit: &str, fault: ModuleFault) {
        self.log(LogEntry::fault(unit, &fault));
    }

    /// Tasks draining and finalizing unloaded modules.
    pub(crate) fn finalizers(&self) -> &TaskTracker {
        &self.shared.finalizers
    }

    /// Load the unit `name` and activate its modules.
    ///
    /// Returns the number of activated modules. A failed load leaves the
    /// registry exactly as it was. Dropping the returned future does not
    /// cancel the load; the unit still ends up loaded.
    pub async fn load_unit(&self, name: &str) -> Result<usize, LoadError> {
        if !is_valid_unit_name(name) {
            return Err(LoadError::InvalidName(name.to_string()));
        }
        self.reclamation_sweep();

        let reservation = {
            let mut state = self.shared.lock();
            if state.loaded.contains_key(name)
                || state.in_transition.get(name) == Some(&Transition::Loading)
            {
                return Err(LoadError::AlreadyLoaded(name.to_string()));
            }
            if state.unloading.contains_key(name)
                || state.in_transition.get(name) == Some(&Transition::Unloading)
            {
                return Err(LoadError::PreviousStillUnloading(name.to_string()));
            }
            state
                .in_transition
                .insert(name.to_string(), Transition::Loading);
            Reservation {
                shared: Arc::clone(&self.shared),
                name: name.to_string(),
                armed: true,
            }
        };

        // Modules that ran `on_load` must reach the loaded set or a finalizer,
        // so activation runs detached from the caller.
        let registry = self.clone();
        let task = self
            .shared
            .finalizers
            .spawn(async move { registry.complete_load(reservation).await });
        match task.await {
            Ok(result) => result,
            Err(err) => Err(LoadError::Exception {
                name: name.to_string(),
                source: anyhow::Error::new(err),
            }),
        }
    }

    async fn complete_load(&self, reservation: Reservation) -> Result<usize, LoadError> {
        let name = reservation.name.clone();
        let mut unit = LoadedUnit::new(name.clone(), Arc::clone(&self.shared.storage));
        match unit.load_modules(self).await {
            Ok(count) => {
                reservation.finish(|state| {
                    state.loaded.insert(name.clone(), unit);
                });
                self.log(LogEntry::new(
                    Severity::Info,
                    SOURCE,
                    format!("Loaded unit `{name}` ({count} modules)."),
                ));
                Ok(count)
            }
            Err(UnitError::FileNotFound(path)) => {
                drop(reservation);
                self.log(LogEntry::new(
                    Severity::Warning,
                    SOURCE,
                    format!("Unit `{name}` not found at {}.", path.display()),
                ));
                Err(LoadError::FileNotFound(path))
            }
            Err(err) => {
                drop(reservation);
                let source = anyhow::Error::new(err);
                self.log(
                    LogEntry::new(
                        Severity::Error,
                        SOURCE,
                        format!("Exception occurred while loading unit `{name}`."),
                    )
                    .with_cause(&source),
                );
                Err(LoadError::Exception { name, source })
            }
        }
    }

    /// Unload the unit `name`.
    ///
    /// Returns once every module was asked to pre-unload and the unit was
    /// detached; draining and `on_unload` finish in the background. Once the
    /// unit left the loaded set it always reaches the unloading set, even if
    /// the returned future is dropped.
    pub async fn unload_unit(&self, name: &str) -> Result<(), UnloadError> {
        let (unit, reservation) = {
            let mut state = self.shared.lock();
            let unit = state
                .loaded
                .remove(name)
                .ok_or_else(|| UnloadError::NotLoaded(name.to_string()))?;
            state
                .in_transition
                .insert(name.to_string(), Transition::Unloading);
            (
                unit,
                Reservation {
                    shared: Arc::clone(&self.shared),
                    name: name.to_string(),
                    armed: true,
                },
            )
        };

        let registry = self.clone();
        let task = self
            .shared
            .finalizers
            .spawn(async move { registry.retire(unit, reservation).await });
        if let Err(err) = task.await {
            self.log(
                LogEntry::new(
                    Severity::Error,
                    SOURCE,
                    format!("Exception occurred while unloading unit `{name}`."),
                )
                .with_cause(&anyhow::Error::new(err)),
            );
        }
        Ok(())
    }

    /// Pre-unload every module, detach the unit and move it to the
    /// unloading set.
    async fn retire(&self, mut unit: LoadedUnit, reservation: Reservation) {
        unit.unload_modules(self).await;
        let image = unit.detach().unwrap_or_default();
        let id = unit.id();
        drop(unit);

        let name = reservation.name.clone();
        reservation.finish(|state| {
            state.unloading.insert(
                name.clone(),
                DetachedUnit {
                    id,
                    image,
                    detached_at: Utc::now(),
                },
            );
        });
        self.log(LogEntry::new(
            Severity::Info,
            SOURCE,
            format!("Unloaded unit `{name}`; awaiting reclamation."),
        ));
    }

    /// Drop unloading entries whose code is no longer referenced.
    ///
    /// Returns how many entries were reclaimed.
    pub fn reclamation_sweep(&self) -> usize {
        let mut reclaimed = Vec::new();
        {
            let mut state = self.shared.lock();
            state.unloading.retain(|name, detached| {
                let alive = detached.image.strong_count() > 0;
                if !alive {
                    reclaimed.push((name.clone(), detached.id));
                }
                alive
            });
        }
        for (name, id) in &reclaimed {
            self.log(LogEntry::new(
                Severity::Verbose,
                SOURCE,
                format!("Unit `{name}` ({id}) reclaimed."),
            ));
        }
        reclaimed.len()
    }

    /// Sweep until `name` left the unloading set or `timeout` elapsed.
    pub async fn wait_reclaimed(&self, name: &str, timeout: Duration) -> bool {
        let poll = async {
            loop {
                self.reclamation_sweep();
                if !self.is_unloading(name) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.is_ok()
    }

    /// Run [`reclamation_sweep`](Self::reclamation_sweep) every `period` until
    /// `cancel` fires or the registry is dropped.
    pub fn spawn_reclamation_sweeper(
        &self,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let handle = self.handle();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(registry) = handle.registry() else { break };
                        let reclaimed = registry.reclamation_sweep();
                        if reclaimed > 0 {
                            debug!("Reclamation sweep released {} units", reclaimed);
                        }
                    }
                }
            }
        })
    }

    /// Unload every loaded unit and wait up to `grace` for module finalizers.
    ///
    /// Returns the names still awaiting reclamation afterwards.
    pub async fn shutdown(&self, grace: Duration) -> Vec<String> {
        for name in self.loaded_units() {
            if let Err(err) = self.unload_unit(&name).await {
                // Another caller unloaded it between listing and unloading.
                debug!("Skipping unit `{}` at shutdown: {}", name, err);
            }
        }

        let finalizers = &self.shared.finalizers;
        finalizers.close();
        if tokio::time::timeout(grace, finalizers.wait()).await.is_err() {
            self.log(LogEntry::new(
                Severity::Warning,
                SOURCE,
                format!(
                    "{} module finalizers still running after {:?}.",
                    finalizers.len(),
                    grace
                ),
            ));
        }
        finalizers.reopen();

        self.reclamation_sweep();
        self.unloading_units()
    }

    /// Whether `name` is in the loaded set.
    #[must_use]
    pub fn is_loaded(&self, name: &str) -> bool {
        self.shared.lock().loaded.contains_key(name)
    }

    /// Whether `name` is being unloaded or awaits reclamation.
    #[must_use]
    pub fn is_unloading(&self, name: &str) -> bool {
        let state = self.shared.lock();
        state.unloading.contains_key(name)
            || state.in_transition.get(name) == Some(&Transition::Unloading)
    }

    /// Names of loaded units, sorted.
    #[must_use]
    pub fn loaded_units(&self) -> Vec<String> {
        let mut names: Vec<_> = self.shared.lock().loaded.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names awaiting reclamation, sorted.
    #[must_use]
    pub fn unloading_units(&self) -> Vec<String> {
        let mut names: Vec<_> = self.shared.lock().unloading.keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of the loaded unit `name`.
    #[must_use]
    pub fn unit_info(&self, name: &str) -> Option<UnitInfo> {
        let state = self.shared.lock();
        let unit = state.loaded.get(name)?;
        Some(UnitInfo {
            name: unit.name().to_string(),
            id: unit.id(),
            source: unit.source().to_path_buf(),
            modules: unit.module_types().into_iter().map(str::to_string).collect(),
            loaded_at: unit.loaded_at(),
        })
    }

    /// Units awaiting reclamation with their remaining lease counts.
    #[must_use]
    pub fn pending_reclamation(&self) -> Vec<PendingReclamation> {
        let state = self.shared.lock();
        let mut pending: Vec<_> = state
            .unloading
            .iter()
            .map(|(name, detached)| PendingReclamation {
                name: name.clone(),
                id: detached.id,
                detached_at: detached.detached_at,
                live_leases: detached.image.strong_count(),
            })
            .collect();
        pending.sort_by(|a, b| a.name.cmp(&b.name));
        pending
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("loaded", &self.loaded_units())
            .field("unloading", &self.unloading_units())
            .finish()
    }
}
