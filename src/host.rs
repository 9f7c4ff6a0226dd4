//! Host process wiring: registry construction, periodic reclamation,
//! startup units and the operator command surface.

use std::fmt::Write as _;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::admin::AdminCommand;
use crate::config::HostConfig;
use crate::registry::{ModuleRegistry, Severity};
use crate::services::ServiceCollection;
use crate::unit::{DylibStorage, UnitStorage};

pub struct Host {
    config: HostConfig,
    registry: ModuleRegistry,
    cancel: CancellationToken,
    sweeper: JoinHandle<()>,
}

impl Host {
    /// Start a host loading native units from the configured directory.
    pub async fn start(config: HostConfig, services: ServiceCollection) -> Self {
        let storage = Arc::new(DylibStorage::new(&config.units.directory));
        Self::with_storage(config, storage, services).await
    }

    pub async fn with_storage(
        config: HostConfig,
        storage: Arc<dyn UnitStorage>,
        services: ServiceCollection,
    ) -> Self {
        let registry = ModuleRegistry::with_event_capacity(
            storage,
            Arc::new(services),
            config.logging.event_capacity,
        );
        let cancel = CancellationToken::new();
        let sweeper =
            registry.spawn_reclamation_sweeper(config.reclamation.sweep_interval(), cancel.clone());

        for name in &config.units.autoload {
            match registry.load_unit(name).await {
                Ok(count) => info!("Autoloaded unit `{}` ({} modules)", name, count),
                Err(e) => warn!("Failed to autoload unit `{}`: {}", name, e),
            }
        }

        Self {
            config,
            registry,
            cancel,
            sweeper,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Run an operator command and render the outcome.
    pub async fn execute(&self, command: AdminCommand) -> String {
        match command {
            AdminCommand::Load(name) => self.load(&name).await,
            AdminCommand::Unload(name) => match self.registry.unload_unit(&name).await {
                Ok(()) => format!("Unloaded unit `{name}`."),
                Err(e) => format!("Error: {e}"),
            },
            AdminCommand::Reload(name) => self.reload(&name).await,
            AdminCommand::List => self.describe(),
            AdminCommand::Sweep => {
                let reclaimed = self.registry.reclamation_sweep();
                let pending = self.registry.unloading_units().len();
                format!("Reclaimed {reclaimed} units, {pending} still unloading.")
            }
            AdminCommand::Help => AdminCommand::usage().to_string(),
            AdminCommand::Quit => "Shutting down.".to_string(),
        }
    }

    async fn load(&self, name: &str) -> String {
        match self.registry.load_unit(name).await {
            Ok(count) => format!("Loaded unit `{name}` ({count} modules)."),
            Err(e) => format!("Error: {e}"),
        }
    }

    async fn reload(&self, name: &str) -> String {
        if let Err(e) = self.registry.unload_unit(name).await {
            return format!("Error: {e}");
        }
        let wait = self.config.reclamation.reload_wait();
        if !self.registry.wait_reclaimed(name, wait).await {
            return format!(
                "Unit `{name}` unloaded but not reclaimed within {wait:?}; load it again later."
            );
        }
        self.load(name).await
    }

    fn describe(&self) -> String {
        let mut out = String::new();
        let loaded = self.registry.loaded_units();
        if loaded.is_empty() {
            out.push_str("No units loaded.");
        }
        for name in loaded {
            if let Some(info) = self.registry.unit_info(&name) {
                let _ = write!(
                    out,
                    "{} [{}] {}",
                    info.name,
                    info.source.display(),
                    info.modules.join(", ")
                );
                out.push('\n');
            }
        }
        for pending in self.registry.pending_reclamation() {
            let _ = writeln!(
                out,
                "{} (unloading since {}, {} live leases)",
                pending.name,
                pending.detached_at.format("%H:%M:%S"),
                pending.live_leases
            );
        }
        out.trim_end().to_string()
    }

    /// Stop the sweeper and unload every unit. Returns names that were not
    /// reclaimed within the shutdown grace period.
    pub async fn shutdown(self) -> Vec<String> {
        self.cancel.cancel();
        let _ = self.sweeper.await;

        let leaked = self
            .registry
            .shutdown(self.config.reclamation.shutdown_grace())
            .await;
        if leaked.is_empty() {
            info!("All units unloaded and reclaimed");
        } else {
            warn!("Units not reclaimed at shutdown: {}", leaked.join(", "));
        }
        leaked
    }
}

/// Relay registry log entries at or above `threshold` to `sink`, e.g. an
/// operator console or chat channel.
pub fn spawn_log_relay<F>(registry: &ModuleRegistry, threshold: Severity, mut sink: F) -> JoinHandle<()>
where
    F: FnMut(String) + Send + 'static,
{
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(entry) if entry.severity <= threshold => sink(entry.to_string()),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    sink(format!("... {skipped} log entries dropped"));
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Module, ModuleBase};
    use crate::unit::{ModuleDescriptor, StaticStorage, UnitManifest};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Echo {
        base: ModuleBase,
    }

    impl Module for Echo {
        fn base(&self) -> &ModuleBase {
            &self.base
        }
    }

    fn storage() -> Arc<dyn UnitStorage> {
        let storage = StaticStorage::new();
        storage.insert("echo", || {
            UnitManifest::new(vec![ModuleDescriptor::concrete::<Echo>()])
        });
        Arc::new(storage)
    }

    fn config() -> HostConfig {
        let mut config = HostConfig::default();
        config.units.autoload = vec!["echo".to_string(), "missing".to_string()];
        config.reclamation.sweep_interval_ms = 10;
        config.reclamation.reload_wait_ms = 2_000;
        config.reclamation.shutdown_grace_ms = 2_000;
        config
    }

    #[tokio::test]
    async fn test_autoload_and_commands() {
        let host = Host::with_storage(config(), storage(), ServiceCollection::new()).await;
        assert_eq!(host.registry().loaded_units(), vec!["echo"]);

        let listing = host.execute(AdminCommand::List).await;
        assert!(listing.contains("echo"));
        assert!(listing.contains("Echo"));

        let again = host.execute(AdminCommand::Load("echo".into())).await;
        assert!(again.contains("already loaded"));

        let reloaded = host.execute(AdminCommand::Reload("echo".into())).await;
        assert_eq!(reloaded, "Loaded unit `echo` (1 modules).");

        let missing = host.execute(AdminCommand::Unload("missing".into())).await;
        assert!(missing.contains("not loaded"));

        assert!(host.shutdown().await.is_empty());
    }

    #[tokio::test]
    async fn test_log_relay_filters_by_severity() {
        let host = Host::with_storage(HostConfig::default(), storage(), ServiceCollection::new()).await;
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let relay = spawn_log_relay(host.registry(), Severity::Warning, move |line| {
            sink.lock().unwrap().push(line);
        });

        host.execute(AdminCommand::Load("echo".into())).await;
        host.execute(AdminCommand::Load("nowhere".into())).await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while lines.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("warning should be relayed");

        let lines = lines.lock().unwrap().clone();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("nowhere"));

        relay.abort();
        host.shutdown().await;
    }
}
