//! Sample unit with two modules and one abstract base.
//!
//! Copy the built library into the host's unit directory as `alpha.<ext>`,
//! then `load alpha` from the host console.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cogworks::registry::{LogEntry, Severity};
use cogworks::{anyhow, async_trait, tokio, Module, ModuleBase, ModuleDescriptor};

cogworks::declare_unit!(
    ModuleDescriptor::abstract_type("Announcer"),
    ModuleDescriptor::concrete::<Greeter>(),
    ModuleDescriptor::concrete::<Ticker>(),
);

fn announce(base: &ModuleBase, source: &str, message: String) {
    if let Some(registry) = base.registry() {
        registry.log(LogEntry::new(Severity::Info, source, message));
    }
}

#[derive(Default)]
pub struct Greeter {
    base: ModuleBase,
}

#[async_trait]
impl Module for Greeter {
    fn base(&self) -> &ModuleBase {
        &self.base
    }

    async fn on_load(&mut self) -> anyhow::Result<()> {
        announce(&self.base, "Greeter", "Hello from alpha.".to_string());
        Ok(())
    }

    async fn on_unload(&mut self) -> anyhow::Result<()> {
        announce(&self.base, "Greeter", "Goodbye from alpha.".to_string());
        Ok(())
    }
}

/// Counts seconds in the background until the unit starts unloading.
#[derive(Default)]
pub struct Ticker {
    base: ModuleBase,
    ticks: Arc<AtomicU64>,
}

#[async_trait]
impl Module for Ticker {
    fn base(&self) -> &ModuleBase {
        &self.base
    }

    async fn on_load(&mut self) -> anyhow::Result<()> {
        let work = self.base.work().clone();
        let ticks = Arc::clone(&self.ticks);
        self.base.spawn(async move {
            while !work.is_draining() {
                tokio::time::sleep(Duration::from_secs(1)).await;
                ticks.fetch_add(1, Ordering::Relaxed);
            }
        });
        Ok(())
    }

    async fn on_unload(&mut self) -> anyhow::Result<()> {
        let ticks = self.ticks.load(Ordering::Relaxed);
        announce(&self.base, "Ticker", format!("Stopped after {ticks} ticks."));
        Ok(())
    }
}
