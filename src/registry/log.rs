use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::error::ModuleFault;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Error,
    Warning,
    Info,
    Verbose,
    Debug,
}

/// Structured entry raised while loading or unloading units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub severity: Severity,
    pub source: String,
    pub message: String,
    pub cause: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(severity: Severity, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            source: source.into(),
            message: message.into(),
            cause: None,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_cause(mut self, cause: &anyhow::Error) -> Self {
        self.cause = Some(format!("{cause:#}"));
        self
    }

    /// Warning entry for a contained module callback failure.
    pub fn fault(unit: &str, fault: &ModuleFault) -> Self {
        let message = match fault {
            ModuleFault::LoadCallbackFailed { module_type, .. }
            | ModuleFault::ConstructorPanicked { module_type, .. } => {
                format!("Exception occurred while loading module ({module_type}) from unit `{unit}`.")
            }
            ModuleFault::PreUnloadCallbackFailed { module_type, .. } => format!(
                "Exception occurred while pre-unloading module ({module_type}) from unit `{unit}`."
            ),
            ModuleFault::UnloadCallbackFailed { module_type, .. } => format!(
                "Exception occurred while unloading module ({module_type}) from unit `{unit}`; resources may leak."
            ),
        };
        Self::new(Severity::Warning, "ModuleRegistry", message).with_cause(fault.cause())
    }

    /// Mirror the entry into `tracing`.
    pub(crate) fn trace(&self) {
        let cause = self.cause.as_deref().unwrap_or("");
        match self.severity {
            Severity::Critical | Severity::Error => {
                error!(source = %self.source, cause, "{}", self.message);
            }
            Severity::Warning => warn!(source = %self.source, cause, "{}", self.message),
            Severity::Info => info!(source = %self.source, "{}", self.message),
            Severity::Verbose => debug!(source = %self.source, "{}", self.message),
            Severity::Debug => trace!(source = %self.source, "{}", self.message),
        }
    }
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{:?}] {}: {}",
            self.timestamp.format("%H:%M:%S"),
            self.severity,
            self.source,
            self.message
        )?;
        if let Some(cause) = &self.cause {
            write!(f, " ({cause})")?;
        }
        Ok(())
    }
}
