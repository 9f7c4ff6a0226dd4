//! Error types for unit loading and module lifecycle faults.

use std::path::PathBuf;

use thiserror::Error;

/// Why a `load_unit` request did not activate the unit.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unit `{0}` is already loaded")]
    AlreadyLoaded(String),

    /// The previous incarnation of the unit has been detached but not reclaimed yet.
    #[error("previous instance of unit `{0}` is still unloading")]
    PreviousStillUnloading(String),

    #[error("unit file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("invalid unit name `{0}`")]
    InvalidName(String),

    #[error("failed to load unit `{name}`: {source:#}")]
    Exception {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnloadError {
    #[error("unit `{0}` is not loaded")]
    NotLoaded(String),
}

/// Errors raised by a single [`LoadedUnit`](crate::unit::LoadedUnit).
#[derive(Debug, Error)]
pub enum UnitError {
    #[error("unit file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("failed to open unit: {0:#}")]
    Load(#[source] anyhow::Error),

    /// The unit was unloaded; a fresh instance is needed to load it again.
    #[error("unit has been unloaded and cannot be reused")]
    Retired,

    #[error("unit still has active modules")]
    StillLoaded,
}

/// Module callback failures. These are logged and never returned to callers.
#[derive(Debug, Error)]
pub enum ModuleFault {
    #[error("exception occurred while loading module ({module_type}): {cause:#}")]
    LoadCallbackFailed {
        module_type: &'static str,
        cause: anyhow::Error,
    },

    #[error("exception occurred while pre-unloading module ({module_type}): {cause:#}")]
    PreUnloadCallbackFailed {
        module_type: &'static str,
        cause: anyhow::Error,
    },

    #[error("exception occurred while unloading module ({module_type}), resources may leak: {cause:#}")]
    UnloadCallbackFailed {
        module_type: &'static str,
        cause: anyhow::Error,
    },

    #[error("module constructor panicked ({module_type}): {cause:#}")]
    ConstructorPanicked {
        module_type: &'static str,
        cause: anyhow::Error,
    },
}

impl ModuleFault {
    pub fn module_type(&self) -> &'static str {
        match self {
            Self::LoadCallbackFailed { module_type, .. }
            | Self::PreUnloadCallbackFailed { module_type, .. }
            | Self::UnloadCallbackFailed { module_type, .. }
            | Self::ConstructorPanicked { module_type, .. } => module_type,
        }
    }

    pub fn cause(&self) -> &anyhow::Error {
        match self {
            Self::LoadCallbackFailed { cause, .. }
            | Self::PreUnloadCallbackFailed { cause, .. }
            | Self::UnloadCallbackFailed { cause, .. }
            | Self::ConstructorPanicked { cause, .. } => cause,
        }
    }
}

/// Turn a caught panic payload into an error value.
pub(crate) fn panic_to_error(payload: Box<dyn std::any::Any + Send>) -> anyhow::Error {
    let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    anyhow::anyhow!("panicked: {message}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_payload_conversion() {
        let err = panic_to_error(Box::new("boom"));
        assert_eq!(err.to_string(), "panicked: boom");

        let err = panic_to_error(Box::new(String::from("owned boom")));
        assert_eq!(err.to_string(), "panicked: owned boom");

        let err = panic_to_error(Box::new(42_u8));
        assert!(err.to_string().contains("unknown"));
    }

    #[test]
    fn test_fault_accessors() {
        let fault = ModuleFault::UnloadCallbackFailed {
            module_type: "Ticker",
            cause: anyhow::anyhow!("socket busy"),
        };
        assert_eq!(fault.module_type(), "Ticker");
        assert_eq!(fault.cause().to_string(), "socket busy");
        assert!(fault.to_string().contains("resources may leak"));
    }
}
