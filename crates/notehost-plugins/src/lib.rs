//! Notehost Plugin Runtime
//!
//! Admits, runs and contains third-party extensions:
//! - Artifact fetching with SSRF protection and a content-addressed cache
//! - Archive security validation with an append-only verdict log
//! - Lifecycle state machine over a persistent plugin table
//! - Capability gate in front of the host's note and user APIs
//! - Event bus delivering host domain events to plugin runtimes

pub mod audit;
pub mod cache;
pub mod events;
pub mod facade;
pub mod fetcher;
pub mod gate;
pub mod handle;
pub mod installer;
pub mod manifest;
pub mod model;
pub mod permissions;
pub mod registry;
pub mod store;
pub mod validator;
pub mod verdicts;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use audit::{AuditRecord, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use cache::{ArtifactCache, ArtifactOrigin, ArtifactRecord};
pub use events::{EventBus, EventBusError, EventKind, EventListener, ListenerError, PluginEvent};
pub use fetcher::{ArtifactFetcher, FetchError};
pub use gate::{CapabilityGate, PluginException};
pub use handle::{HandleError, HandleFactory, PluginHandle, RuntimeHandleFactory};
pub use installer::{InstallRejection, InstallRequest, InstallSource, PluginInstaller, PluginRuntime};
pub use manifest::{MetadataError, PluginMetadata, PluginType, RuntimeSpec};
pub use model::{PluginInfo, PluginStatus, SourceOrigin};
pub use permissions::{GrantedPermission, Operation, Permission};
pub use registry::{LifecycleError, PluginRegistry};
pub use store::StorageError;
pub use validator::{SecurityValidator, SecurityVerdict, Violation};
pub use verdicts::ValidationError;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Exception(#[from] PluginException),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    EventBus(#[from] EventBusError),

    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error("Plugin IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Machine-readable error family reported to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Validation,
    Lifecycle,
    Authorization,
    Storage,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Validation => "validation",
            Self::Lifecycle => "lifecycle",
            Self::Authorization => "authorization",
            Self::Storage => "storage",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PluginError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Fetch(FetchError::Io(_)) => ErrorCategory::Storage,
            Self::Fetch(_) => ErrorCategory::Network,
            Self::Validation(ValidationError::Storage(_)) => ErrorCategory::Storage,
            Self::Validation(ValidationError::Task(_)) => ErrorCategory::Internal,
            Self::Lifecycle(e) => match e {
                LifecycleError::ValidationFailed { .. } | LifecycleError::MalformedMetadata(_) => {
                    ErrorCategory::Validation
                }
                LifecycleError::Storage(_) => ErrorCategory::Storage,
                _ => ErrorCategory::Lifecycle,
            },
            Self::Exception(PluginException::Host(_)) => ErrorCategory::Internal,
            Self::Exception(_) => ErrorCategory::Authorization,
            Self::Storage(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::EventBus(_) => ErrorCategory::Internal,
            Self::Handle(_) => ErrorCategory::Lifecycle,
        }
    }

    /// Human-readable reasons; validation failures list every violation
    pub fn reasons(&self) -> Vec<String> {
        match self {
            Self::Lifecycle(LifecycleError::ValidationFailed { reasons, .. }) => reasons.clone(),
            Self::Lifecycle(LifecycleError::MalformedMetadata(e)) => e.reasons.clone(),
            other => vec![other.to_string()],
        }
    }
}

#[cfg(test)]
mod registry_tests;
#[cfg(test)]
pub(crate) mod testing;
