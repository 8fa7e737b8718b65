//! Capability gate
//!
//! Every host operation a plugin invokes is checked here before the host
//! facade is touched. Only operator grants count; the permissions a plugin
//! declares in its manifest are never consulted.

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::audit::{AuditRecord, AuditSink};
use crate::model::PluginStatus;
use crate::permissions::{Operation, Permission};
use crate::registry::PluginRegistry;

/// Raised to the calling extension when a host operation is refused or fails
#[derive(Error, Debug)]
pub enum PluginException {
    #[error("plugin '{plugin_id}' lacks permission '{permission}' required for {operation}")]
    MissingPermission {
        plugin_id: String,
        operation: &'static str,
        permission: Permission,
    },

    #[error("plugin '{0}' is not active")]
    NotActive(String),

    #[error("unknown plugin '{0}'")]
    UnknownPlugin(String),

    #[error("host error [{}]: {}", .0.code(), .0)]
    Host(#[from] notehost_core::Error),
}

#[derive(Clone)]
pub struct CapabilityGate {
    registry: Arc<PluginRegistry>,
    audit: Arc<dyn AuditSink>,
}

impl CapabilityGate {
    pub fn new(registry: Arc<PluginRegistry>, audit: Arc<dyn AuditSink>) -> Self {
        Self { registry, audit }
    }

    /// Authorize `operation` for `plugin_id`.
    ///
    /// The plugin must be ACTIVE and hold an operator grant for the
    /// operation's permission. Denials are written to the audit sink.
    pub fn check(&self, plugin_id: &str, operation: Operation) -> Result<(), PluginException> {
        let status = self
            .registry
            .status(plugin_id)
            .ok_or_else(|| PluginException::UnknownPlugin(plugin_id.to_string()))?;
        if status != PluginStatus::Active {
            debug!(plugin_id, operation = operation.name(), %status, "Refusing call from inactive plugin");
            return Err(PluginException::NotActive(plugin_id.to_string()));
        }

        let permission = operation.required_permission();
        if self.registry.has_grant(plugin_id, permission) {
            return Ok(());
        }

        warn!(
            plugin_id,
            operation = operation.name(),
            permission = %permission,
            "Capability denied"
        );
        self.audit.record(AuditRecord::PermissionDenied {
            plugin_id: plugin_id.to_string(),
            operation: operation.name().to_string(),
            permission,
            at: Utc::now(),
        });
        Err(PluginException::MissingPermission {
            plugin_id: plugin_id.to_string(),
            operation: operation.name(),
            permission,
        })
    }
}
