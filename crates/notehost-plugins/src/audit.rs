//! Audit trail for security-relevant plugin decisions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

use crate::model::PluginStatus;
use crate::permissions::Permission;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum AuditRecord {
    Verdict {
        artifact_sha256: String,
        plugin_id: Option<String>,
        passed: bool,
        violations: usize,
        at: DateTime<Utc>,
    },
    Transition {
        plugin_id: String,
        from: Option<PluginStatus>,
        to: Option<PluginStatus>,
        operation: String,
        at: DateTime<Utc>,
    },
    PermissionDenied {
        plugin_id: String,
        operation: String,
        permission: Permission,
        at: DateTime<Utc>,
    },
    Grant {
        plugin_id: String,
        permission: Permission,
        actor: String,
        revoked: bool,
        at: DateTime<Utc>,
    },
    Fault {
        plugin_id: String,
        reason: String,
        at: DateTime<Utc>,
    },
}

pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Emits audit records as structured log events on the `notehost::audit` target
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: AuditRecord) {
        match &record {
            AuditRecord::Verdict {
                artifact_sha256,
                plugin_id,
                passed,
                violations,
                ..
            } => info!(
                target: "notehost::audit",
                artifact_sha256 = %artifact_sha256,
                plugin_id = plugin_id.as_deref().unwrap_or("-"),
                passed,
                violations,
                "security verdict"
            ),
            AuditRecord::Transition {
                plugin_id,
                from,
                to,
                operation,
                ..
            } => info!(
                target: "notehost::audit",
                plugin_id = %plugin_id,
                from = ?from,
                to = ?to,
                operation = %operation,
                "lifecycle transition"
            ),
            AuditRecord::PermissionDenied {
                plugin_id,
                operation,
                permission,
                ..
            } => warn!(
                target: "notehost::audit",
                plugin_id = %plugin_id,
                operation = %operation,
                permission = %permission,
                "permission denied"
            ),
            AuditRecord::Grant {
                plugin_id,
                permission,
                actor,
                revoked,
                ..
            } => info!(
                target: "notehost::audit",
                plugin_id = %plugin_id,
                permission = %permission,
                actor = %actor,
                revoked,
                "permission change"
            ),
            AuditRecord::Fault { plugin_id, reason, .. } => warn!(
                target: "notehost::audit",
                plugin_id = %plugin_id,
                reason = %reason,
                "plugin fault"
            ),
        }
    }
}

/// Keeps records in memory; used by tests and embedders that ship audit
/// data elsewhere
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn denials(&self) -> usize {
        self.records()
            .iter()
            .filter(|r| matches!(r, AuditRecord::PermissionDenied { .. }))
            .count()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}
