//! Installed-plugin records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::cache::ArtifactOrigin;
use crate::manifest::{PluginMetadata, PluginType, RuntimeSpec};
use crate::permissions::Permission;

/// Lifecycle state of an installed plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginStatus {
    Registered,
    Active,
    Inactive,
    Error,
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Registered => "REGISTERED",
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Where an installed plugin came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceOrigin {
    Local,
    Remote { url: String },
    TrustedRepository { id: String },
}

impl From<&ArtifactOrigin> for SourceOrigin {
    fn from(origin: &ArtifactOrigin) -> Self {
        match origin {
            ArtifactOrigin::Local => Self::Local,
            ArtifactOrigin::Remote { url } => Self::Remote { url: url.clone() },
        }
    }
}

/// Identity, metadata, and lifecycle state for one installed plugin.
///
/// Instances handed out by the registry are snapshots; the registry's own
/// copy is only changed through its transition operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    pub runtime: RuntimeSpec,
    /// Informational only; the capability gate never reads this
    pub required_permissions: BTreeSet<Permission>,
    pub subscriptions: Vec<String>,
    pub source_origin: SourceOrigin,
    pub checksum: String,
    pub status: PluginStatus,
    pub last_error: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PluginInfo {
    pub(crate) fn from_metadata(
        metadata: PluginMetadata,
        checksum: &str,
        source_origin: SourceOrigin,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: metadata.id,
            name: metadata.name,
            version: metadata.version,
            author: metadata.author,
            description: metadata.description,
            plugin_type: metadata.plugin_type,
            runtime: metadata.runtime,
            required_permissions: metadata.required_permissions,
            subscriptions: metadata.subscriptions,
            source_origin,
            checksum: checksum.to_string(),
            status: PluginStatus::Registered,
            last_error: None,
            registered_at: now,
            updated_at: now,
        }
    }
}
