//! Declared plugin metadata and its validation

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

use crate::events::is_canonical_event_type;
use crate::permissions::Permission;
use crate::validator::archive::normalize_entry_path;

/// Manifest file name looked up at the archive root
pub const MANIFEST_ENTRY: &str = "plugin.toml";

const MAX_MANIFEST_BYTES: u64 = 64 * 1024;
const MAX_ID_LEN: usize = 64;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("malformed plugin metadata: {}", reasons.join("; "))]
pub struct MetadataError {
    pub reasons: Vec<String>,
}

impl MetadataError {
    fn single(reason: impl Into<String>) -> Self {
        Self {
            reasons: vec![reason.into()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginType {
    Ui,
    DataProcessor,
    Integration,
    Utility,
}

/// How the plugin's code is reached once active
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuntimeSpec {
    /// WASM module shipped inside the archive
    InProcess { entry: String },
    /// JSON-RPC 2.0 service over HTTPS
    Rpc { endpoint: String },
    /// Events POSTed to an HTTPS callback
    RestCallback { url: String },
    /// Events buffered in a host-side queue drained by the plugin
    QueueConsumer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capacity: Option<usize>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    InProcess,
    Rpc,
    RestCallback,
    QueueConsumer,
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InProcess => "in_process",
            Self::Rpc => "rpc",
            Self::RestCallback => "rest_callback",
            Self::QueueConsumer => "queue_consumer",
        };
        f.write_str(s)
    }
}

impl RuntimeSpec {
    pub fn kind(&self) -> RuntimeKind {
        match self {
            Self::InProcess { .. } => RuntimeKind::InProcess,
            Self::Rpc { .. } => RuntimeKind::Rpc,
            Self::RestCallback { .. } => RuntimeKind::RestCallback,
            Self::QueueConsumer { .. } => RuntimeKind::QueueConsumer,
        }
    }
}

/// Metadata a plugin declares at packaging time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    pub runtime: RuntimeSpec,
    #[serde(default)]
    pub required_permissions: BTreeSet<Permission>,
    #[serde(default)]
    pub subscriptions: Vec<String>,
}

impl PluginMetadata {
    /// Check every field, collecting all problems rather than stopping at the first
    pub fn validate(&self) -> Result<(), MetadataError> {
        let mut reasons = Vec::new();

        if let Err(reason) = validate_plugin_id(&self.id) {
            reasons.push(reason);
        }

        for (field, value) in [
            ("name", &self.name),
            ("author", &self.author),
            ("description", &self.description),
        ] {
            if value.trim().is_empty() {
                reasons.push(format!("{} cannot be empty", field));
            }
        }

        if let Err(e) = semver::Version::parse(&self.version) {
            reasons.push(format!("version '{}' is not a semantic version: {}", self.version, e));
        }

        match &self.runtime {
            RuntimeSpec::InProcess { entry } => {
                if normalize_entry_path(entry).is_none() {
                    reasons.push(format!("runtime entry '{}' must be a path inside the archive", entry));
                } else if !entry.ends_with(".wasm") {
                    reasons.push(format!("runtime entry '{}' must be a .wasm module", entry));
                }
            }
            RuntimeSpec::Rpc { endpoint } => {
                if let Err(reason) = validate_https_url("runtime endpoint", endpoint) {
                    reasons.push(reason);
                }
            }
            RuntimeSpec::RestCallback { url } => {
                if let Err(reason) = validate_https_url("runtime callback url", url) {
                    reasons.push(reason);
                }
            }
            RuntimeSpec::QueueConsumer { capacity } => {
                if *capacity == Some(0) {
                    reasons.push("queue capacity must be greater than zero".to_string());
                }
            }
        }

        let mut seen = HashSet::new();
        for subscription in &self.subscriptions {
            if !is_canonical_event_type(subscription) {
                reasons.push(format!("subscription '{}' is not a canonical event type", subscription));
            }
            if !seen.insert(subscription) {
                reasons.push(format!("duplicate subscription '{}'", subscription));
            }
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(MetadataError { reasons })
        }
    }
}

/// Plugin ids are lowercase slugs: letters, digits, '-', '_' and '.'
pub fn validate_plugin_id(id: &str) -> Result<(), String> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(format!("id must be 1-{} characters", MAX_ID_LEN));
    }
    let mut chars = id.chars();
    let starts_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    let rest_ok = chars.all(|c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.')
    });
    if !starts_ok || !rest_ok {
        return Err(format!(
            "id '{}' must be a lowercase slug (a-z, 0-9, '-', '_', '.')",
            id
        ));
    }
    Ok(())
}

fn validate_https_url(field: &str, value: &str) -> Result<(), String> {
    let parsed = url::Url::parse(value).map_err(|e| format!("{} '{}' is invalid: {}", field, value, e))?;
    if parsed.scheme() != "https" {
        return Err(format!("{} '{}' must use https", field, value));
    }
    if parsed.host_str().is_none() {
        return Err(format!("{} '{}' has no host", field, value));
    }
    Ok(())
}

/// Parse and validate a TOML manifest
pub fn parse_manifest(toml_content: &str) -> Result<PluginMetadata, MetadataError> {
    let metadata: PluginMetadata = toml::from_str(toml_content)
        .map_err(|e| MetadataError::single(format!("invalid manifest TOML: {}", e)))?;
    metadata.validate()?;
    Ok(metadata)
}

/// Read `plugin.toml` from the root of a cached archive
pub fn read_from_archive(path: &Path) -> Result<PluginMetadata, MetadataError> {
    let file = File::open(path)
        .map_err(|e| MetadataError::single(format!("cannot open archive: {}", e)))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| MetadataError::single(format!("cannot read archive: {}", e)))?;
    let entry = archive
        .by_name(MANIFEST_ENTRY)
        .map_err(|_| MetadataError::single(format!("archive has no {}", MANIFEST_ENTRY)))?;

    let mut contents = String::new();
    entry
        .take(MAX_MANIFEST_BYTES + 1)
        .read_to_string(&mut contents)
        .map_err(|e| MetadataError::single(format!("cannot read {}: {}", MANIFEST_ENTRY, e)))?;
    if contents.len() as u64 > MAX_MANIFEST_BYTES {
        return Err(MetadataError::single("manifest file too large"));
    }

    parse_manifest(&contents)
}
