//! Security validation of plugin archives
//!
//! A single pass over the archive checks structure, entry paths, file types,
//! and content, hashing each entry for the origin signature check along the
//! way. Decompressed bytes are counted as they are read rather than trusted
//! from the central directory, so a forged size header cannot hide a bomb.

pub mod archive;
pub mod origin;
mod patterns;

use chrono::{DateTime, Utc};
use notehost_core::config::ValidatorConfig;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::Read;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::ArtifactRecord;
use crate::manifest::MANIFEST_ENTRY;
use archive::{
    declared_entry_count, executable_magic, extension, is_dangerous_extension, is_scannable_extension,
    normalize_entry_path,
};
use origin::{SIGNATURE_ENTRY, archive_digest, check_origin};
use patterns::ContentScanner;

const READ_CHUNK: usize = 64 * 1024;
const MAX_SIGNATURE_BYTES: usize = 4 * 1024;
const MAX_MANIFEST_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCategory {
    Structural,
    DangerousFile,
    ContentPattern,
    OriginTrust,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub category: ViolationCategory,
    pub severity: Severity,
    pub detail: String,
}

impl Violation {
    fn failure(category: ViolationCategory, detail: impl Into<String>) -> Self {
        Self {
            category,
            severity: Severity::Failure,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let category = match self.category {
            ViolationCategory::Structural => "structural",
            ViolationCategory::DangerousFile => "dangerous-file",
            ViolationCategory::ContentPattern => "content-pattern",
            ViolationCategory::OriginTrust => "origin-trust",
        };
        let severity = match self.severity {
            Severity::Warning => "warning",
            Severity::Failure => "failure",
        };
        write!(f, "[{} {}] {}", category, severity, self.detail)
    }
}

/// Outcome of validating one artifact. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityVerdict {
    id: Uuid,
    artifact_sha256: String,
    plugin_id: Option<String>,
    passed: bool,
    violations: Vec<Violation>,
    evaluated_at: DateTime<Utc>,
}

impl SecurityVerdict {
    fn new(artifact_sha256: &str, plugin_id: Option<String>, violations: Vec<Violation>) -> Self {
        let passed = violations.iter().all(|v| v.severity != Severity::Failure);
        Self {
            id: Uuid::new_v4(),
            artifact_sha256: artifact_sha256.to_string(),
            plugin_id,
            passed,
            violations,
            evaluated_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn artifact_sha256(&self) -> &str {
        &self.artifact_sha256
    }

    /// Plugin id declared in the archive manifest, when one could be read
    pub fn plugin_id(&self) -> Option<&str> {
        self.plugin_id.as_deref()
    }

    pub fn passed(&self) -> bool {
        self.passed
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn failures(&self) -> impl Iterator<Item = &Violation> {
        self.violations
            .iter()
            .filter(|v| v.severity == Severity::Failure)
    }

    pub fn evaluated_at(&self) -> DateTime<Utc> {
        self.evaluated_at
    }
}

/// Archive inspection state collected during the single pass
#[derive(Default)]
struct ScanState {
    violations: Vec<Violation>,
    entry_digests: Vec<(String, String)>,
    signature: Option<Vec<u8>>,
    manifest: Option<Vec<u8>>,
    decompressed_total: u64,
}

impl ScanState {
    fn push(&mut self, violation: Violation) {
        debug!(violation = %violation, "Archive violation");
        self.violations.push(violation);
    }
}

pub struct SecurityValidator {
    config: ValidatorConfig,
}

impl SecurityValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    /// Validate a cached artifact. Blocking; callers on an async runtime
    /// should run it on a blocking thread.
    pub fn validate(&self, artifact: &ArtifactRecord) -> SecurityVerdict {
        let mut state = ScanState::default();
        self.scan_archive(artifact, &mut state);

        let mut digests = std::mem::take(&mut state.entry_digests);
        let digest = archive_digest(&mut digests);
        if let Err(reason) = check_origin(
            &artifact.downloaded_from,
            &self.config.trusted_hosts,
            &self.config.trusted_keys,
            state.signature.as_deref(),
            &digest,
        ) {
            state.push(Violation::failure(ViolationCategory::OriginTrust, reason));
        }

        let plugin_id = state.manifest.as_deref().and_then(declared_plugin_id);
        let verdict = SecurityVerdict::new(&artifact.sha256, plugin_id, state.violations);

        if verdict.passed() {
            info!(
                sha256 = %artifact.sha256,
                warnings = verdict.violations().len(),
                "Artifact passed validation"
            );
        } else {
            warn!(
                sha256 = %artifact.sha256,
                failures = verdict.failures().count(),
                "Artifact failed validation"
            );
        }
        verdict
    }

    fn scan_archive(&self, artifact: &ArtifactRecord, state: &mut ScanState) {
        let mut file = match File::open(&artifact.local_path) {
            Ok(file) => file,
            Err(e) => {
                state.push(Violation::failure(
                    ViolationCategory::Structural,
                    format!("cannot open archive: {}", e),
                ));
                return;
            }
        };
        if let Ok(Some(declared)) = declared_entry_count(&mut file) {
            if declared > self.config.max_entries as u64 {
                state.push(Violation::failure(
                    ViolationCategory::Structural,
                    format!(
                        "archive has {} entries, limit is {}",
                        declared, self.config.max_entries
                    ),
                ));
                return;
            }
        }

        let mut zip = match zip::ZipArchive::new(file) {
            Ok(zip) => zip,
            Err(e) => {
                state.push(Violation::failure(
                    ViolationCategory::Structural,
                    format!("not a readable zip archive: {}", e),
                ));
                return;
            }
        };

        if zip.len() > self.config.max_entries {
            state.push(Violation::failure(
                ViolationCategory::Structural,
                format!(
                    "archive has {} entries, limit is {}",
                    zip.len(),
                    self.config.max_entries
                ),
            ));
            return;
        }

        let mut buf = vec![0u8; READ_CHUNK];
        for index in 0..zip.len() {
            let mut entry = match zip.by_index(index) {
                Ok(entry) => entry,
                Err(e) => {
                    state.push(Violation::failure(
                        ViolationCategory::Structural,
                        format!("corrupt entry #{}: {}", index, e),
                    ));
                    continue;
                }
            };

            let raw_name = entry.name().to_string();
            let Some(path) = normalize_entry_path(&raw_name) else {
                state.push(Violation::failure(
                    ViolationCategory::Structural,
                    format!("entry '{}' escapes the archive root", raw_name.escape_default()),
                ));
                continue;
            };
            if entry.is_dir() {
                continue;
            }

            let ext = extension(&path);
            if let Some(ext) = ext.as_deref() {
                if is_dangerous_extension(ext) {
                    state.push(Violation::failure(
                        ViolationCategory::DangerousFile,
                        format!("'{}' has forbidden extension .{}", path, ext),
                    ));
                }
            }
            let scannable = ext.as_deref().is_some_and(is_scannable_extension);
            let is_signature = path == SIGNATURE_ENTRY;
            let is_manifest = path == MANIFEST_ENTRY;

            let mut hasher = Sha256::new();
            let mut scanner = ContentScanner::default();
            let mut scanned = 0u64;
            let mut captured = Vec::new();
            let mut first_chunk = true;

            loop {
                let n = match entry.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        state.push(Violation::failure(
                            ViolationCategory::Structural,
                            format!("corrupt entry '{}': {}", path, e),
                        ));
                        break;
                    }
                };
                let chunk = &buf[..n];

                state.decompressed_total += n as u64;
                if state.decompressed_total > self.config.max_decompressed_bytes {
                    state.push(Violation::failure(
                        ViolationCategory::Structural,
                        format!(
                            "decompressed size exceeds {} bytes",
                            self.config.max_decompressed_bytes
                        ),
                    ));
                    return;
                }

                if first_chunk {
                    first_chunk = false;
                    if let Some(kind) = executable_magic(chunk) {
                        state.push(Violation::failure(
                            ViolationCategory::DangerousFile,
                            format!("'{}' contains a native {}", path, kind),
                        ));
                    }
                }

                hasher.update(chunk);
                if scannable && scanned < self.config.max_scanned_entry_bytes {
                    scanner.feed(chunk);
                    scanned += n as u64;
                }
                let capture_limit = if is_signature {
                    MAX_SIGNATURE_BYTES
                } else if is_manifest {
                    MAX_MANIFEST_BYTES
                } else {
                    0
                };
                if captured.len() < capture_limit {
                    let take = (capture_limit - captured.len()).min(n);
                    captured.extend_from_slice(&chunk[..take]);
                }
            }

            for pattern in scanner.finish() {
                state.push(Violation {
                    category: ViolationCategory::ContentPattern,
                    severity: pattern.severity,
                    detail: format!("'{}' references {}", path, pattern.label),
                });
            }

            if is_signature {
                state.signature = Some(captured);
            } else {
                if is_manifest {
                    state.manifest = Some(captured);
                }
                state
                    .entry_digests
                    .push((path, hex::encode(hasher.finalize())));
            }
        }
    }
}

fn declared_plugin_id(manifest: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(manifest).ok()?;
    let table: toml::Table = toml::from_str(text).ok()?;
    table.get("id")?.as_str().map(str::to_string)
}
