//! Verdict history and validation scheduling
//!
//! Verdicts are appended to a JSON-lines log keyed by artifact hash and are
//! never rewritten. Concurrent validations of the same artifact share one
//! run.

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

use crate::audit::{AuditRecord, AuditSink};
use crate::cache::ArtifactRecord;
use crate::store::StorageError;
use crate::validator::{SecurityValidator, SecurityVerdict};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("validation task failed: {0}")]
    Task(String),

    #[error("could not record verdict: {0}")]
    Storage(String),
}

#[derive(Debug)]
pub struct VerdictLog {
    path: Option<PathBuf>,
    by_hash: RwLock<HashMap<String, Vec<Arc<SecurityVerdict>>>>,
    writer: Mutex<()>,
}

impl VerdictLog {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            by_hash: RwLock::new(HashMap::new()),
            writer: Mutex::new(()),
        }
    }

    /// Open the log, replaying every readable line
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let log = Self {
            path: Some(path.to_path_buf()),
            ..Self::in_memory()
        };
        if !path.exists() {
            return Ok(log);
        }

        let content = fs::read_to_string(path)?;
        let mut by_hash = log.by_hash.write().unwrap_or_else(PoisonError::into_inner);
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SecurityVerdict>(line) {
                Ok(verdict) => by_hash
                    .entry(verdict.artifact_sha256().to_string())
                    .or_default()
                    .push(Arc::new(verdict)),
                Err(e) => warn!(line = line_no + 1, error = %e, "Skipping unreadable verdict"),
            }
        }
        drop(by_hash);
        Ok(log)
    }

    pub fn append(&self, verdict: SecurityVerdict) -> Result<Arc<SecurityVerdict>, StorageError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(path) = &self.path {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            let mut line = serde_json::to_vec(&verdict)?;
            line.push(b'\n');
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            file.write_all(&line)?;
            file.sync_data()?;
        }

        let verdict = Arc::new(verdict);
        self.by_hash
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(verdict.artifact_sha256().to_string())
            .or_default()
            .push(Arc::clone(&verdict));
        Ok(verdict)
    }

    pub fn latest(&self, sha256: &str) -> Option<Arc<SecurityVerdict>> {
        let by_hash = self.by_hash.read().unwrap_or_else(PoisonError::into_inner);
        by_hash.get(sha256).and_then(|v| v.last()).cloned()
    }

    /// All verdicts for an artifact, oldest first
    pub fn history(&self, sha256: &str) -> Vec<Arc<SecurityVerdict>> {
        let by_hash = self.by_hash.read().unwrap_or_else(PoisonError::into_inner);
        by_hash.get(sha256).cloned().unwrap_or_default()
    }
}

type SharedValidation = Shared<BoxFuture<'static, Result<Arc<SecurityVerdict>, ValidationError>>>;

pub struct VerdictService {
    validator: Arc<SecurityValidator>,
    log: Arc<VerdictLog>,
    audit: Arc<dyn AuditSink>,
    in_flight: Mutex<HashMap<String, SharedValidation>>,
}

impl VerdictService {
    pub fn new(validator: SecurityValidator, log: Arc<VerdictLog>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            validator: Arc::new(validator),
            log,
            audit,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn log(&self) -> &Arc<VerdictLog> {
        &self.log
    }

    pub fn latest(&self, sha256: &str) -> Option<Arc<SecurityVerdict>> {
        self.log.latest(sha256)
    }

    /// Run a fresh validation and record the verdict
    pub async fn validate(&self, artifact: &ArtifactRecord) -> Result<Arc<SecurityVerdict>, ValidationError> {
        let sha256 = artifact.sha256.clone();
        let run = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(&sha256) {
                Some(existing) => {
                    debug!(sha256 = %sha256, "Joining in-flight validation");
                    existing.clone()
                }
                None => {
                    let run = self.spawn_validation(artifact.clone());
                    in_flight.insert(sha256.clone(), run.clone());
                    run
                }
            }
        };

        let result = run.clone().await;

        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight.get(&sha256).is_some_and(|current| current.ptr_eq(&run)) {
            in_flight.remove(&sha256);
        }
        result
    }

    /// Reuse the latest passing verdict for this content, validating otherwise
    pub async fn ensure(&self, artifact: &ArtifactRecord) -> Result<Arc<SecurityVerdict>, ValidationError> {
        match self.log.latest(&artifact.sha256) {
            Some(verdict) if verdict.passed() => Ok(verdict),
            _ => self.validate(artifact).await,
        }
    }

    fn spawn_validation(&self, artifact: ArtifactRecord) -> SharedValidation {
        let validator = Arc::clone(&self.validator);
        let log = Arc::clone(&self.log);
        let audit = Arc::clone(&self.audit);

        async move {
            let verdict = tokio::task::spawn_blocking(move || validator.validate(&artifact))
                .await
                .map_err(|e| ValidationError::Task(e.to_string()))?;
            let verdict = log
                .append(verdict)
                .map_err(|e| ValidationError::Storage(e.to_string()))?;
            audit.record(AuditRecord::Verdict {
                artifact_sha256: verdict.artifact_sha256().to_string(),
                plugin_id: verdict.plugin_id().map(str::to_string),
                passed: verdict.passed(),
                violations: verdict.violations().len(),
                at: verdict.evaluated_at(),
            });
            Ok(verdict)
        }
        .boxed()
        .shared()
    }
}
