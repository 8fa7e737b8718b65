//! Install and uninstall orchestration, plus the runtime composition root

use notehost_core::config::Config;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::{AuditSink, TracingAuditSink};
use crate::cache::{ArtifactCache, ArtifactRecord, is_sha256_hex};
use crate::events::EventBus;
use crate::facade::{HostServices, PluginApi};
use crate::fetcher::{ArtifactFetcher, FetchError};
use crate::gate::CapabilityGate;
use crate::handle::{HandleFactory, RuntimeHandleFactory};
use crate::manifest::{PluginMetadata, read_from_archive};
use crate::model::{PluginInfo, PluginStatus, SourceOrigin};
use crate::permissions::GrantLog;
use crate::registry::{LifecycleError, PluginRegistry, RegistryParts};
use crate::store::PluginStore;
use crate::validator::SecurityValidator;
use crate::verdicts::{VerdictLog, VerdictService};
use crate::{ErrorCategory, PluginError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallSource {
    Local(PathBuf),
    Remote { url: String },
}

#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub source: InstallSource,
    pub expected_checksum: Option<String>,
    /// Declared metadata; read from the archive's `plugin.toml` when absent
    pub metadata: Option<PluginMetadata>,
    /// Configured repository the artifact was obtained through, if any
    pub repository: Option<String>,
}

impl InstallRequest {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            source: InstallSource::Local(path.into()),
            expected_checksum: None,
            metadata: None,
            repository: None,
        }
    }

    pub fn remote(url: impl Into<String>) -> Self {
        Self {
            source: InstallSource::Remote { url: url.into() },
            expected_checksum: None,
            metadata: None,
            repository: None,
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.expected_checksum = Some(checksum.into());
        self
    }

    pub fn with_metadata(mut self, metadata: PluginMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Operator-facing summary of a refused install
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRejection {
    pub category: ErrorCategory,
    pub reasons: Vec<String>,
}

impl From<&PluginError> for InstallRejection {
    fn from(err: &PluginError) -> Self {
        Self {
            category: err.category(),
            reasons: err.reasons(),
        }
    }
}

pub struct PluginInstaller {
    fetcher: Arc<ArtifactFetcher>,
    verdicts: Arc<VerdictService>,
    registry: Arc<PluginRegistry>,
}

impl PluginInstaller {
    pub fn new(
        fetcher: Arc<ArtifactFetcher>,
        verdicts: Arc<VerdictService>,
        registry: Arc<PluginRegistry>,
    ) -> Self {
        Self {
            fetcher,
            verdicts,
            registry,
        }
    }

    fn cache(&self) -> &Arc<ArtifactCache> {
        self.fetcher.cache()
    }

    /// Bring an artifact into the cache without validating or registering it
    pub async fn acquire(
        &self,
        source: &InstallSource,
        expected_checksum: Option<&str>,
    ) -> Result<ArtifactRecord, PluginError> {
        match source {
            InstallSource::Remote { url } => Ok(self.fetcher.fetch(url, expected_checksum).await?),
            InstallSource::Local(path) => {
                let expected = match expected_checksum {
                    Some(raw) => {
                        let normalized = raw.trim().to_ascii_lowercase();
                        if !is_sha256_hex(&normalized) {
                            return Err(FetchError::InvalidChecksum(raw.to_string()).into());
                        }
                        Some(normalized)
                    }
                    None => None,
                };

                let cache = Arc::clone(self.cache());
                let path = path.clone();
                let artifact = tokio::task::spawn_blocking(move || cache.import_local(&path))
                    .await
                    .map_err(std::io::Error::other)??;

                if let Some(expected) = expected {
                    if artifact.sha256 != expected {
                        self.discard(&artifact);
                        return Err(FetchError::ChecksumMismatch {
                            expected,
                            actual: artifact.sha256,
                        }
                        .into());
                    }
                }
                Ok(artifact)
            }
        }
    }

    fn discard(&self, artifact: &ArtifactRecord) {
        if let Err(e) = self.cache().collect_garbage(&artifact.sha256) {
            warn!(sha256 = %artifact.sha256, error = %e, "Failed to discard artifact");
        }
    }

    /// Fetch or import, validate unless a passing verdict exists, then register.
    ///
    /// Nothing is registered unless every step succeeds. A rejected artifact
    /// is dropped from the cache if no installed plugin shares it.
    pub async fn install(&self, request: InstallRequest) -> Result<PluginInfo, PluginError> {
        let artifact = self
            .acquire(&request.source, request.expected_checksum.as_deref())
            .await?;

        let verdict = self.verdicts.ensure(&artifact).await?;
        if !verdict.passed() {
            self.discard(&artifact);
            return Err(LifecycleError::ValidationFailed {
                sha256: artifact.sha256.clone(),
                reasons: verdict.violations().iter().map(ToString::to_string).collect(),
            }
            .into());
        }

        let metadata = match request.metadata {
            Some(metadata) => metadata,
            None => {
                let path = artifact.local_path.clone();
                let read = tokio::task::spawn_blocking(move || read_from_archive(&path))
                    .await
                    .map_err(std::io::Error::other)?;
                match read {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        self.discard(&artifact);
                        return Err(LifecycleError::MalformedMetadata(e).into());
                    }
                }
            }
        };

        let origin = match request.repository {
            Some(id) => SourceOrigin::TrustedRepository { id },
            None => SourceOrigin::from(&artifact.downloaded_from),
        };

        match self.registry.register_with_origin(&artifact, metadata, origin) {
            Ok(info) => {
                info!(plugin_id = %info.id, sha256 = %info.checksum, "Plugin installed");
                Ok(info)
            }
            Err(e) => {
                self.discard(&artifact);
                Err(e.into())
            }
        }
    }

    /// Stop a plugin if needed and remove it
    pub async fn uninstall(&self, id: &str) -> Result<PluginInfo, PluginError> {
        let status = self
            .registry
            .status(id)
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
        match status {
            PluginStatus::Active => {
                self.registry.deactivate(id).await?;
            }
            PluginStatus::Error => {
                self.registry.reset(id)?;
            }
            PluginStatus::Registered | PluginStatus::Inactive => {}
        }
        let removed = self.registry.unregister(id)?;
        info!(plugin_id = id, "Plugin uninstalled");
        Ok(removed)
    }
}

/// Every plugin-runtime component, wired from one configuration
pub struct PluginRuntime {
    pub registry: Arc<PluginRegistry>,
    pub bus: Arc<EventBus>,
    pub installer: PluginInstaller,
    pub gate: CapabilityGate,
    pub verdicts: Arc<VerdictService>,
    pub fetcher: Arc<ArtifactFetcher>,
    pub grants: Arc<GrantLog>,
    pub audit: Arc<dyn AuditSink>,
}

impl PluginRuntime {
    /// Open with the default audit sink and runtime handle factory
    pub fn open_default(config: &Config) -> Result<Self, PluginError> {
        let factory = RuntimeHandleFactory::new(config.runtime.clone(), config.fetcher.allow_private_hosts);
        Self::open(config, Arc::new(TracingAuditSink), Arc::new(factory))
    }

    /// Open persisted state under `config.storage.data_dir` and start the bus.
    /// Must be called inside a Tokio runtime.
    pub fn open(
        config: &Config,
        audit: Arc<dyn AuditSink>,
        factory: Arc<dyn HandleFactory>,
    ) -> Result<Self, PluginError> {
        let storage = &config.storage;
        std::fs::create_dir_all(&storage.data_dir)?;

        let cache = Arc::new(ArtifactCache::open(&storage.cache_dir())?);
        let grants = Arc::new(GrantLog::open(&storage.grants_path())?);
        let verdict_log = Arc::new(VerdictLog::open(&storage.verdicts_path())?);

        let bus = Arc::new(EventBus::new(&config.events));
        bus.start();

        let registry = PluginRegistry::open(RegistryParts {
            verdicts: Arc::clone(&verdict_log),
            grants: Arc::clone(&grants),
            cache: Arc::clone(&cache),
            store: PluginStore::open(&storage.plugins_path()),
            bus: Arc::clone(&bus),
            factory,
            audit: Arc::clone(&audit),
        })?;

        let verdicts = Arc::new(VerdictService::new(
            SecurityValidator::new(config.validator.clone()),
            verdict_log,
            Arc::clone(&audit),
        ));
        let fetcher = Arc::new(ArtifactFetcher::new(config.fetcher.clone(), cache));
        let installer = PluginInstaller::new(
            Arc::clone(&fetcher),
            Arc::clone(&verdicts),
            Arc::clone(&registry),
        );
        let gate = CapabilityGate::new(Arc::clone(&registry), Arc::clone(&audit));

        Ok(Self {
            registry,
            bus,
            installer,
            gate,
            verdicts,
            fetcher,
            grants,
            audit,
        })
    }

    /// Host API bound to one plugin
    pub fn api(&self, plugin_id: &str, host: HostServices) -> PluginApi {
        PluginApi::new(plugin_id, self.gate.clone(), host)
    }

    /// Deactivate running plugins, then drain and stop the bus
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
        self.bus.shutdown().await;
    }
}
