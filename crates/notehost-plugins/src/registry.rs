//! Plugin registry and lifecycle state machine
//!
//! ```text
//!   register ──► REGISTERED ──activate──► ACTIVE ──deactivate──► INACTIVE
//!                    │  ▲                   │  ▲                    │
//!                    │  └── (load failure)  │  └──────activate──────┘
//!                    │         ▼            ▼ fault
//!                    │       ERROR ◄────────┘
//!                    │         └──reset──► INACTIVE
//!                    └─unregister (also from INACTIVE)
//! ```
//!
//! Each plugin has its own slot lock. A transition marks the slot pending
//! while it does slow work (loading code, shutting a handle down) with no
//! lock held, so a competing transition on the same id fails fast with
//! `ConcurrentTransition` instead of waiting or interleaving.
//!
//! Lock order is store, then plugin map, then slot. No lock is held across
//! an await.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditRecord, AuditSink};
use crate::cache::{ArtifactCache, ArtifactRecord};
use crate::events::{EventBus, PluginEvent, SubscriptionId};
use crate::handle::{FaultReporter, HandleFactory, PluginFault, PluginHandle};
use crate::manifest::{MetadataError, PluginMetadata};
use crate::model::{PluginInfo, PluginStatus, SourceOrigin};
use crate::permissions::{GrantLog, GrantedPermission, Permission};
use crate::store::{PluginStore, StorageError};
use crate::verdicts::VerdictLog;

/// Actor recorded on revocations the registry makes itself
const SYSTEM_ACTOR: &str = "system";

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error(transparent)]
    MalformedMetadata(#[from] MetadataError),

    #[error("artifact {sha256} has not passed security validation")]
    ValidationFailed { sha256: String, reasons: Vec<String> },

    #[error("plugin '{0}' is already registered")]
    DuplicateId(String),

    #[error("plugin '{0}' is not registered")]
    NotFound(String),

    #[error("cannot {operation} plugin '{plugin_id}' while it is {status}")]
    IllegalTransition {
        plugin_id: String,
        operation: &'static str,
        status: PluginStatus,
    },

    #[error("plugin '{0}' is already changing state")]
    ConcurrentTransition(String),

    #[error("plugin '{plugin_id}' failed to load: {reason}")]
    LoadFailed { plugin_id: String, reason: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Activating,
    Deactivating,
    Faulting,
}

struct SlotState {
    info: PluginInfo,
    pending: Option<Transition>,
    handle: Option<Arc<dyn PluginHandle>>,
    subscriptions: Vec<(String, SubscriptionId)>,
    /// Set under the slot lock once the slot leaves the plugin map.
    removed: bool,
}

pub(crate) struct PluginSlot {
    state: Mutex<SlotState>,
}

impl PluginSlot {
    fn new(info: PluginInfo) -> Self {
        Self {
            state: Mutex::new(SlotState {
                info,
                pending: None,
                handle: None,
                subscriptions: Vec::new(),
                removed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock a slot that callers looked up earlier. A slot unregistered in
    /// the meantime reads as missing.
    fn lock_live(&self, id: &str) -> Result<MutexGuard<'_, SlotState>, LifecycleError> {
        let state = self.lock();
        if state.removed {
            return Err(LifecycleError::NotFound(id.to_string()));
        }
        Ok(state)
    }
}

/// Collaborators the registry is wired to
pub struct RegistryParts {
    pub verdicts: Arc<VerdictLog>,
    pub grants: Arc<GrantLog>,
    pub cache: Arc<ArtifactCache>,
    pub store: PluginStore,
    pub bus: Arc<EventBus>,
    pub factory: Arc<dyn HandleFactory>,
    pub audit: Arc<dyn AuditSink>,
}

pub struct PluginRegistry {
    slots: RwLock<HashMap<String, Arc<PluginSlot>>>,
    verdicts: Arc<VerdictLog>,
    grants: Arc<GrantLog>,
    cache: Arc<ArtifactCache>,
    store: PluginStore,
    bus: Arc<EventBus>,
    factory: Arc<dyn HandleFactory>,
    audit: Arc<dyn AuditSink>,
    faults: mpsc::UnboundedSender<PluginFault>,
}

impl PluginRegistry {
    /// Restore the persisted plugin table and start the fault monitor.
    ///
    /// Plugins persisted as ACTIVE come back INACTIVE: their runtime handles
    /// did not survive the restart. Must be called inside a Tokio runtime.
    pub fn open(parts: RegistryParts) -> Result<Arc<Self>, LifecycleError> {
        let persisted = parts.store.load()?;
        let mut restored_active = 0;
        let mut slots = HashMap::with_capacity(persisted.len());
        for mut info in persisted {
            if info.status == PluginStatus::Active {
                info.status = PluginStatus::Inactive;
                info.updated_at = Utc::now();
                restored_active += 1;
            }
            slots.insert(info.id.clone(), Arc::new(PluginSlot::new(info)));
        }

        parts.cache.restore_refs(
            slots
                .values()
                .map(|slot| slot.lock().info.checksum.clone())
                .collect::<Vec<_>>()
                .iter()
                .map(String::as_str),
        );

        let (faults, fault_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            slots: RwLock::new(slots),
            verdicts: parts.verdicts,
            grants: parts.grants,
            cache: parts.cache,
            store: parts.store,
            bus: parts.bus,
            factory: parts.factory,
            audit: parts.audit,
            faults,
        });

        if restored_active > 0 {
            registry.persist()?;
        }
        tokio::spawn(monitor_faults(Arc::downgrade(&registry), fault_rx));

        info!(plugins = registry.list().len(), restored_active, "Plugin registry opened");
        Ok(registry)
    }

    pub(crate) fn slot(&self, id: &str) -> Result<Arc<PluginSlot>, LifecycleError> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots
            .get(id)
            .cloned()
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))
    }

    fn persist(&self) -> Result<(), LifecycleError> {
        let guard = self.store.lock();
        let mut snapshot: Vec<PluginInfo> = {
            let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
            slots.values().map(|slot| slot.lock().info.clone()).collect()
        };
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));
        self.store.save(&guard, &snapshot)?;
        Ok(())
    }

    /// Persist after an in-memory transition already happened; a failure is
    /// logged and surfaced without undoing the transition
    fn persist_after(&self, plugin_id: &str) -> Result<(), LifecycleError> {
        self.persist().inspect_err(|e| {
            error!(plugin_id, error = %e, "Failed to persist plugin table");
        })
    }

    fn audit_transition(
        &self,
        plugin_id: &str,
        from: Option<PluginStatus>,
        to: Option<PluginStatus>,
        operation: &str,
    ) {
        self.audit.record(AuditRecord::Transition {
            plugin_id: plugin_id.to_string(),
            from,
            to,
            operation: operation.to_string(),
            at: Utc::now(),
        });
    }

    pub fn register(
        &self,
        artifact: &ArtifactRecord,
        metadata: PluginMetadata,
    ) -> Result<PluginInfo, LifecycleError> {
        let origin = SourceOrigin::from(&artifact.downloaded_from);
        self.register_with_origin(artifact, metadata, origin)
    }

    /// Admit a validated artifact under `metadata.id`.
    ///
    /// The latest verdict recorded for the artifact's hash must be a pass.
    pub fn register_with_origin(
        &self,
        artifact: &ArtifactRecord,
        metadata: PluginMetadata,
        origin: SourceOrigin,
    ) -> Result<PluginInfo, LifecycleError> {
        metadata.validate()?;

        match self.verdicts.latest(&artifact.sha256) {
            Some(verdict) if verdict.passed() => {}
            Some(verdict) => {
                return Err(LifecycleError::ValidationFailed {
                    sha256: artifact.sha256.clone(),
                    reasons: verdict.violations().iter().map(ToString::to_string).collect(),
                });
            }
            None => {
                return Err(LifecycleError::ValidationFailed {
                    sha256: artifact.sha256.clone(),
                    reasons: vec!["no security verdict recorded for this artifact".to_string()],
                });
            }
        }

        let info = PluginInfo::from_metadata(metadata, &artifact.sha256, origin);
        {
            let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
            if slots.contains_key(&info.id) {
                return Err(LifecycleError::DuplicateId(info.id));
            }
            self.cache
                .retain(&artifact.sha256)
                .map_err(StorageError::from)?;
            slots.insert(info.id.clone(), Arc::new(PluginSlot::new(info.clone())));
        }

        info!(plugin_id = %info.id, version = %info.version, sha256 = %info.checksum, "Plugin registered");
        if let Err(e) = self.persist_after(&info.id) {
            self.rollback_register(&info);
            return Err(e);
        }
        self.audit_transition(&info.id, None, Some(PluginStatus::Registered), "register");
        Ok(info)
    }

    /// Undo a registration whose table write failed
    fn rollback_register(&self, info: &PluginInfo) {
        let slot = {
            let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
            slots.remove(&info.id)
        };
        if let Some(slot) = slot {
            slot.lock().removed = true;
        }
        if let Err(e) = self.cache.release(&info.checksum) {
            warn!(plugin_id = %info.id, error = %e, "Failed to release artifact after rollback");
        }
        warn!(plugin_id = %info.id, "Registration rolled back");
    }

    /// Load the plugin's runtime handle and attach its listeners.
    ///
    /// Activating an ACTIVE plugin is a no-op that returns the current record.
    pub async fn activate(&self, id: &str) -> Result<PluginInfo, LifecycleError> {
        let slot = self.slot(id)?;
        self.activate_slot(id, slot).await
    }

    pub(crate) async fn activate_slot(
        &self,
        id: &str,
        slot: Arc<PluginSlot>,
    ) -> Result<PluginInfo, LifecycleError> {
        let (info, from) = {
            let mut state = slot.lock_live(id)?;
            if state.pending.is_some() {
                return Err(LifecycleError::ConcurrentTransition(id.to_string()));
            }
            match state.info.status {
                PluginStatus::Active => {
                    debug!(plugin_id = id, "Plugin already active");
                    return Ok(state.info.clone());
                }
                PluginStatus::Error => {
                    return Err(LifecycleError::IllegalTransition {
                        plugin_id: id.to_string(),
                        operation: "activate",
                        status: PluginStatus::Error,
                    });
                }
                PluginStatus::Registered | PluginStatus::Inactive => {}
            }
            state.pending = Some(Transition::Activating);
            (state.info.clone(), state.info.status)
        };

        let loaded = self.load_handle(&info).await;

        match loaded {
            Ok((handle, subscriptions)) => {
                let snapshot = {
                    let mut state = slot.lock();
                    state.pending = None;
                    state.handle = Some(handle);
                    state.subscriptions = subscriptions;
                    state.info.status = PluginStatus::Active;
                    state.info.last_error = None;
                    state.info.updated_at = Utc::now();
                    state.info.clone()
                };
                info!(plugin_id = id, runtime = %snapshot.runtime.kind(), "Plugin activated");
                self.audit_transition(id, Some(from), Some(PluginStatus::Active), "activate");
                self.persist_after(id)?;
                let _ = self.bus.publish_async(PluginEvent::plugin_activated(id));
                Ok(snapshot)
            }
            Err(reason) => {
                {
                    let mut state = slot.lock();
                    state.pending = None;
                    state.info.status = PluginStatus::Error;
                    state.info.last_error = Some(reason.clone());
                    state.info.updated_at = Utc::now();
                }
                warn!(plugin_id = id, %reason, "Plugin failed to activate");
                self.audit_transition(id, Some(from), Some(PluginStatus::Error), "activate");
                self.persist_after(id)?;
                Err(LifecycleError::LoadFailed {
                    plugin_id: id.to_string(),
                    reason,
                })
            }
        }
    }

    async fn load_handle(
        &self,
        info: &PluginInfo,
    ) -> Result<(Arc<dyn PluginHandle>, Vec<(String, SubscriptionId)>), String> {
        let artifact = self
            .cache
            .lookup(&info.checksum)
            .ok_or_else(|| format!("artifact {} is missing from the cache", info.checksum))?;

        let reporter = FaultReporter::new(&info.id, self.faults.clone());
        let handle = self
            .factory
            .create(info, &artifact, reporter)
            .await
            .map_err(|e| e.to_string())?;

        let mut subscriptions = Vec::with_capacity(info.subscriptions.len());
        for event_type in &info.subscriptions {
            match self.bus.subscribe(event_type, handle.listener(event_type)) {
                Ok(sub) => subscriptions.push((event_type.clone(), sub)),
                Err(e) => {
                    self.detach(&subscriptions);
                    handle.shutdown().await;
                    return Err(e.to_string());
                }
            }
        }
        Ok((handle, subscriptions))
    }

    fn detach(&self, subscriptions: &[(String, SubscriptionId)]) {
        for (event_type, sub) in subscriptions {
            self.bus.unsubscribe(event_type, *sub);
        }
    }

    /// Detach listeners and release the runtime handle.
    ///
    /// INACTIVE and ERROR plugins have nothing attached, so deactivating them
    /// is a no-op; this keeps fault recovery paths free to call it blindly.
    pub async fn deactivate(&self, id: &str) -> Result<PluginInfo, LifecycleError> {
        let slot = self.slot(id)?;
        let (handle, subscriptions) = {
            let mut state = slot.lock_live(id)?;
            if state.pending.is_some() {
                return Err(LifecycleError::ConcurrentTransition(id.to_string()));
            }
            match state.info.status {
                PluginStatus::Active => {}
                PluginStatus::Inactive | PluginStatus::Error => return Ok(state.info.clone()),
                PluginStatus::Registered => {
                    return Err(LifecycleError::IllegalTransition {
                        plugin_id: id.to_string(),
                        operation: "deactivate",
                        status: PluginStatus::Registered,
                    });
                }
            }
            state.pending = Some(Transition::Deactivating);
            (state.handle.take(), std::mem::take(&mut state.subscriptions))
        };

        self.detach(&subscriptions);
        if let Some(handle) = handle {
            handle.shutdown().await;
        }

        let snapshot = {
            let mut state = slot.lock();
            state.pending = None;
            state.info.status = PluginStatus::Inactive;
            state.info.updated_at = Utc::now();
            state.info.clone()
        };
        info!(plugin_id = id, "Plugin deactivated");
        self.audit_transition(id, Some(PluginStatus::Active), Some(PluginStatus::Inactive), "deactivate");
        self.persist_after(id)?;
        let _ = self.bus.publish_async(PluginEvent::plugin_deactivated(id));
        Ok(snapshot)
    }

    /// Remove a plugin, revoke its grants, and drop its artifact reference
    pub fn unregister(&self, id: &str) -> Result<PluginInfo, LifecycleError> {
        let removed = {
            let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
            let slot = slots
                .get(id)
                .cloned()
                .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
            let mut state = slot.lock();
            if state.pending.is_some() {
                return Err(LifecycleError::ConcurrentTransition(id.to_string()));
            }
            match state.info.status {
                PluginStatus::Registered | PluginStatus::Inactive => {}
                status => {
                    return Err(LifecycleError::IllegalTransition {
                        plugin_id: id.to_string(),
                        operation: "unregister",
                        status,
                    });
                }
            }
            let info = state.info.clone();
            state.removed = true;
            drop(state);
            slots.remove(id);
            info
        };

        let revoked = self.grants.revoke_all(id, SYSTEM_ACTOR)?;
        for permission in &revoked {
            self.audit.record(AuditRecord::Grant {
                plugin_id: id.to_string(),
                permission: *permission,
                actor: SYSTEM_ACTOR.to_string(),
                revoked: true,
                at: Utc::now(),
            });
        }

        match self.cache.release(&removed.checksum) {
            Ok(true) => debug!(plugin_id = id, sha256 = %removed.checksum, "Artifact collected"),
            Ok(false) => {}
            Err(e) => warn!(plugin_id = id, error = %e, "Failed to collect artifact"),
        }

        info!(plugin_id = id, revoked = revoked.len(), "Plugin unregistered");
        self.audit_transition(id, Some(removed.status), None, "unregister");
        self.persist_after(id)?;
        Ok(removed)
    }

    /// Clear an ERROR so the plugin can be activated again
    pub fn reset(&self, id: &str) -> Result<PluginInfo, LifecycleError> {
        let slot = self.slot(id)?;
        let snapshot = {
            let mut state = slot.lock_live(id)?;
            if state.pending.is_some() {
                return Err(LifecycleError::ConcurrentTransition(id.to_string()));
            }
            if state.info.status != PluginStatus::Error {
                return Err(LifecycleError::IllegalTransition {
                    plugin_id: id.to_string(),
                    operation: "reset",
                    status: state.info.status,
                });
            }
            state.info.status = PluginStatus::Inactive;
            state.info.last_error = None;
            state.info.updated_at = Utc::now();
            state.info.clone()
        };
        info!(plugin_id = id, "Plugin reset");
        self.audit_transition(id, Some(PluginStatus::Error), Some(PluginStatus::Inactive), "reset");
        self.persist_after(id)?;
        Ok(snapshot)
    }

    /// Move an ACTIVE plugin to ERROR after a runtime fault.
    ///
    /// Returns false when the plugin is not active (or is mid-transition), in
    /// which case the fault is only logged.
    pub async fn report_fault(&self, id: &str, reason: &str) -> Result<bool, LifecycleError> {
        let slot = self.slot(id)?;
        let (handle, subscriptions) = {
            let mut state = slot.lock_live(id)?;
            if state.pending.is_some() || state.info.status != PluginStatus::Active {
                debug!(plugin_id = id, reason, "Ignoring fault for plugin that is not active");
                return Ok(false);
            }
            state.pending = Some(Transition::Faulting);
            (state.handle.take(), std::mem::take(&mut state.subscriptions))
        };

        self.detach(&subscriptions);
        if let Some(handle) = handle {
            handle.shutdown().await;
        }

        {
            let mut state = slot.lock();
            state.pending = None;
            state.info.status = PluginStatus::Error;
            state.info.last_error = Some(reason.to_string());
            state.info.updated_at = Utc::now();
        }
        error!(plugin_id = id, reason, "Plugin faulted");
        self.audit.record(AuditRecord::Fault {
            plugin_id: id.to_string(),
            reason: reason.to_string(),
            at: Utc::now(),
        });
        self.audit_transition(id, Some(PluginStatus::Active), Some(PluginStatus::Error), "fault");
        self.persist_after(id)?;
        Ok(true)
    }

    /// Deactivate everything that is running
    pub async fn shutdown(&self) {
        for info in self.list() {
            if info.status == PluginStatus::Active {
                if let Err(e) = self.deactivate(&info.id).await {
                    warn!(plugin_id = %info.id, error = %e, "Failed to deactivate during shutdown");
                }
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<PluginInfo> {
        self.slot(id).ok().map(|slot| slot.lock().info.clone())
    }

    pub fn status(&self, id: &str) -> Option<PluginStatus> {
        self.slot(id).ok().map(|slot| slot.lock().info.status)
    }

    /// Snapshot of every plugin, sorted by id
    pub fn list(&self) -> Vec<PluginInfo> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let mut plugins: Vec<PluginInfo> = slots.values().map(|slot| slot.lock().info.clone()).collect();
        plugins.sort_by(|a, b| a.id.cmp(&b.id));
        plugins
    }

    pub fn granted_permissions(&self, id: &str) -> Vec<GrantedPermission> {
        self.grants.granted(id)
    }

    pub fn has_grant(&self, id: &str, permission: Permission) -> bool {
        self.grants.has(id, permission)
    }

    /// Operator grant. The plugin's declared permissions play no part here.
    pub fn grant_permission(
        &self,
        id: &str,
        permission: Permission,
        granted_by: &str,
    ) -> Result<GrantedPermission, LifecycleError> {
        let slot = self.slot(id)?;
        let grant = {
            let _live = slot.lock_live(id)?;
            self.grants.grant(id, permission, granted_by)?
        };
        self.audit.record(AuditRecord::Grant {
            plugin_id: id.to_string(),
            permission,
            actor: granted_by.to_string(),
            revoked: false,
            at: grant.granted_at,
        });
        Ok(grant)
    }

    pub fn revoke_permission(
        &self,
        id: &str,
        permission: Permission,
        actor: &str,
    ) -> Result<bool, LifecycleError> {
        let slot = self.slot(id)?;
        let revoked = {
            let _live = slot.lock_live(id)?;
            self.grants.revoke(id, permission, actor)?
        };
        if revoked {
            self.audit.record(AuditRecord::Grant {
                plugin_id: id.to_string(),
                permission,
                actor: actor.to_string(),
                revoked: true,
                at: Utc::now(),
            });
        }
        Ok(revoked)
    }

    /// Hand out a queue-consumer plugin's inbox. Only the first call after
    /// activation gets it.
    pub fn take_queue(&self, id: &str) -> Result<Option<mpsc::Receiver<PluginEvent>>, LifecycleError> {
        let slot = self.slot(id)?;
        let state = slot.lock_live(id)?;
        Ok(state.handle.as_ref().and_then(|handle| handle.take_queue()))
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }
}

async fn monitor_faults(registry: Weak<PluginRegistry>, mut faults: mpsc::UnboundedReceiver<PluginFault>) {
    while let Some(fault) = faults.recv().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };
        if let Err(e) = registry.report_fault(&fault.plugin_id, &fault.reason).await {
            warn!(plugin_id = %fault.plugin_id, error = %e, "Could not record plugin fault");
        }
    }
}
