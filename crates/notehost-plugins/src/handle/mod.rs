//! Runtime handles for active plugins
//!
//! A handle is created when a plugin is activated and dropped when it is
//! deactivated. It turns bus events into calls on the plugin's code, wherever
//! that code lives.

pub mod queue;
pub mod remote;
pub mod sandbox;

use async_trait::async_trait;
use notehost_core::config::RuntimeConfig;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::cache::ArtifactRecord;
use crate::events::{EventListener, PluginEvent};
use crate::manifest::{RuntimeKind, RuntimeSpec};
use crate::model::PluginInfo;

#[derive(Error, Debug)]
pub enum HandleError {
    #[error("failed to load plugin code: {0}")]
    Load(String),

    #[error("wasm error: {0}")]
    Wasm(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("plugin RPC error: {0}")]
    Rpc(String),

    #[error("plugin IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for HandleError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// A fault raised by a running plugin outside any lifecycle call
#[derive(Debug, Clone, PartialEq)]
pub struct PluginFault {
    pub plugin_id: String,
    pub reason: String,
}

/// Lets a handle push faults to the registry, which moves the plugin to ERROR
#[derive(Debug, Clone)]
pub struct FaultReporter {
    plugin_id: String,
    tx: mpsc::UnboundedSender<PluginFault>,
}

impl FaultReporter {
    pub fn new(plugin_id: &str, tx: mpsc::UnboundedSender<PluginFault>) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            tx,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn report(&self, reason: impl Into<String>) {
        let fault = PluginFault {
            plugin_id: self.plugin_id.clone(),
            reason: reason.into(),
        };
        if self.tx.send(fault).is_err() {
            warn!(plugin_id = %self.plugin_id, "Fault monitor is gone; dropping fault");
        }
    }
}

#[async_trait]
pub trait PluginHandle: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    /// Listener that forwards events of `event_type` to the plugin
    fn listener(&self, event_type: &str) -> Arc<dyn EventListener>;

    /// Release the plugin's resources. Called once, on deactivation.
    async fn shutdown(&self);

    /// Receiving end of a queue-consumer plugin's inbox, handed out once
    fn take_queue(&self) -> Option<mpsc::Receiver<PluginEvent>> {
        None
    }
}

#[async_trait]
pub trait HandleFactory: Send + Sync {
    async fn create(
        &self,
        plugin: &PluginInfo,
        artifact: &ArtifactRecord,
        faults: FaultReporter,
    ) -> Result<Arc<dyn PluginHandle>, HandleError>;
}

/// Builds handles for every runtime kind a manifest can declare
pub struct RuntimeHandleFactory {
    config: RuntimeConfig,
    allow_private_hosts: bool,
}

impl RuntimeHandleFactory {
    pub fn new(config: RuntimeConfig, allow_private_hosts: bool) -> Self {
        Self {
            config,
            allow_private_hosts,
        }
    }

    fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.config.callback_timeout_secs)
    }
}

#[async_trait]
impl HandleFactory for RuntimeHandleFactory {
    async fn create(
        &self,
        plugin: &PluginInfo,
        artifact: &ArtifactRecord,
        faults: FaultReporter,
    ) -> Result<Arc<dyn PluginHandle>, HandleError> {
        match &plugin.runtime {
            RuntimeSpec::InProcess { entry } => {
                let handle = sandbox::WasmHandle::load(
                    &plugin.id,
                    artifact.local_path.clone(),
                    entry.clone(),
                    &self.config,
                    faults,
                )
                .await?;
                Ok(Arc::new(handle))
            }
            RuntimeSpec::Rpc { endpoint } => {
                let handle = remote::RpcHandle::connect(
                    &plugin.id,
                    endpoint,
                    self.callback_timeout(),
                    self.allow_private_hosts,
                    faults,
                )
                .await?;
                Ok(Arc::new(handle))
            }
            RuntimeSpec::RestCallback { url } => {
                let handle = remote::RestCallbackHandle::connect(
                    &plugin.id,
                    url,
                    self.callback_timeout(),
                    self.allow_private_hosts,
                )
                .await?;
                Ok(Arc::new(handle))
            }
            RuntimeSpec::QueueConsumer { capacity } => {
                let capacity = capacity.unwrap_or(self.config.queue_capacity);
                Ok(Arc::new(queue::QueueHandle::new(&plugin.id, capacity)))
            }
        }
    }
}
