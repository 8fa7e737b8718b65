//! Out-of-process plugins reached over HTTPS
//!
//! RPC plugins speak JSON-RPC 2.0; REST callback plugins receive each event
//! as a POST body. The host is checked against private ranges at activation,
//! and each handle's client stays pinned to the addresses that passed.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use super::{FaultReporter, HandleError, PluginHandle};
use crate::events::{EventListener, ListenerError, PluginEvent};
use crate::fetcher::{ensure_public_host, pin_resolution};
use crate::manifest::RuntimeKind;

pub const EVENT_HEADER: &str = "X-Notehost-Event";

/// Vet `raw` and build a client that can only reach the vetted addresses
async fn pinned_client(
    raw: &str,
    allow_private: bool,
    timeout: Duration,
) -> Result<(Url, reqwest::Client), HandleError> {
    let url = Url::parse(raw).map_err(|e| HandleError::Load(format!("invalid url '{}': {}", raw, e)))?;
    if url.scheme() != "https" {
        return Err(HandleError::Load(format!("'{}' must use https", raw)));
    }
    let vetted = ensure_public_host(&url, allow_private)
        .await
        .map_err(|e| HandleError::Network(e.to_string()))?;

    let builder = reqwest::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .user_agent(concat!("notehost/", env!("CARGO_PKG_VERSION")));
    let client = pin_resolution(builder, &url, &vetted).build()?;
    debug!(url = %url, addresses = vetted.len(), "Pinned plugin endpoint");
    Ok((url, client))
}

struct RpcClient {
    plugin_id: String,
    endpoint: Url,
    client: reqwest::Client,
    next_id: AtomicU64,
    closed: AtomicBool,
    faults: FaultReporter,
}

impl RpcClient {
    async fn call(&self, method: &str, params: Value) -> Result<Value, HandleError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(HandleError::Rpc(format!("{} returned HTTP {}", method, status)));
        }

        let body: Value = response.json().await?;
        if let Some(error) = body.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(HandleError::Rpc(format!("{}: {}", method, message)));
        }
        if body.get("id").and_then(Value::as_u64) != Some(id) {
            return Err(HandleError::Rpc(format!("{}: response id mismatch", method)));
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }
}

pub struct RpcHandle {
    client: Arc<RpcClient>,
}

impl RpcHandle {
    /// Check the endpoint and ping it; activation fails if the plugin does not answer
    pub async fn connect(
        plugin_id: &str,
        endpoint: &str,
        timeout: Duration,
        allow_private: bool,
        faults: FaultReporter,
    ) -> Result<Self, HandleError> {
        let (endpoint, client) = pinned_client(endpoint, allow_private, timeout).await?;
        let rpc = Arc::new(RpcClient {
            plugin_id: plugin_id.to_string(),
            endpoint,
            client,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            faults,
        });
        rpc.call("plugin.ping", json!({ "plugin_id": plugin_id })).await?;
        info!(plugin_id, endpoint = %rpc.endpoint, "RPC plugin connected");
        Ok(Self { client: rpc })
    }
}

struct RpcListener {
    client: Arc<RpcClient>,
    name: String,
}

#[async_trait]
impl EventListener for RpcListener {
    async fn on_event(&self, event: &PluginEvent) -> Result<(), ListenerError> {
        if self.client.closed.load(Ordering::Acquire) {
            return Err(ListenerError::new("plugin is not active"));
        }
        let params = serde_json::to_value(event).map_err(|e| ListenerError::new(e.to_string()))?;
        match self.client.call("plugin.on_event", params).await {
            Ok(_) => Ok(()),
            Err(HandleError::Rpc(message)) => {
                // The plugin answered with a protocol error; it is up but broken
                self.client.faults.report(message.clone());
                Err(ListenerError::new(message))
            }
            Err(e) => Err(ListenerError::new(e.to_string())),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl PluginHandle for RpcHandle {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Rpc
    }

    fn listener(&self, event_type: &str) -> Arc<dyn EventListener> {
        Arc::new(RpcListener {
            client: Arc::clone(&self.client),
            name: format!("{}:{}", self.client.plugin_id, event_type),
        })
    }

    async fn shutdown(&self) {
        self.client.closed.store(true, Ordering::Release);
        debug!(plugin_id = %self.client.plugin_id, "RPC plugin handle closed");
    }
}

struct Callback {
    plugin_id: String,
    url: Url,
    client: reqwest::Client,
    closed: AtomicBool,
}

pub struct RestCallbackHandle {
    callback: Arc<Callback>,
}

impl RestCallbackHandle {
    pub async fn connect(
        plugin_id: &str,
        url: &str,
        timeout: Duration,
        allow_private: bool,
    ) -> Result<Self, HandleError> {
        let (url, client) = pinned_client(url, allow_private, timeout).await?;
        info!(plugin_id, url = %url, "REST callback plugin ready");
        Ok(Self {
            callback: Arc::new(Callback {
                plugin_id: plugin_id.to_string(),
                url,
                client,
                closed: AtomicBool::new(false),
            }),
        })
    }
}

struct CallbackListener {
    callback: Arc<Callback>,
    name: String,
}

#[async_trait]
impl EventListener for CallbackListener {
    async fn on_event(&self, event: &PluginEvent) -> Result<(), ListenerError> {
        if self.callback.closed.load(Ordering::Acquire) {
            return Err(ListenerError::new("plugin is not active"));
        }
        let response = self
            .callback
            .client
            .post(self.callback.url.clone())
            .header(EVENT_HEADER, event.event_type())
            .json(event)
            .send()
            .await
            .map_err(|e| ListenerError::new(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ListenerError::new(format!(
                "callback returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl PluginHandle for RestCallbackHandle {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::RestCallback
    }

    fn listener(&self, event_type: &str) -> Arc<dyn EventListener> {
        Arc::new(CallbackListener {
            callback: Arc::clone(&self.callback),
            name: format!("{}:{}", self.callback.plugin_id, event_type),
        })
    }

    async fn shutdown(&self) {
        self.callback.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn reporter() -> FaultReporter {
        let (tx, _rx) = mpsc::unbounded_channel();
        FaultReporter::new("remote", tx)
    }

    #[tokio::test]
    async fn test_rpc_to_loopback_refused() {
        let err = RpcHandle::connect(
            "remote",
            "https://127.0.0.1:9443/rpc",
            Duration::from_secs(5),
            false,
            reporter(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, HandleError::Network(m) if m.contains("private")));
    }

    #[tokio::test]
    async fn test_callback_requires_https() {
        let err = RestCallbackHandle::connect(
            "remote",
            "http://hooks.example.com/notehost",
            Duration::from_secs(5),
            false,
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, HandleError::Load(_)));
    }

    #[tokio::test]
    async fn test_callback_to_metadata_service_refused() {
        let result = RestCallbackHandle::connect(
            "remote",
            "https://169.254.169.254/hook",
            Duration::from_secs(5),
            false,
        )
        .await;
        assert!(result.is_err());
    }
}
