//! Queue-consumer plugins: events are buffered for the plugin to drain

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::PluginHandle;
use crate::events::{EventListener, ListenerError, PluginEvent};
use crate::manifest::RuntimeKind;

struct Inbox {
    plugin_id: String,
    tx: mpsc::Sender<PluginEvent>,
    closed: AtomicBool,
}

pub struct QueueHandle {
    inbox: Arc<Inbox>,
    rx: Mutex<Option<mpsc::Receiver<PluginEvent>>>,
}

impl QueueHandle {
    pub fn new(plugin_id: &str, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            inbox: Arc::new(Inbox {
                plugin_id: plugin_id.to_string(),
                tx,
                closed: AtomicBool::new(false),
            }),
            rx: Mutex::new(Some(rx)),
        }
    }
}

struct QueueListener {
    inbox: Arc<Inbox>,
    name: String,
}

#[async_trait]
impl EventListener for QueueListener {
    async fn on_event(&self, event: &PluginEvent) -> Result<(), ListenerError> {
        if self.inbox.closed.load(Ordering::Acquire) {
            return Err(ListenerError::new("plugin is not active"));
        }
        self.inbox.tx.try_send(event.clone()).map_err(|e| match e {
            TrySendError::Full(_) => ListenerError::new(format!(
                "inbox for '{}' is full",
                self.inbox.plugin_id
            )),
            TrySendError::Closed(_) => ListenerError::new("inbox consumer has gone away"),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl PluginHandle for QueueHandle {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::QueueConsumer
    }

    fn listener(&self, event_type: &str) -> Arc<dyn EventListener> {
        Arc::new(QueueListener {
            inbox: Arc::clone(&self.inbox),
            name: format!("{}:{}", self.inbox.plugin_id, event_type),
        })
    }

    async fn shutdown(&self) {
        self.inbox.closed.store(true, Ordering::Release);
        self.rx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn take_queue(&self) -> Option<mpsc::Receiver<PluginEvent>> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    #[tokio::test]
    async fn test_events_reach_queue_in_order() {
        let handle = QueueHandle::new("inbox", 4);
        let listener = handle.listener("note.created");
        let mut rx = handle.take_queue().unwrap();
        assert!(handle.take_queue().is_none());

        for i in 0..3u64 {
            let event = PluginEvent::new(EventKind::NoteCreated, "test").with_metadata("i", i);
            listener.on_event(&event).await.unwrap();
        }
        for i in 0..3u64 {
            assert_eq!(rx.recv().await.unwrap().metadata()["i"], i);
        }
    }

    #[tokio::test]
    async fn test_full_inbox_is_listener_error() {
        let handle = QueueHandle::new("inbox", 1);
        let listener = handle.listener("note.created");
        let event = PluginEvent::new(EventKind::NoteCreated, "test");
        listener.on_event(&event).await.unwrap();
        let err = listener.on_event(&event).await.unwrap_err();
        assert!(err.0.contains("full"));
    }

    #[tokio::test]
    async fn test_shutdown_closes_listener() {
        let handle = QueueHandle::new("inbox", 4);
        let listener = handle.listener("note.created");
        handle.shutdown().await;
        let event = PluginEvent::new(EventKind::NoteCreated, "test");
        assert!(listener.on_event(&event).await.is_err());
    }
}
