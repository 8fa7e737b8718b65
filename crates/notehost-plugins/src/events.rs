//! Host events and the plugin event bus
//!
//! `publish` delivers on the caller's task and returns once every listener
//! has run. `publish_async` hands the event to a worker pool; events are
//! sharded by type so each type is delivered in publish order. A failing or
//! panicking listener never stops delivery to the others.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use notehost_core::config::EventsConfig;
use notehost_core::domain::{AttachmentMeta, Note, User};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::hash::{BuildHasher, RandomState};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Source recorded on events raised by the host itself
pub const HOST_SOURCE: &str = "notehost";

/// Derive the dotted event type from an event kind name:
/// `UserLoggedInEvent` becomes `user.logged_in`.
pub fn canonical_event_type(kind_name: &str) -> String {
    let name = match kind_name.strip_suffix("Event") {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => kind_name,
    };

    let mut out = String::with_capacity(name.len() + 4);
    let mut prev: Option<char> = None;
    let mut separators = 0;
    for c in name.chars() {
        if c.is_uppercase() && prev.is_some_and(|p| p.is_lowercase() || p.is_ascii_digit()) {
            out.push(if separators == 0 { '.' } else { '_' });
            separators += 1;
        }
        out.extend(c.to_lowercase());
        prev = Some(c);
    }
    out
}

/// Whether `value` has the shape produced by [`canonical_event_type`]
pub fn is_canonical_event_type(value: &str) -> bool {
    fn word(s: &str) -> bool {
        !s.is_empty() && s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    }

    let (domain, action) = match value.split_once('.') {
        Some((domain, action)) => (domain, Some(action)),
        None => (value, None),
    };
    let domain_ok = word(domain) && domain.as_bytes()[0].is_ascii_lowercase();
    let action_ok = action.is_none_or(|a| a.split('_').all(word));
    domain_ok && action_ok
}

/// Host events plugins can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NoteCreated,
    NoteUpdated,
    NoteDeleted,
    UserRegistered,
    UserLoggedIn,
    UserLoggedOut,
    AttachmentAdded,
    PreferenceChanged,
    PluginActivated,
    PluginDeactivated,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::NoteCreated,
        EventKind::NoteUpdated,
        EventKind::NoteDeleted,
        EventKind::UserRegistered,
        EventKind::UserLoggedIn,
        EventKind::UserLoggedOut,
        EventKind::AttachmentAdded,
        EventKind::PreferenceChanged,
        EventKind::PluginActivated,
        EventKind::PluginDeactivated,
    ];

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::NoteCreated => "NoteCreated",
            Self::NoteUpdated => "NoteUpdated",
            Self::NoteDeleted => "NoteDeleted",
            Self::UserRegistered => "UserRegistered",
            Self::UserLoggedIn => "UserLoggedIn",
            Self::UserLoggedOut => "UserLoggedOut",
            Self::AttachmentAdded => "AttachmentAdded",
            Self::PreferenceChanged => "PreferenceChanged",
            Self::PluginActivated => "PluginActivated",
            Self::PluginDeactivated => "PluginDeactivated",
        }
    }

    pub fn event_type(&self) -> String {
        canonical_event_type(self.kind_name())
    }
}

/// An event as delivered to listeners. Read-only once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginEvent {
    id: Uuid,
    #[serde(rename = "type")]
    event_type: String,
    source: String,
    timestamp: DateTime<Utc>,
    metadata: Map<String, Value>,
}

impl PluginEvent {
    pub fn new(kind: EventKind, source: impl Into<String>) -> Self {
        Self::with_type(kind.event_type(), source)
    }

    fn with_type(event_type: String, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            source: source.into(),
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }

    /// An event with a type outside [`EventKind`], e.g. one raised by a plugin
    pub fn custom(event_type: &str, source: impl Into<String>) -> Result<Self, EventBusError> {
        if !is_canonical_event_type(event_type) {
            return Err(EventBusError::InvalidEventType(event_type.to_string()));
        }
        Ok(Self::with_type(event_type.to_string(), source))
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn note_created(note: &Note) -> Self {
        Self::new(EventKind::NoteCreated, HOST_SOURCE)
            .with_metadata("note_id", note.id.to_string())
            .with_metadata("owner_id", note.owner_id.to_string())
            .with_metadata("title", note.title.clone())
    }

    pub fn note_updated(note: &Note) -> Self {
        Self::new(EventKind::NoteUpdated, HOST_SOURCE)
            .with_metadata("note_id", note.id.to_string())
            .with_metadata("owner_id", note.owner_id.to_string())
    }

    pub fn note_deleted(note_id: Uuid) -> Self {
        Self::new(EventKind::NoteDeleted, HOST_SOURCE).with_metadata("note_id", note_id.to_string())
    }

    pub fn user_registered(user: &User) -> Self {
        Self::new(EventKind::UserRegistered, HOST_SOURCE)
            .with_metadata("user_id", user.id.to_string())
            .with_metadata("username", user.username.clone())
    }

    pub fn user_logged_in(user_id: Uuid) -> Self {
        Self::new(EventKind::UserLoggedIn, HOST_SOURCE).with_metadata("user_id", user_id.to_string())
    }

    pub fn user_logged_out(user_id: Uuid) -> Self {
        Self::new(EventKind::UserLoggedOut, HOST_SOURCE).with_metadata("user_id", user_id.to_string())
    }

    pub fn attachment_added(attachment: &AttachmentMeta) -> Self {
        Self::new(EventKind::AttachmentAdded, HOST_SOURCE)
            .with_metadata("attachment_id", attachment.id.to_string())
            .with_metadata("note_id", attachment.note_id.to_string())
            .with_metadata("file_name", attachment.file_name.clone())
    }

    pub fn preference_changed(user_id: Uuid, key: &str) -> Self {
        Self::new(EventKind::PreferenceChanged, HOST_SOURCE)
            .with_metadata("user_id", user_id.to_string())
            .with_metadata("key", key)
    }

    pub fn plugin_activated(plugin_id: &str) -> Self {
        Self::new(EventKind::PluginActivated, HOST_SOURCE).with_metadata("plugin_id", plugin_id)
    }

    pub fn plugin_deactivated(plugin_id: &str) -> Self {
        Self::new(EventKind::PluginDeactivated, HOST_SOURCE).with_metadata("plugin_id", plugin_id)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct ListenerError(pub String);

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    #[error("event queue is full")]
    QueueFull,

    #[error("event bus is not running")]
    NotRunning,

    #[error("'{0}' is not a valid event type")]
    InvalidEventType(String),
}

#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &PluginEvent) -> Result<(), ListenerError>;

    /// Name used in delivery logs
    fn name(&self) -> &str;
}

struct FnListener<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> EventListener for FnListener<F>
where
    F: Fn(PluginEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ListenerError>> + Send + 'static,
{
    async fn on_event(&self, event: &PluginEvent) -> Result<(), ListenerError> {
        (self.f)(event.clone()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wrap an async closure as a listener
pub fn listener_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventListener>
where
    F: Fn(PluginEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ListenerError>> + Send + 'static,
{
    Arc::new(FnListener {
        name: name.into(),
        f,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

type Entry = (SubscriptionId, Arc<dyn EventListener>);

#[derive(Default)]
struct ListenerTable {
    by_type: RwLock<HashMap<String, Vec<Entry>>>,
    next_id: AtomicU64,
}

impl ListenerTable {
    fn snapshot(&self, event_type: &str) -> Vec<Arc<dyn EventListener>> {
        let by_type = self.by_type.read().unwrap_or_else(PoisonError::into_inner);
        by_type
            .get(event_type)
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }
}

async fn dispatch(table: &ListenerTable, event: &PluginEvent) -> DispatchReport {
    let listeners = table.snapshot(event.event_type());
    let mut report = DispatchReport::default();

    for listener in listeners {
        match AssertUnwindSafe(listener.on_event(event)).catch_unwind().await {
            Ok(Ok(())) => report.delivered += 1,
            Ok(Err(e)) => {
                warn!(
                    listener = listener.name(),
                    event_type = event.event_type(),
                    error = %e,
                    "Listener failed"
                );
                report.failed += 1;
            }
            Err(_) => {
                error!(
                    listener = listener.name(),
                    event_type = event.event_type(),
                    "Listener panicked"
                );
                report.failed += 1;
            }
        }
    }
    report
}

struct WorkerPool {
    senders: Vec<mpsc::Sender<PluginEvent>>,
    handles: Vec<JoinHandle<()>>,
}

pub struct EventBus {
    listeners: Arc<ListenerTable>,
    pool: Mutex<Option<WorkerPool>>,
    shard_hasher: RandomState,
    workers: usize,
    queue_capacity: usize,
}

impl EventBus {
    pub fn new(config: &EventsConfig) -> Self {
        Self {
            listeners: Arc::new(ListenerTable::default()),
            pool: Mutex::new(None),
            shard_hasher: RandomState::new(),
            workers: config.workers.max(1),
            queue_capacity: config.queue_capacity.max(1),
        }
    }

    /// Spawn the delivery workers. Must be called inside a Tokio runtime;
    /// calling it on a running bus does nothing.
    pub fn start(&self) {
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        if pool.is_some() {
            return;
        }

        let mut senders = Vec::with_capacity(self.workers);
        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let (tx, mut rx) = mpsc::channel::<PluginEvent>(self.queue_capacity);
            let table = Arc::clone(&self.listeners);
            handles.push(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let report = dispatch(&table, &event).await;
                    debug!(worker, event_type = event.event_type(), ?report, "Delivered event");
                }
            }));
            senders.push(tx);
        }
        *pool = Some(WorkerPool { senders, handles });
        info!(workers = self.workers, "Event bus started");
    }

    pub fn is_running(&self) -> bool {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stop accepting async events, let workers drain what is queued, and
    /// abort any worker still busy after the grace period
    pub async fn shutdown(&self) {
        let pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(WorkerPool { senders, handles }) = pool else {
            return;
        };
        drop(senders);

        for mut handle in handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                warn!("Event worker did not drain in time, aborting");
                handle.abort();
            }
        }
        info!("Event bus stopped");
    }

    pub fn subscribe(
        &self,
        event_type: &str,
        listener: Arc<dyn EventListener>,
    ) -> Result<SubscriptionId, EventBusError> {
        if !is_canonical_event_type(event_type) {
            return Err(EventBusError::InvalidEventType(event_type.to_string()));
        }
        let id = SubscriptionId(self.listeners.next_id.fetch_add(1, Ordering::Relaxed));
        let mut by_type = self
            .listeners
            .by_type
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        debug!(event_type, listener = listener.name(), "Listener subscribed");
        by_type
            .entry(event_type.to_string())
            .or_default()
            .push((id, listener));
        Ok(id)
    }

    /// Remove one subscription. Returns false if it was not present.
    pub fn unsubscribe(&self, event_type: &str, id: SubscriptionId) -> bool {
        let mut by_type = self
            .listeners
            .by_type
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = by_type.get_mut(event_type) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            by_type.remove(event_type);
        }
        removed
    }

    pub fn listener_count(&self, event_type: &str) -> usize {
        let by_type = self
            .listeners
            .by_type
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        by_type.get(event_type).map_or(0, Vec::len)
    }

    /// Deliver to every current listener before returning
    pub async fn publish(&self, event: &PluginEvent) -> DispatchReport {
        dispatch(&self.listeners, event).await
    }

    /// Queue for background delivery without waiting for listeners
    pub fn publish_async(&self, event: PluginEvent) -> Result<(), EventBusError> {
        let pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(pool) = pool.as_ref() else {
            return Err(EventBusError::NotRunning);
        };
        let shard = (self.shard_hasher.hash_one(event.event_type()) % pool.senders.len() as u64) as usize;
        pool.senders[shard].try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EventBusError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => EventBusError::NotRunning,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    fn bus(workers: usize, queue_capacity: usize) -> EventBus {
        EventBus::new(&EventsConfig {
            workers,
            queue_capacity,
        })
    }

    fn counting(name: &str, counter: Arc<AtomicUsize>) -> Arc<dyn EventListener> {
        listener_fn(name, move |_event| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[test]
    fn test_canonical_event_types() {
        assert_eq!(canonical_event_type("NoteCreated"), "note.created");
        assert_eq!(canonical_event_type("UserLoggedIn"), "user.logged_in");
        assert_eq!(canonical_event_type("UserLoggedInEvent"), "user.logged_in");
        assert_eq!(canonical_event_type("PreferenceChanged"), "preference.changed");
        assert_eq!(canonical_event_type("Event"), "event");
        for kind in EventKind::ALL {
            assert!(is_canonical_event_type(&kind.event_type()), "{:?}", kind);
        }
    }

    #[test]
    fn test_event_type_shape() {
        assert!(is_canonical_event_type("note.created"));
        assert!(is_canonical_event_type("user.logged_in"));
        assert!(!is_canonical_event_type("NoteCreated"));
        assert!(!is_canonical_event_type("note."));
        assert!(!is_canonical_event_type(".created"));
        assert!(!is_canonical_event_type("note.logged__in"));
        assert!(!is_canonical_event_type("1note.created"));
        assert!(!is_canonical_event_type(""));
    }

    #[test]
    fn test_constructors_fill_metadata() {
        let user_id = Uuid::new_v4();
        let event = PluginEvent::preference_changed(user_id, "theme");
        assert_eq!(event.event_type(), "preference.changed");
        assert_eq!(event.source(), HOST_SOURCE);
        assert_eq!(event.metadata()["user_id"], Value::String(user_id.to_string()));
        assert_eq!(event.metadata()["key"], Value::String("theme".to_string()));
    }

    #[test]
    fn test_custom_event_type_checked() {
        assert!(PluginEvent::custom("report.generated", "word-count").is_ok());
        assert_eq!(
            PluginEvent::custom("Report Generated", "word-count").unwrap_err(),
            EventBusError::InvalidEventType("Report Generated".to_string())
        );
    }

    #[tokio::test]
    async fn test_publish_delivers_to_matching_type_only() {
        let bus = bus(1, 8);
        let created = Arc::new(AtomicUsize::new(0));
        let deleted = Arc::new(AtomicUsize::new(0));
        bus.subscribe("note.created", counting("created", created.clone())).unwrap();
        bus.subscribe("note.deleted", counting("deleted", deleted.clone())).unwrap();

        let report = bus.publish(&PluginEvent::new(EventKind::NoteCreated, "test")).await;
        assert_eq!(report, DispatchReport { delivered: 1, failed: 0 });
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(deleted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_and_panicking_listeners_are_isolated() {
        let bus = bus(1, 8);
        let survivor = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            "note.created",
            listener_fn("fails", |_| async { Err(ListenerError::new("boom")) }),
        )
        .unwrap();
        bus.subscribe(
            "note.created",
            listener_fn("panics", |event| async move {
                if event.event_type() == "note.created" {
                    panic!("listener bug");
                }
                Ok(())
            }),
        )
        .unwrap();
        bus.subscribe("note.created", counting("survivor", survivor.clone())).unwrap();

        let report = bus.publish(&PluginEvent::new(EventKind::NoteCreated, "test")).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(survivor.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_by_id() {
        let bus = bus(1, 8);
        let count = Arc::new(AtomicUsize::new(0));
        let id = bus.subscribe("user.logged_in", counting("a", count.clone())).unwrap();
        assert_eq!(bus.listener_count("user.logged_in"), 1);

        assert!(bus.unsubscribe("user.logged_in", id));
        assert!(!bus.unsubscribe("user.logged_in", id));
        assert_eq!(bus.listener_count("user.logged_in"), 0);

        bus.publish(&PluginEvent::user_logged_in(Uuid::new_v4())).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_subscribe_rejects_bad_type() {
        let bus = bus(1, 8);
        let err = bus
            .subscribe("NoteCreated", counting("x", Arc::new(AtomicUsize::new(0))))
            .unwrap_err();
        assert!(matches!(err, EventBusError::InvalidEventType(_)));
    }

    #[tokio::test]
    async fn test_publish_async_requires_running_bus() {
        let bus = bus(2, 8);
        let event = PluginEvent::new(EventKind::NoteCreated, "test");
        assert_eq!(bus.publish_async(event.clone()), Err(EventBusError::NotRunning));

        bus.start();
        assert!(bus.publish_async(event.clone()).is_ok());
        bus.shutdown().await;
        assert_eq!(bus.publish_async(event), Err(EventBusError::NotRunning));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_async_delivery_is_fifo_per_type() {
        let bus = bus(4, 256);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(
            "note.updated",
            listener_fn("recorder", move |event| {
                let sink = sink.clone();
                async move {
                    let seq = event.metadata()["seq"].as_u64().unwrap_or(u64::MAX);
                    sink.lock().unwrap().push(seq);
                    Ok(())
                }
            }),
        )
        .unwrap();

        bus.start();
        for seq in 0..200u64 {
            let event = PluginEvent::new(EventKind::NoteUpdated, "test").with_metadata("seq", seq);
            bus.publish_async(event).unwrap();
        }
        bus.shutdown().await;

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..200u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_publish_async_reports_full_queue() {
        let bus = bus(1, 1);
        let gate = Arc::new(Semaphore::new(0));
        let waiter = gate.clone();
        bus.subscribe(
            "note.deleted",
            listener_fn("slow", move |_| {
                let waiter = waiter.clone();
                async move {
                    let _permit = waiter.acquire().await;
                    Ok(())
                }
            }),
        )
        .unwrap();
        bus.start();

        let results: Vec<_> = (0..3)
            .map(|_| bus.publish_async(PluginEvent::note_deleted(Uuid::new_v4())))
            .collect();
        assert!(results.contains(&Err(EventBusError::QueueFull)));

        gate.add_permits(16);
        bus.shutdown().await;
    }
}
