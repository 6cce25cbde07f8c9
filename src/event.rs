//! Append-only event log with in-process fan-out to per-run subscribers
//! (§4.5). Generalizes the teacher's per-task `execution::streaming`
//! mpsc-per-client pattern into a `DashMap<Uuid, Vec<Subscriber>>` keyed by
//! run id, since here a run (not a single task) is the fan-out unit.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::db::{NewRunEvent, Store};

/// The fixed vocabulary of event types emitted by the engine (§6 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    RunStarted,
    RunCompleted,
    RunFailed,
    RunPaused,
    RunResumed,
    RunCancelled,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepSkipped,
    StepWaiting,
    StepRetrying,
    ContextUpdated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RunStarted => "run.started",
            EventType::RunCompleted => "run.completed",
            EventType::RunFailed => "run.failed",
            EventType::RunPaused => "run.paused",
            EventType::RunResumed => "run.resumed",
            EventType::RunCancelled => "run.cancelled",
            EventType::StepStarted => "step.started",
            EventType::StepCompleted => "step.completed",
            EventType::StepFailed => "step.failed",
            EventType::StepSkipped => "step.skipped",
            EventType::StepWaiting => "step.waiting",
            EventType::StepRetrying => "step.retrying",
            EventType::ContextUpdated => "context.updated",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The envelope delivered to subscribers and persisted as `run_events.payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEventEnvelope {
    #[serde(rename = "type")]
    pub envelope_type: &'static str,
    pub event_type: &'static str,
    pub run_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub timestamp: String,
    pub payload: Value,
}

pub type Subscription = mpsc::Receiver<RunEventEnvelope>;
type Listener = Arc<dyn Fn(&RunEventEnvelope) + Send + Sync>;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<RunEventEnvelope>,
}

/// In-process pub/sub over a `Store`. One `EventBus` is shared across all
/// runs in a process; fan-out is partitioned per `run_id`.
pub struct EventBus {
    store: Arc<dyn Store>,
    subscribers: DashMap<Uuid, Vec<Subscriber>>,
    listeners: DashMap<u64, Listener>,
    queue_capacity: usize,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(store: Arc<dyn Store>, queue_capacity: usize) -> Self {
        Self {
            store,
            subscribers: DashMap::new(),
            listeners: DashMap::new(),
            queue_capacity,
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a new bounded subscriber for `run_id`. The returned
    /// receiver only sees events emitted after this call; callers that
    /// need a consistent view must subscribe before reading a snapshot
    /// (§6 "subscribe-then-snapshot").
    pub fn subscribe(&self, run_id: Uuid) -> (u64, Subscription) {
        let (tx, rx) = mpsc::channel(self.queue_capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.entry(run_id).or_default().push(Subscriber { id, tx });
        (id, rx)
    }

    pub fn unsubscribe(&self, run_id: Uuid, subscriber_id: u64) {
        if let Some(mut entry) = self.subscribers.get_mut(&run_id) {
            entry.retain(|s| s.id != subscriber_id);
            if entry.is_empty() {
                drop(entry);
                self.subscribers.remove(&run_id);
            }
        }
    }

    /// Registers a process-global listener (metrics, logging). Returns an
    /// id usable with `remove_listener`.
    pub fn add_listener<F>(&self, callback: F) -> u64
    where
        F: Fn(&RunEventEnvelope) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.insert(id, Arc::new(callback));
        id
    }

    pub fn remove_listener(&self, id: u64) {
        self.listeners.remove(&id);
    }

    /// Persists then fans out an event. Persistence failures are logged
    /// but never block delivery (§4.5); delivery failures (dropped on a
    /// full queue) never affect the caller.
    pub async fn emit(&self, run_id: Uuid, event_type: EventType, step_id: Option<String>, payload: Value) {
        let envelope = RunEventEnvelope {
            envelope_type: event_type.as_str(),
            event_type: event_type.as_str(),
            run_id,
            step_id: step_id.clone(),
            timestamp: Utc::now().to_rfc3339(),
            payload,
        };

        let payload_json = serde_json::to_string(&envelope.payload).unwrap_or_else(|_| "{}".to_string());
        if let Err(e) = self
            .store
            .create_run_event(NewRunEvent {
                run_id: run_id.to_string(),
                step_id: envelope.step_id.clone(),
                event_type: envelope.event_type.to_string(),
                payload: payload_json,
            })
            .await
        {
            tracing::error!(run_id = %run_id, error = %e, "failed to persist run event");
        }

        if let Some(mut entry) = self.subscribers.get_mut(&run_id) {
            entry.retain(|sub| match sub.tx.try_send(envelope.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(run_id = %run_id, "subscriber queue full, dropping event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }

        for listener in self.listeners.iter() {
            listener.value()(&envelope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewRun, NewWorkflow, SqliteStore};
    use sqlx::sqlite::SqlitePool;
    use std::sync::atomic::AtomicUsize;

    async fn bus() -> (EventBus, Uuid) {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));
        let wf = store
            .create_workflow(NewWorkflow { name: "demo".into(), definition: "{}".into(), input_schema: None })
            .await
            .unwrap();
        let run = store
            .create_run(NewRun { workflow_id: wf.id, trigger_type: "manual".into(), input: "{}".into(), idempotency_key: None })
            .await
            .unwrap();
        let run_id = Uuid::parse_str(&run.id).unwrap();
        (EventBus::new(store, 256), run_id)
    }

    #[tokio::test]
    async fn subscriber_receives_event_in_order() {
        let (bus, run_id) = bus().await;
        let (_id, mut rx) = bus.subscribe(run_id);

        bus.emit(run_id, EventType::RunStarted, None, serde_json::json!({"status": "running"})).await;
        bus.emit(run_id, EventType::RunCompleted, None, serde_json::json!({"status": "completed"})).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type, "run.started");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.event_type, "run.completed");
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let (bus, run_id) = bus().await;
        let (id, mut rx) = bus.subscribe(run_id);
        bus.unsubscribe(run_id, id);

        bus.emit(run_id, EventType::RunStarted, None, serde_json::json!({})).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn events_persisted_to_store() {
        let (bus, run_id) = bus().await;
        bus.emit(run_id, EventType::StepStarted, Some("a".into()), serde_json::json!({"step_id": "a"})).await;

        let events = bus.store.list_run_events(&run_id.to_string()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "step.started");
        assert_eq!(events[0].step_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn full_queue_drops_event_without_panicking() {
        let (bus, run_id) = bus().await;
        let (_id, _rx) = bus.subscribe(run_id);
        // capacity 256 but we never drain; emit well past capacity and
        // confirm emit() never blocks or errors the caller.
        for _ in 0..300 {
            bus.emit(run_id, EventType::ContextUpdated, None, serde_json::json!({})).await;
        }
    }

    #[tokio::test]
    async fn listeners_invoked_on_every_emit() {
        let (bus, run_id) = bus().await;
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        bus.add_listener(move |_evt| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(run_id, EventType::RunStarted, None, serde_json::json!({})).await;
        bus.emit(run_id, EventType::RunCompleted, None, serde_json::json!({})).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn removed_listener_is_not_invoked() {
        let (bus, run_id) = bus().await;
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let id = bus.add_listener(move |_evt| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        bus.remove_listener(id);

        bus.emit(run_id, EventType::RunStarted, None, serde_json::json!({})).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
