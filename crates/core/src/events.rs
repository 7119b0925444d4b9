//! The event bus (C7): lifecycle events fanned out to registered listeners.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::TaskId;

/// Event kind, matching the DAG- and task-level names in §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    DagStart,
    DagComplete,
    DagFailed,
    DagCancelled,
    DagPaused,
    DagResumed,
    TaskReady,
    TaskStart,
    TaskComplete,
    TaskFailed,
    TaskRetry,
    TaskCancelled,
    TaskSkipped,
    ProgressUpdate,
}

/// A single emitted event. `data` carries event-specific payload (e.g. a
/// `DagStatistics` snapshot for `progress:update`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub dag_id: String,
    pub task_id: Option<TaskId>,
    pub timestamp: DateTime<Utc>,
    pub data: Option<serde_json::Value>,
}

impl Event {
    pub fn dag(kind: EventKind, dag_id: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self { kind, dag_id: dag_id.into(), task_id: None, timestamp: Utc::now(), data }
    }

    pub fn task(
        kind: EventKind,
        dag_id: impl Into<String>,
        task_id: impl Into<TaskId>,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self { kind, dag_id: dag_id.into(), task_id: Some(task_id.into()), timestamp: Utc::now(), data }
    }
}

type Listener = dyn Fn(&Event) + Send + Sync;

/// Publish/subscribe surface for scheduler events (§6). Cheaply `Clone`
/// (listener storage is `Arc`-shared) so a `Scheduler` handle can be
/// duplicated before spawning `execute()` and still reach the same
/// subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<Mutex<Vec<Arc<Listener>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. Listener invocation order across one emission
    /// is unspecified (§5); this bus calls them in registration order.
    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Arc::new(listener));
    }

    /// Emitted synchronously from the coordinator. A listener that panics
    /// is caught and logged, never propagated (§5, §9).
    pub fn emit(&self, event: Event) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            let event_ref = &event;
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(event_ref))).is_err() {
                tracing::warn!(dag_id = %event.dag_id, kind = ?event.kind, "event listener panicked, ignoring");
            }
        }
    }

    /// Removes every registered listener. Used by callers that want a
    /// clean bus without rebuilding the scheduler; `reset()` itself does
    /// *not* call this (listeners survive a graph reset, per §9).
    pub fn clear(&self) {
        self.listeners.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emits_to_all_listeners_in_registration_order() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        bus.on_event(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = count.clone();
        bus.on_event(move |_| {
            c2.fetch_add(10, Ordering::SeqCst);
        });
        bus.emit(Event::dag(EventKind::DagStart, "d1", None));
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn panicking_listener_is_contained() {
        let bus = EventBus::new();
        bus.on_event(|_| panic!("listener exploded"));
        let called = Arc::new(AtomicUsize::new(0));
        let c = called.clone();
        bus.on_event(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(Event::dag(EventKind::DagStart, "d1", None));
        assert_eq!(called.load(Ordering::SeqCst), 1);
    }
}
