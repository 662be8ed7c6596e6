//! In-process event bus for execution and metric events.
//!
//! Built on a bounded broadcast channel: publishers never block, and a
//! subscriber that falls behind loses the oldest messages instead of slowing
//! anyone down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

use super::models::{ExecutionStatus, FieldMap, SystemMetrics};
use super::safety::{Alert, Violation};

const DEFAULT_BUS_CAPACITY: usize = 256;

/// Tagged message published by the engine core.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// An execution entered the Running state.
    ExecutionStarted {
        execution_id: Uuid,
        config_name: String,
    },
    /// An execution reached a terminal state.
    ExecutionFinished {
        execution_id: Uuid,
        status: ExecutionStatus,
        duration: Duration,
        error: Option<String>,
    },
    /// Periodic host snapshot from the metrics collector.
    SystemSample(Arc<SystemMetrics>),
    /// Per-execution metric fields (system or plugin counters).
    ExecutionSample {
        execution_id: Uuid,
        source: String,
        fields: FieldMap,
    },
    /// A safety limit was breached.
    SafetyViolation(Violation),
    /// Subscriber-facing notification derived from a violation.
    SafetyAlert(Alert),
}

/// Cloneable handle to the engine's publish/subscribe channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Never blocks; a send with no live subscribers is
    /// silently discarded.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Register a new subscriber. The receiver observes events published
    /// after this call; ordering is preserved per publisher.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}
