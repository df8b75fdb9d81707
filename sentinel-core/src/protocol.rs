//! The lifecycle event contract. Event kinds are a closed enumeration;
//! string forms only exist at the serialization boundary
//! (`#[serde(tag = "type", ...)]`) rather than being dispatched on directly.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;

/// Outcome of an approval decision, as carried on the `approval:resolved`
/// event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalEventOutcome {
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventMsg {
    CycleStarted {
        cycle_id: String,
        goal: String,
        session_id: String,
        turn_index: u64,
    },
    AgentCurating {
        cycle_id: String,
        goal: String,
    },
    AgentAwaitingContext {
        cycle_id: String,
        session_id: String,
        bundle_path: String,
    },
    AgentAwaitingProposal {
        cycle_id: String,
        session_id: String,
        bundle_path: String,
        change_count: usize,
    },
    CycleApplying {
        cycle_id: String,
        checkpoint_id: String,
        change_count: usize,
    },
    CycleVerifying {
        cycle_id: String,
    },
    CycleCommitted {
        cycle_id: String,
        version_id: String,
    },
    CycleRolledBack {
        cycle_id: String,
        checkpoint_id: String,
        reason: String,
    },
    CycleDone {
        cycle_id: String,
        duration_ms: u64,
        summary: String,
    },
    CycleFailed {
        cycle_id: String,
        duration_ms: u64,
        summary: String,
    },
    CycleCancelled {
        cycle_id: String,
        duration_ms: u64,
        summary: String,
    },
    ApprovalPending {
        approval_id: String,
        module_id: String,
        capability: String,
        action_label: String,
    },
    ApprovalResolved {
        approval_id: String,
        outcome: ApprovalEventOutcome,
        reason: Option<String>,
    },
}

/// An emitted lifecycle event, timestamped at the point of emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub at: DateTime<Utc>,
    pub msg: EventMsg,
}

impl Event {
    pub fn now(msg: EventMsg) -> Self {
        Event {
            at: Utc::now(),
            msg,
        }
    }
}

/// Multi-producer multi-consumer broadcast of lifecycle events. A slow or
/// absent subscriber is dropped rather than backpressuring the driver:
/// `tokio::sync::broadcast` lags rather than blocks.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit(&self, msg: EventMsg) {
        // No subscribers is not an error: events are fire-and-forget.
        let _ = self.tx.send(Event::now(msg));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
