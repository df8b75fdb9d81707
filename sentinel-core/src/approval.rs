//! The approval gate: per-module override of a master HITL mode, a
//! pending-approval queue, and correlation of asynchronous user decisions
//! back to the operation awaiting them.
//!
//! Grounded on `core/src/safety.rs`'s policy-driven `SafetyCheck` enum and
//! the `pending_approvals: HashMap<String, oneshot::Sender<ReviewDecision>>`
//! correlation pattern in `core/src/codex.rs`.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::ApprovalError;
use crate::protocol::ApprovalEventOutcome;
use crate::protocol::EventBus;
use crate::protocol::EventMsg;

/// Closed enumeration of capabilities the engine ever asks approval for.
/// String forms exist only at the serialization boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ApproveContext,
    ApproveProposal,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ApproveContext => "approve_context",
            Capability::ApproveProposal => "approve_proposal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MasterMode {
    #[default]
    Hitl,
    Autonomous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleMode {
    Inherit,
    Hitl,
    Autonomous,
}

/// The gate's mode configuration and module registry. `history` lives on
/// `ApprovalGate`, not here, since it records outcomes rather than
/// configuration.
#[derive(Debug, Clone, Default)]
pub struct GateConfig {
    pub master_mode: MasterMode,
    pub module_overrides: HashMap<String, ModuleMode>,
    pub registered_modules: HashMap<String, HashSet<Capability>>,
}

/// The final value an awaited approval resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Approved(serde_json::Value),
    Rejected { reason: String },
}

/// Input to `ApprovalGate::request_approval`.
pub struct ApprovalRequestInput {
    pub module_id: String,
    pub capability: Capability,
    pub action_label: String,
    pub payload: serde_json::Value,
}

/// A queued approval request, visible to status snapshots. Does not expose
/// the resolver directly; resolution happens exclusively through
/// `ApprovalGate::approve`/`reject`, keyed by `approval_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: String,
    pub module_id: String,
    pub capability: Capability,
    pub action_label: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Either the approval resolved immediately (not required) or it was
/// queued and the caller must await `rx` for the eventual decision.
pub enum ApprovalOutcomeFuture {
    Immediate(Decision),
    Pending {
        approval_id: String,
        rx: oneshot::Receiver<Decision>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub approval_id: String,
    pub outcome: ApprovalEventOutcome,
    pub at: DateTime<Utc>,
}

const HISTORY_CAPACITY: usize = 50;

struct GateState {
    config: GateConfig,
    queue: HashMap<String, ApprovalRequest>,
    resolvers: HashMap<String, oneshot::Sender<Decision>>,
    history: VecDeque<HistoryEntry>,
}

pub struct ApprovalGate {
    state: Mutex<GateState>,
    events: EventBus,
}

impl ApprovalGate {
    pub fn new(config: GateConfig, events: EventBus) -> Self {
        ApprovalGate {
            state: Mutex::new(GateState {
                config,
                queue: HashMap::new(),
                resolvers: HashMap::new(),
                history: VecDeque::new(),
            }),
            events,
        }
    }

    pub fn register_module(&self, module_id: impl Into<String>, capabilities: &[Capability]) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .config
            .registered_modules
            .insert(module_id.into(), capabilities.iter().copied().collect());
    }

    pub fn set_master_mode(&self, mode: MasterMode) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.config.master_mode = mode;
    }

    pub fn set_module_mode(&self, module_id: impl Into<String>, mode: ModuleMode) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.config.module_overrides.insert(module_id.into(), mode);
    }

    /// `effective_mode(m) == HITL` and `capability ∈ registered[m]`.
    pub fn requires_approval(&self, module_id: &str, capability: Capability) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let effective_hitl = match state.config.module_overrides.get(module_id) {
            Some(ModuleMode::Hitl) => true,
            Some(ModuleMode::Autonomous) => false,
            Some(ModuleMode::Inherit) | None => state.config.master_mode == MasterMode::Hitl,
        };
        if !effective_hitl {
            return false;
        }
        state
            .config
            .registered_modules
            .get(module_id)
            .is_some_and(|caps| caps.contains(&capability))
    }

    /// Resolves immediately with `payload` when approval is not required;
    /// otherwise enqueues, emits `approval:pending`, and returns a pending
    /// handle the caller awaits for the eventual decision.
    pub fn request_approval(&self, input: ApprovalRequestInput) -> ApprovalOutcomeFuture {
        if !self.requires_approval(&input.module_id, input.capability) {
            return ApprovalOutcomeFuture::Immediate(Decision::Approved(input.payload));
        }

        let approval_id = Uuid::new_v4().to_string();
        let request = ApprovalRequest {
            approval_id: approval_id.clone(),
            module_id: input.module_id,
            capability: input.capability,
            action_label: input.action_label,
            payload: input.payload,
            created_at: Utc::now(),
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.queue.insert(approval_id.clone(), request.clone());
            state.resolvers.insert(approval_id.clone(), tx);
        }

        self.events.emit(EventMsg::ApprovalPending {
            approval_id: approval_id.clone(),
            module_id: request.module_id.clone(),
            capability: request.capability.as_str().to_string(),
            action_label: request.action_label.clone(),
        });

        ApprovalOutcomeFuture::Pending { approval_id, rx }
    }

    fn resolve(
        &self,
        approval_id: &str,
        decision: Decision,
        outcome: ApprovalEventOutcome,
        reason: Option<String>,
    ) -> Result<(), ApprovalError> {
        let resolver = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if !state.queue.contains_key(approval_id) {
                return Err(if state.history.iter().any(|h| h.approval_id == approval_id) {
                    ApprovalError::AlreadyResolved
                } else {
                    ApprovalError::NotFound
                });
            }
            state.queue.remove(approval_id);
            let resolver = state.resolvers.remove(approval_id);
            state.history.push_back(HistoryEntry {
                approval_id: approval_id.to_string(),
                outcome,
                at: Utc::now(),
            });
            if state.history.len() > HISTORY_CAPACITY {
                state.history.pop_front();
            }
            resolver
        };

        self.events.emit(EventMsg::ApprovalResolved {
            approval_id: approval_id.to_string(),
            outcome,
            reason,
        });

        if let Some(resolver) = resolver {
            let _ = resolver.send(decision);
        }
        Ok(())
    }

    pub fn approve(
        &self,
        approval_id: &str,
        value: Option<serde_json::Value>,
    ) -> Result<(), ApprovalError> {
        let payload = value.unwrap_or(serde_json::Value::Null);
        self.resolve(
            approval_id,
            Decision::Approved(payload),
            ApprovalEventOutcome::Approved,
            None,
        )
    }

    pub fn reject(&self, approval_id: &str, reason: String) -> Result<(), ApprovalError> {
        self.resolve(
            approval_id,
            Decision::Rejected {
                reason: reason.clone(),
            },
            ApprovalEventOutcome::Rejected,
            Some(reason),
        )
    }

    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.queue.values().cloned().collect()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.history.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> ApprovalGate {
        let gate = ApprovalGate::new(GateConfig::default(), EventBus::default());
        gate.register_module("cycle.context", &[Capability::ApproveContext]);
        gate
    }

    #[test]
    fn mode_resolution_follows_override_then_master() {
        let gate = gate();
        gate.set_master_mode(MasterMode::Hitl);
        assert!(gate.requires_approval("cycle.context", Capability::ApproveContext));
        // Not registered for this capability under this module.
        assert!(!gate.requires_approval("cycle.context", Capability::ApproveProposal));

        gate.set_module_mode("cycle.context", ModuleMode::Autonomous);
        assert!(!gate.requires_approval("cycle.context", Capability::ApproveContext));

        gate.set_module_mode("cycle.context", ModuleMode::Inherit);
        assert!(gate.requires_approval("cycle.context", Capability::ApproveContext));
    }

    #[test]
    fn autonomous_master_mode_resolves_immediately() {
        let gate = gate();
        gate.set_master_mode(MasterMode::Autonomous);
        let outcome = gate.request_approval(ApprovalRequestInput {
            module_id: "cycle.context".to_string(),
            capability: Capability::ApproveContext,
            action_label: "approve".to_string(),
            payload: serde_json::json!({"n": 1}),
        });
        match outcome {
            ApprovalOutcomeFuture::Immediate(Decision::Approved(v)) => {
                assert_eq!(v, serde_json::json!({"n": 1}));
            }
            _ => panic!("expected immediate approval"),
        }
    }

    #[test]
    fn double_resolution_is_rejected() {
        let gate = gate();
        gate.set_master_mode(MasterMode::Hitl);
        let outcome = gate.request_approval(ApprovalRequestInput {
            module_id: "cycle.context".to_string(),
            capability: Capability::ApproveContext,
            action_label: "approve".to_string(),
            payload: serde_json::Value::Null,
        });
        let approval_id = match outcome {
            ApprovalOutcomeFuture::Pending { approval_id, .. } => approval_id,
            _ => panic!("expected pending approval"),
        };
        assert!(gate.approve(&approval_id, None).is_ok());
        let err = gate.approve(&approval_id, None).unwrap_err();
        assert_eq!(err, ApprovalError::AlreadyResolved);
    }

    #[test]
    fn unknown_approval_id_is_not_found() {
        let gate = gate();
        let err = gate.approve("does-not-exist", None).unwrap_err();
        assert_eq!(err, ApprovalError::NotFound);
    }

    #[test]
    fn history_ring_is_bounded() {
        let gate = gate();
        gate.set_master_mode(MasterMode::Hitl);
        for _ in 0..60 {
            let outcome = gate.request_approval(ApprovalRequestInput {
                module_id: "cycle.context".to_string(),
                capability: Capability::ApproveContext,
                action_label: "approve".to_string(),
                payload: serde_json::Value::Null,
            });
            if let ApprovalOutcomeFuture::Pending { approval_id, .. } = outcome {
                gate.approve(&approval_id, None).unwrap();
            }
        }
        assert_eq!(gate.history().len(), 50);
    }
}
