//! The cycle FSM: drives one goal-to-commit orchestration through context
//! curation, proposal generation, apply/verify, and commit/rollback,
//! suspending at exactly three points (model call, approval decision, VFS
//! or Verifier call) and resuming on external input.
//!
//! The driver is a spawned `tokio` task reading and writing state through a
//! `Mutex`, mirroring the `Session { state: Mutex<State> }` shape in
//! `core/src/codex.rs`; `approve_current`/`revise_current` correlate to the
//! single in-flight approval via an id captured before the decision is
//! awaited, the same pattern as `core/src/codex.rs`'s `pending_approvals`
//! map keyed by call id.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::approval::ApprovalGate;
use crate::approval::ApprovalOutcomeFuture;
use crate::approval::ApprovalRequestInput;
use crate::approval::Capability;
use crate::approval::Decision;
use crate::config::Config;
use crate::error::CycleError;
use crate::error::Result;
use crate::protocol::EventBus;
use crate::protocol::EventMsg;
use crate::reflection::CycleOutcome;
use crate::reflection::ReflectionEntry;
use crate::reflection::ReflectionSink;
use crate::verifier::VerifierAdapter;
use crate::vfs::VfsAdapter;

pub const MODULE_CONTEXT: &str = "cycle.context";
pub const MODULE_PROPOSAL: &str = "cycle.proposal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    CuratingContext,
    AwaitingContextApproval,
    GeneratingProposal,
    AwaitingProposalApproval,
    ApplyingChanges,
    Verifying,
    Committing,
    RollingBack,
    Reflecting,
    Done,
    Failed,
    Cancelled,
    Paused,
}

impl CycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CycleState::Done | CycleState::Failed | CycleState::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub passed: bool,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub from: CycleState,
    pub to: CycleState,
    pub at: DateTime<Utc>,
}

/// Mutated only by the FSM driver; observers see it only through
/// `get_status` snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleContext {
    pub cycle_id: String,
    pub goal: String,
    pub session_id: String,
    pub turn_index: u64,
    pub started_at: DateTime<Utc>,
    pub curated_paths: Vec<String>,
    pub context_bundle_path: Option<String>,
    pub context_bundle: Option<String>,
    pub patch_bundle_path: Option<String>,
    pub patch_bundle: Option<String>,
    pub change_set: Vec<sentinel_codec::Change>,
    pub checkpoint_id: Option<String>,
    pub verification: Option<Verification>,
    pub state: CycleState,
    pub history: Vec<HistoryEntry>,
    pub iterations: u32,
}

impl CycleContext {
    fn new(cycle_id: String, goal: String, session_id: String, turn_index: u64) -> Self {
        CycleContext {
            cycle_id,
            goal,
            session_id,
            turn_index,
            started_at: Utc::now(),
            curated_paths: Vec::new(),
            context_bundle_path: None,
            context_bundle: None,
            patch_bundle_path: None,
            patch_bundle: None,
            change_set: Vec::new(),
            checkpoint_id: None,
            verification: None,
            state: CycleState::CuratingContext,
            history: Vec::new(),
            iterations: 0,
        }
    }
}

#[async_trait]
pub trait Curator: Send + Sync {
    async fn curate(&self, goal: &str) -> Result<Vec<String>>;
}

#[async_trait]
pub trait ProposalGenerator: Send + Sync {
    async fn generate(&self, context_bundle: &str) -> Result<String>;
}

pub struct CycleEngineConfig {
    pub vfs: Arc<dyn VfsAdapter>,
    pub verifier: Arc<dyn VerifierAdapter>,
    pub reflection: Arc<dyn ReflectionSink>,
    pub curator: Arc<dyn Curator>,
    pub generator: Arc<dyn ProposalGenerator>,
    pub gate: Arc<ApprovalGate>,
    pub events: EventBus,
    pub config: Config,
    pub author: String,
}

/// Read-only view returned by `get_status`: current state, context (if any
/// cycle has run), recent history, and pending approvals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: CycleState,
    pub context: Option<CycleContext>,
    pub pending_approvals: Vec<crate::approval::ApprovalRequest>,
}

struct Shared {
    state: Mutex<CycleState>,
    stored_state: Mutex<Option<CycleState>>,
    context: Mutex<Option<CycleContext>>,
    current_approval: Mutex<Option<String>>,
    paused: AtomicBool,
    pause_notify: Notify,
    cancel_requested: AtomicBool,
    cancel_notify: Notify,
    turn_counter: AtomicU64,
    vfs: Arc<dyn VfsAdapter>,
    verifier: Arc<dyn VerifierAdapter>,
    reflection: Arc<dyn ReflectionSink>,
    curator: Arc<dyn Curator>,
    generator: Arc<dyn ProposalGenerator>,
    gate: Arc<ApprovalGate>,
    events: EventBus,
    config: Config,
    author: String,
}

/// Drives a single cycle at a time. Construct one per process (or per
/// independent session); engines share no mutable state.
pub struct CycleEngine {
    shared: Arc<Shared>,
}

impl CycleEngine {
    pub fn new(cfg: CycleEngineConfig) -> Self {
        cfg.gate
            .register_module(MODULE_CONTEXT, &[Capability::ApproveContext]);
        cfg.gate
            .register_module(MODULE_PROPOSAL, &[Capability::ApproveProposal]);
        CycleEngine {
            shared: Arc::new(Shared {
                state: Mutex::new(CycleState::Idle),
                stored_state: Mutex::new(None),
                context: Mutex::new(None),
                current_approval: Mutex::new(None),
                paused: AtomicBool::new(false),
                pause_notify: Notify::new(),
                cancel_requested: AtomicBool::new(false),
                cancel_notify: Notify::new(),
                turn_counter: AtomicU64::new(0),
                vfs: cfg.vfs,
                verifier: cfg.verifier,
                reflection: cfg.reflection,
                curator: cfg.curator,
                generator: cfg.generator,
                gate: cfg.gate,
                events: cfg.events,
                config: cfg.config,
                author: cfg.author,
            }),
        }
    }

    pub fn events(&self) -> EventBus {
        self.shared.events.clone()
    }

    pub fn start_cycle(&self, goal: String) -> Result<String> {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != CycleState::Idle {
                return Err(CycleError::Busy(*state));
            }
            if goal.trim().is_empty() {
                return Err(CycleError::InvalidGoal("goal must not be empty".to_string()));
            }
            *state = CycleState::CuratingContext;
        }

        self.shared.cancel_requested.store(false, Ordering::SeqCst);
        self.shared.paused.store(false, Ordering::SeqCst);

        let cycle_id = Uuid::new_v4().to_string();
        let session_id = Uuid::new_v4().to_string();
        let turn_index = self.shared.turn_counter.fetch_add(1, Ordering::SeqCst) + 1;

        let context = CycleContext::new(cycle_id.clone(), goal.clone(), session_id.clone(), turn_index);
        *self.shared.context.lock().unwrap_or_else(|e| e.into_inner()) = Some(context);

        self.shared.events.emit(EventMsg::CycleStarted {
            cycle_id: cycle_id.clone(),
            goal: goal.clone(),
            session_id,
            turn_index,
        });

        let shared = self.shared.clone();
        tokio::spawn(async move {
            run_cycle(shared).await;
        });

        Ok(cycle_id)
    }

    pub fn approve_current(&self, value: Option<serde_json::Value>) -> Result<()> {
        let approval_id = self
            .shared
            .current_approval
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(CycleError::NotAwaiting)?;
        self.shared
            .gate
            .approve(&approval_id, value)
            .map_err(|_| CycleError::NotAwaiting)
    }

    pub fn revise_current(&self, reason: String) -> Result<()> {
        let approval_id = self
            .shared
            .current_approval
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(CycleError::NotAwaiting)?;
        self.shared
            .gate
            .reject(&approval_id, reason)
            .map_err(|_| CycleError::NotAwaiting)
    }

    pub fn cancel_cycle(&self) {
        let already = self.shared.cancel_requested.swap(true, Ordering::SeqCst);
        if !already {
            self.shared.cancel_notify.notify_one();
        }
        // A paused driver is blocked on pause_notify, not cancel_notify; wake it too.
        self.shared.pause_notify.notify_one();
    }

    pub fn pause_cycle(&self) {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.is_terminal() || *state == CycleState::Paused {
            return;
        }
        *self.shared.stored_state.lock().unwrap_or_else(|e| e.into_inner()) = Some(*state);
        *state = CycleState::Paused;
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume_cycle(&self) {
        let restored = self
            .shared
            .stored_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(restored) = restored {
            *self.shared.state.lock().unwrap_or_else(|e| e.into_inner()) = restored;
        }
        if self.shared.paused.swap(false, Ordering::SeqCst) {
            self.shared.pause_notify.notify_one();
        }
    }

    pub fn get_status(&self) -> StatusSnapshot {
        let state = *self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        let context = self
            .shared
            .context
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        StatusSnapshot {
            state,
            context,
            pending_approvals: self.shared.gate.pending(),
        }
    }
}

fn set_state(shared: &Shared, to: CycleState) {
    let from = {
        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        let from = *state;
        *state = to;
        from
    };
    if let Some(context) = shared.context.lock().unwrap_or_else(|e| e.into_inner()).as_mut() {
        context.state = to;
        context.history.push(HistoryEntry { from, to, at: Utc::now() });
    }
    tracing::info!(?from, ?to, "cycle state transition");
}

fn with_context<R>(shared: &Shared, f: impl FnOnce(&mut CycleContext) -> R) -> Option<R> {
    shared
        .context
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .as_mut()
        .map(f)
}

enum Awaited {
    Approved(serde_json::Value),
    Rejected(String),
    Cancelled,
}

/// Blocks the driver while `paused` is set, waking on resume or
/// cancellation. Returns `true` if cancellation happened while paused.
async fn wait_if_paused(shared: &Arc<Shared>) -> bool {
    loop {
        if shared.cancel_requested.load(Ordering::SeqCst) {
            return true;
        }
        if !shared.paused.load(Ordering::SeqCst) {
            return false;
        }
        tokio::select! {
            _ = shared.pause_notify.notified() => {}
            _ = shared.cancel_notify.notified() => { return true; }
        }
    }
}

async fn await_approval(shared: &Arc<Shared>, outcome: ApprovalOutcomeFuture) -> Awaited {
    let (approval_id, rx) = match outcome {
        ApprovalOutcomeFuture::Immediate(Decision::Approved(v)) => return Awaited::Approved(v),
        ApprovalOutcomeFuture::Immediate(Decision::Rejected { reason }) => {
            return Awaited::Rejected(reason);
        }
        ApprovalOutcomeFuture::Pending { approval_id, rx } => (approval_id, rx),
    };

    *shared.current_approval.lock().unwrap_or_else(|e| e.into_inner()) = Some(approval_id.clone());

    let decision = tokio::select! {
        _ = shared.cancel_notify.notified() => None,
        decision = rx => decision.ok(),
    };

    *shared.current_approval.lock().unwrap_or_else(|e| e.into_inner()) = None;

    if shared.cancel_requested.load(Ordering::SeqCst) {
        return Awaited::Cancelled;
    }
    if wait_if_paused(shared).await {
        return Awaited::Cancelled;
    }

    match decision {
        Some(Decision::Approved(v)) => Awaited::Approved(v),
        Some(Decision::Rejected { reason }) => Awaited::Rejected(reason),
        None => Awaited::Cancelled,
    }
}

async fn run_cycle(shared: Arc<Shared>) {
    let (cycle_id, goal) = {
        let context = shared.context.lock().unwrap_or_else(|e| e.into_inner());
        let context = context.as_ref().expect("cycle context set by start_cycle");
        (context.cycle_id.clone(), context.goal.clone())
    };
    let start = Instant::now();

    'context_loop: loop {
        if wait_if_paused(&shared).await || shared.cancel_requested.load(Ordering::SeqCst) {
            return finish_cancelled(&shared, &cycle_id, start).await;
        }

        set_state(&shared, CycleState::CuratingContext);
        shared.events.emit(EventMsg::AgentCurating {
            cycle_id: cycle_id.clone(),
            goal: goal.clone(),
        });

        let curated = match shared.curator.curate(&goal).await {
            Ok(paths) if !paths.is_empty() => paths,
            Ok(_) => {
                return finish_failed(
                    &shared,
                    &cycle_id,
                    start,
                    CycleError::CurationFailed("curator returned zero paths".to_string()),
                )
                .await;
            }
            Err(e) => return finish_failed(&shared, &cycle_id, start, e).await,
        };

        let mut files = Vec::with_capacity(curated.len());
        for path in &curated {
            let bytes = match shared.vfs.read(path).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => Vec::new(),
                Err(e) => return finish_failed(&shared, &cycle_id, start, e).await,
            };
            let text = String::from_utf8_lossy(&bytes).into_owned();
            files.push((path.clone(), text));
        }
        let context_bundle = sentinel_codec::encode_context(&files);
        let (session_id, turn_index) = with_context(&shared, |c| (c.session_id.clone(), c.turn_index))
            .expect("context present");
        let bundle_path = format!("/sessions/{session_id}/turn-{turn_index}/context.bundle");
        if let Err(e) = shared.vfs.write(&bundle_path, context_bundle.clone().into_bytes()).await {
            return finish_failed(&shared, &cycle_id, start, e).await;
        }
        with_context(&shared, |c| {
            c.curated_paths = curated.clone();
            c.context_bundle_path = Some(bundle_path.clone());
            c.context_bundle = Some(context_bundle.clone());
        });

        set_state(&shared, CycleState::AwaitingContextApproval);
        shared.events.emit(EventMsg::AgentAwaitingContext {
            cycle_id: cycle_id.clone(),
            session_id: session_id.clone(),
            bundle_path: bundle_path.clone(),
        });

        let outcome = shared.gate.request_approval(ApprovalRequestInput {
            module_id: MODULE_CONTEXT.to_string(),
            capability: Capability::ApproveContext,
            action_label: "approve curated context".to_string(),
            payload: serde_json::json!({ "bundle_path": bundle_path }),
        });

        match await_approval(&shared, outcome).await {
            Awaited::Cancelled => return finish_cancelled(&shared, &cycle_id, start).await,
            Awaited::Rejected(_reason) => {
                let iterations = with_context(&shared, |c| {
                    c.iterations += 1;
                    c.iterations
                })
                .unwrap_or(0);
                if iterations > shared.config.engine.max_iterations {
                    return finish_failed(
                        &shared,
                        &cycle_id,
                        start,
                        CycleError::TooManyIterations(iterations),
                    )
                    .await;
                }
                continue 'context_loop;
            }
            Awaited::Approved(_) => {}
        }

        // Proposal generation, with its own reject-loop back to itself.
        'proposal_loop: loop {
            if wait_if_paused(&shared).await || shared.cancel_requested.load(Ordering::SeqCst) {
                return finish_cancelled(&shared, &cycle_id, start).await;
            }

            set_state(&shared, CycleState::GeneratingProposal);
            let context_bundle = with_context(&shared, |c| c.context_bundle.clone())
                .flatten()
                .unwrap_or_default();
            let raw_patch = match shared.generator.generate(&context_bundle).await {
                Ok(text) => text,
                Err(e) => return finish_failed(&shared, &cycle_id, start, e).await,
            };

            let parsed = match sentinel_codec::decode_patch(&raw_patch) {
                Ok(parsed) => parsed,
                Err(e) => {
                    return finish_failed(
                        &shared,
                        &cycle_id,
                        start,
                        CycleError::ProposalInvalid(e.to_string()),
                    )
                    .await;
                }
            };

            let patch_bundle_path =
                format!("/sessions/{session_id}/turn-{turn_index}/proposal.bundle");
            if let Err(e) = shared
                .vfs
                .write(&patch_bundle_path, raw_patch.clone().into_bytes())
                .await
            {
                return finish_failed(&shared, &cycle_id, start, e).await;
            }

            let change_count = parsed.changes.len();
            with_context(&shared, |c| {
                c.patch_bundle_path = Some(patch_bundle_path.clone());
                c.patch_bundle = Some(raw_patch.clone());
                c.change_set = parsed.changes.clone();
            });

            set_state(&shared, CycleState::AwaitingProposalApproval);
            shared.events.emit(EventMsg::AgentAwaitingProposal {
                cycle_id: cycle_id.clone(),
                session_id: session_id.clone(),
                bundle_path: patch_bundle_path.clone(),
                change_count,
            });

            let outcome = shared.gate.request_approval(ApprovalRequestInput {
                module_id: MODULE_PROPOSAL.to_string(),
                capability: Capability::ApproveProposal,
                action_label: "approve proposed changes".to_string(),
                payload: serde_json::json!({ "change_count": change_count }),
            });

            match await_approval(&shared, outcome).await {
                Awaited::Cancelled => return finish_cancelled(&shared, &cycle_id, start).await,
                Awaited::Rejected(_reason) => {
                    let iterations = with_context(&shared, |c| {
                        c.iterations += 1;
                        c.iterations
                    })
                    .unwrap_or(0);
                    if iterations > shared.config.engine.max_iterations {
                        return finish_failed(
                            &shared,
                            &cycle_id,
                            start,
                            CycleError::TooManyIterations(iterations),
                        )
                        .await;
                    }
                    continue 'proposal_loop;
                }
                Awaited::Approved(_) => break 'proposal_loop,
            }
        }
        break 'context_loop;
    }

    apply_verify_commit(shared, cycle_id, start).await;
}

async fn apply_verify_commit(shared: Arc<Shared>, cycle_id: String, start: Instant) {
    let changes = with_context(&shared, |c| c.change_set.clone()).unwrap_or_default();

    set_state(&shared, CycleState::ApplyingChanges);
    let checkpoint_id = match shared.vfs.checkpoint("pre-apply").await {
        Ok(id) => id,
        Err(e) => return finish_failed(&shared, &cycle_id, start, e).await,
    };
    with_context(&shared, |c| c.checkpoint_id = Some(checkpoint_id.clone()));
    shared.events.emit(EventMsg::CycleApplying {
        cycle_id: cycle_id.clone(),
        checkpoint_id: checkpoint_id.clone(),
        change_count: changes.len(),
    });

    let pre_apply_snapshot = match shared.vfs.snapshot().await {
        Ok(snapshot) => snapshot,
        Err(e) => return rollback(&shared, &cycle_id, start, &checkpoint_id, e.to_string()).await,
    };
    let parsed = sentinel_codec::ParsedPatch::from_changes(changes.clone());
    let verify_result = sentinel_codec::verify_against(&parsed, &pre_apply_snapshot);
    if !verify_result.verified {
        let reason = format!(
            "patch failed pre-apply verification: {}",
            verify_result.mismatches.join("; ")
        );
        return rollback(&shared, &cycle_id, start, &checkpoint_id, reason).await;
    }

    if let Err(apply_err) = apply_changes(&shared, &changes).await {
        return rollback(&shared, &cycle_id, start, &checkpoint_id, apply_err.to_string()).await;
    }

    if shared.cancel_requested.load(Ordering::SeqCst) {
        return rollback(&shared, &cycle_id, start, &checkpoint_id, "cancelled".to_string()).await;
    }

    set_state(&shared, CycleState::Verifying);
    shared.events.emit(EventMsg::CycleVerifying {
        cycle_id: cycle_id.clone(),
    });

    let snapshot = match shared.vfs.snapshot().await {
        Ok(snapshot) => snapshot,
        Err(e) => return rollback(&shared, &cycle_id, start, &checkpoint_id, e.to_string()).await,
    };

    let outcome = run_verification_with_retry(&shared, &snapshot).await;

    if shared.cancel_requested.load(Ordering::SeqCst) {
        return rollback(&shared, &cycle_id, start, &checkpoint_id, "cancelled".to_string()).await;
    }

    with_context(&shared, |c| {
        c.verification = Some(Verification {
            passed: outcome.passed,
            summary: outcome.summary.clone(),
        });
    });

    if !outcome.passed {
        return rollback(&shared, &cycle_id, start, &checkpoint_id, outcome.summary).await;
    }

    set_state(&shared, CycleState::Committing);
    let goal = with_context(&shared, |c| c.goal.clone()).unwrap_or_default();
    let turn_index = with_context(&shared, |c| c.turn_index).unwrap_or(0);
    let message = format!("Turn {turn_index}: {goal}");
    let version_id = match shared.vfs.commit(&message, &shared.author).await {
        Ok(id) => id,
        Err(e) => return finish_failed(&shared, &cycle_id, start, e).await,
    };
    shared.events.emit(EventMsg::CycleCommitted {
        cycle_id: cycle_id.clone(),
        version_id,
    });

    set_state(&shared, CycleState::Reflecting);
    let change_count = changes.len();
    let iterations = with_context(&shared, |c| c.iterations).unwrap_or(0);
    shared
        .reflection
        .record(ReflectionEntry {
            cycle_id: cycle_id.clone(),
            goal,
            outcome: CycleOutcome::Done,
            duration_ms: start.elapsed().as_millis() as u64,
            change_count,
            iterations,
            notes: String::new(),
            recorded_at: Utc::now(),
        })
        .await;

    finish_done(&shared, &cycle_id, start, "verification passed".to_string()).await;
}

async fn apply_changes(shared: &Arc<Shared>, changes: &[sentinel_codec::Change]) -> Result<()> {
    for change in changes {
        match change.op {
            sentinel_codec::Op::Create | sentinel_codec::Op::Modify => {
                let bytes = change
                    .decoded_new_content()
                    .map_err(|e| CycleError::ApplyFailed(e.to_string()))?
                    .unwrap_or_default();
                shared
                    .vfs
                    .write(&change.path, bytes)
                    .await
                    .map_err(|e| CycleError::ApplyFailed(e.to_string()))?;
            }
            sentinel_codec::Op::Delete => {
                shared
                    .vfs
                    .delete(&change.path)
                    .await
                    .map_err(|e| CycleError::ApplyFailed(e.to_string()))?;
            }
        }
    }
    Ok(())
}

async fn run_verification_with_retry(
    shared: &Arc<Shared>,
    snapshot: &HashMap<String, Vec<u8>>,
) -> crate::verifier::VerificationOutcome {
    match crate::verifier::run_with_timeout(shared.verifier.as_ref(), snapshot).await {
        Ok(outcome) => outcome,
        Err(_transient) => match crate::verifier::run_with_timeout(shared.verifier.as_ref(), snapshot).await {
            Ok(outcome) => outcome,
            Err(e) => crate::verifier::VerificationOutcome {
                passed: false,
                summary: e.0,
                duration_ms: 0,
            },
        },
    }
}

async fn rollback(shared: &Arc<Shared>, cycle_id: &str, start: Instant, checkpoint_id: &str, reason: String) {
    set_state(shared, CycleState::RollingBack);
    if let Err(e) = shared.vfs.restore(checkpoint_id).await {
        return finish_failed(shared, cycle_id, start, CycleError::RestoreFailed(e.to_string())).await;
    }
    shared.events.emit(EventMsg::CycleRolledBack {
        cycle_id: cycle_id.to_string(),
        checkpoint_id: checkpoint_id.to_string(),
        reason: reason.clone(),
    });

    set_state(shared, CycleState::Reflecting);
    let (goal, change_count, iterations) =
        with_context(shared, |c| (c.goal.clone(), c.change_set.len(), c.iterations)).unwrap_or_default();

    let cancelled = shared.cancel_requested.load(Ordering::SeqCst);
    shared
        .reflection
        .record(ReflectionEntry {
            cycle_id: cycle_id.to_string(),
            goal,
            outcome: if cancelled { CycleOutcome::Cancelled } else { CycleOutcome::Failed },
            duration_ms: start.elapsed().as_millis() as u64,
            change_count,
            iterations,
            notes: reason.clone(),
            recorded_at: Utc::now(),
        })
        .await;

    if cancelled {
        finish_cancelled(shared, cycle_id, start).await;
    } else {
        finish_failed_with_summary(shared, cycle_id, start, reason).await;
    }
}

async fn finish_done(shared: &Arc<Shared>, cycle_id: &str, start: Instant, summary: String) {
    set_state(shared, CycleState::Done);
    shared.events.emit(EventMsg::CycleDone {
        cycle_id: cycle_id.to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
        summary,
    });
    back_to_idle(shared);
}

async fn finish_failed(shared: &Arc<Shared>, cycle_id: &str, start: Instant, error: CycleError) {
    let change_count = with_context(shared, |c| c.change_set.len()).unwrap_or(0);
    let iterations = with_context(shared, |c| c.iterations).unwrap_or(0);
    let goal = with_context(shared, |c| c.goal.clone()).unwrap_or_default();
    tracing::warn!(%error, "cycle failed");
    shared
        .reflection
        .record(ReflectionEntry {
            cycle_id: cycle_id.to_string(),
            goal,
            outcome: CycleOutcome::Failed,
            duration_ms: start.elapsed().as_millis() as u64,
            change_count,
            iterations,
            notes: error.to_string(),
            recorded_at: Utc::now(),
        })
        .await;
    finish_failed_with_summary(shared, cycle_id, start, error.to_string()).await;
}

async fn finish_failed_with_summary(shared: &Arc<Shared>, cycle_id: &str, start: Instant, summary: String) {
    set_state(shared, CycleState::Failed);
    shared.events.emit(EventMsg::CycleFailed {
        cycle_id: cycle_id.to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
        summary,
    });
    back_to_idle(shared);
}

async fn finish_cancelled(shared: &Arc<Shared>, cycle_id: &str, start: Instant) {
    set_state(shared, CycleState::Cancelled);
    shared.events.emit(EventMsg::CycleCancelled {
        cycle_id: cycle_id.to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
        summary: "cancelled".to_string(),
    });
    back_to_idle(shared);
}

fn back_to_idle(shared: &Shared) {
    shared.cancel_requested.store(false, Ordering::SeqCst);
    shared.paused.store(false, Ordering::SeqCst);
    *shared.stored_state.lock().unwrap_or_else(|e| e.into_inner()) = None;
    *shared.state.lock().unwrap_or_else(|e| e.into_inner()) = CycleState::Idle;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::GateConfig;
    use crate::approval::MasterMode;
    use crate::reflection::InMemoryReflectionSink;
    use crate::verifier::VerificationOutcome;
    use crate::verifier::VerifierError;
    use crate::vfs::InMemoryVfs;
    use std::time::Duration as StdDuration;
    use tokio::time::timeout;

    struct FixedCurator(Vec<String>);

    #[async_trait]
    impl Curator for FixedCurator {
        async fn curate(&self, _goal: &str) -> Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    struct FixedGenerator(String);

    #[async_trait]
    impl ProposalGenerator for FixedGenerator {
        async fn generate(&self, _context_bundle: &str) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    struct FixedVerifier(bool);

    #[async_trait]
    impl VerifierAdapter for FixedVerifier {
        async fn run(
            &self,
            _snapshot: &HashMap<String, Vec<u8>>,
        ) -> std::result::Result<VerificationOutcome, VerifierError> {
            Ok(VerificationOutcome {
                passed: self.0,
                summary: if self.0 { "ok".to_string() } else { "1 failing test".to_string() },
                duration_ms: 1,
            })
        }

        fn timeout(&self) -> Duration {
            StdDuration::from_secs(5)
        }
    }

    fn build_engine(verifier_passes: bool, patch_bundle: String) -> (CycleEngine, Arc<InMemoryVfs>) {
        let vfs = Arc::new(InMemoryVfs::new());
        vfs.seed([("/src/main.js".to_string(), b"export {}".to_vec())]);
        let gate = Arc::new(ApprovalGate::new(GateConfig::default(), EventBus::default()));
        let engine = CycleEngine::new(CycleEngineConfig {
            vfs: vfs.clone(),
            verifier: Arc::new(FixedVerifier(verifier_passes)),
            reflection: Arc::new(InMemoryReflectionSink::new()),
            curator: Arc::new(FixedCurator(vec!["/src/main.js".to_string()])),
            generator: Arc::new(FixedGenerator(patch_bundle)),
            gate,
            events: EventBus::default(),
            config: Config::defaults(),
            author: "sentinel".to_string(),
        });
        (engine, vfs)
    }

    fn util_patch() -> String {
        sentinel_codec::encode_patch(
            &[sentinel_codec::Change::create(
                "/src/util.js",
                "export const g=()=>1",
                "add greet helper",
            )],
            None,
        )
    }

    async fn wait_for_state(engine: &CycleEngine, target: CycleState) {
        timeout(StdDuration::from_secs(1), async {
            loop {
                if engine.get_status().state == target {
                    return;
                }
                tokio::time::sleep(StdDuration::from_millis(2)).await;
            }
        })
        .await
        .expect("state reached before timeout");
    }

    #[tokio::test]
    async fn happy_path_reaches_done_and_commits() {
        let (engine, vfs) = build_engine(true, util_patch());
        engine.start_cycle("add greet()".to_string()).unwrap();

        wait_for_state(&engine, CycleState::AwaitingContextApproval).await;
        engine.approve_current(None).unwrap();

        wait_for_state(&engine, CycleState::AwaitingProposalApproval).await;
        engine.approve_current(None).unwrap();

        wait_for_state(&engine, CycleState::Done).await;
        assert_eq!(vfs.commit_count(), 1);
        assert_eq!(
            vfs.last_commit_message().as_deref(),
            Some("Turn 1: add greet()")
        );
    }

    #[tokio::test]
    async fn rejecting_context_loops_back_and_increments_iterations() {
        let (engine, _vfs) = build_engine(true, util_patch());
        engine.start_cycle("add greet()".to_string()).unwrap();

        wait_for_state(&engine, CycleState::AwaitingContextApproval).await;
        engine.revise_current("include /src/util.js".to_string()).unwrap();

        wait_for_state(&engine, CycleState::AwaitingContextApproval).await;
        assert_eq!(
            engine.get_status().context.unwrap().iterations,
            1
        );
        engine.approve_current(None).unwrap();
        wait_for_state(&engine, CycleState::AwaitingProposalApproval).await;
        engine.approve_current(None).unwrap();
        wait_for_state(&engine, CycleState::Done).await;
    }

    #[tokio::test]
    async fn verification_failure_rolls_back_and_fails() {
        let (engine, vfs) = build_engine(false, util_patch());
        engine.start_cycle("add greet()".to_string()).unwrap();

        wait_for_state(&engine, CycleState::AwaitingContextApproval).await;
        engine.approve_current(None).unwrap();
        wait_for_state(&engine, CycleState::AwaitingProposalApproval).await;
        engine.approve_current(None).unwrap();

        wait_for_state(&engine, CycleState::Failed).await;
        assert_eq!(vfs.commit_count(), 0);
        let snapshot = vfs.snapshot().await.unwrap();
        assert!(!snapshot.contains_key("/src/util.js"));
    }

    #[tokio::test]
    async fn autonomous_mode_skips_approvals() {
        let vfs = Arc::new(InMemoryVfs::new());
        vfs.seed([("/src/main.js".to_string(), b"export {}".to_vec())]);
        let gate_config = GateConfig {
            master_mode: MasterMode::Autonomous,
            ..Default::default()
        };
        let gate = Arc::new(ApprovalGate::new(gate_config, EventBus::default()));
        let engine = CycleEngine::new(CycleEngineConfig {
            vfs: vfs.clone(),
            verifier: Arc::new(FixedVerifier(true)),
            reflection: Arc::new(InMemoryReflectionSink::new()),
            curator: Arc::new(FixedCurator(vec!["/src/main.js".to_string()])),
            generator: Arc::new(FixedGenerator(util_patch())),
            gate,
            events: EventBus::default(),
            config: Config::defaults(),
            author: "sentinel".to_string(),
        });

        engine.start_cycle("add greet()".to_string()).unwrap();
        wait_for_state(&engine, CycleState::Done).await;
        assert!(engine.get_status().pending_approvals.is_empty());
    }

    #[tokio::test]
    async fn cancel_during_awaiting_proposal_yields_cancelled_with_no_commit() {
        let (engine, vfs) = build_engine(true, util_patch());
        engine.start_cycle("add greet()".to_string()).unwrap();

        wait_for_state(&engine, CycleState::AwaitingContextApproval).await;
        engine.approve_current(None).unwrap();
        wait_for_state(&engine, CycleState::AwaitingProposalApproval).await;

        engine.cancel_cycle();
        wait_for_state(&engine, CycleState::Cancelled).await;
        assert_eq!(vfs.commit_count(), 0);
        assert!(engine.get_status().context.unwrap().checkpoint_id.is_none());
    }

    #[tokio::test]
    async fn stale_modify_old_content_fails_before_apply() {
        let patch = sentinel_codec::encode_patch(
            &[sentinel_codec::Change::modify(
                "/src/main.js",
                "export const g=()=>1",
                Some("not what's actually there".to_string()),
                "update main",
            )],
            None,
        );
        let (engine, vfs) = build_engine(true, patch);
        engine.start_cycle("add greet()".to_string()).unwrap();

        wait_for_state(&engine, CycleState::AwaitingContextApproval).await;
        engine.approve_current(None).unwrap();
        wait_for_state(&engine, CycleState::AwaitingProposalApproval).await;
        engine.approve_current(None).unwrap();

        wait_for_state(&engine, CycleState::Failed).await;
        assert_eq!(vfs.commit_count(), 0);
        let snapshot = vfs.snapshot().await.unwrap();
        assert_eq!(
            snapshot.get("/src/main.js").map(|b| b.as_slice()),
            Some(b"export {}".as_slice())
        );
    }

    #[tokio::test]
    async fn create_over_existing_path_fails_before_apply() {
        let patch = sentinel_codec::encode_patch(
            &[sentinel_codec::Change::create(
                "/src/main.js",
                "export const g=()=>1",
                "recreate main",
            )],
            None,
        );
        let (engine, vfs) = build_engine(true, patch);
        engine.start_cycle("add greet()".to_string()).unwrap();

        wait_for_state(&engine, CycleState::AwaitingContextApproval).await;
        engine.approve_current(None).unwrap();
        wait_for_state(&engine, CycleState::AwaitingProposalApproval).await;
        engine.approve_current(None).unwrap();

        wait_for_state(&engine, CycleState::Failed).await;
        assert_eq!(vfs.commit_count(), 0);
    }

    #[tokio::test]
    async fn starting_while_busy_returns_busy() {
        let (engine, _vfs) = build_engine(true, util_patch());
        engine.start_cycle("first".to_string()).unwrap();
        wait_for_state(&engine, CycleState::AwaitingContextApproval).await;

        let err = engine.start_cycle("second".to_string()).unwrap_err();
        assert!(matches!(err, CycleError::Busy(_)));
    }

    #[tokio::test]
    async fn empty_goal_is_rejected() {
        let (engine, _vfs) = build_engine(true, util_patch());
        let err = engine.start_cycle("   ".to_string()).unwrap_err();
        assert!(matches!(err, CycleError::InvalidGoal(_)));
    }
}
