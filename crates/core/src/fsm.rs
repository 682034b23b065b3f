//! Per-session explicit state machine with a timeout watchdog and a
//! multi-observer completion future.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsmState {
    Pending,
    AcquiringAgent,
    AgentAcquired,
    SendingPrompt,
    Processing,
    Completed,
    Error,
    Timeout,
    Cancelled,
}

impl FsmState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FsmState::Completed | FsmState::Error | FsmState::Timeout | FsmState::Cancelled
        )
    }

    /// Legal next states from `self`.
    fn legal_targets(self) -> &'static [FsmState] {
        use FsmState::*;
        match self {
            Pending => &[AcquiringAgent, Error, Timeout, Cancelled],
            AcquiringAgent => &[AgentAcquired, Error, Timeout, Cancelled],
            AgentAcquired => &[SendingPrompt, Error, Timeout, Cancelled],
            SendingPrompt => &[Processing, Error, Timeout, Cancelled],
            Processing => &[Completed, Error, Timeout, Cancelled],
            Completed | Error | Timeout | Cancelled => &[],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FsmState::Pending => "pending",
            FsmState::AcquiringAgent => "acquiring_agent",
            FsmState::AgentAcquired => "agent_acquired",
            FsmState::SendingPrompt => "sending_prompt",
            FsmState::Processing => "processing",
            FsmState::Completed => "completed",
            FsmState::Error => "error",
            FsmState::Timeout => "timeout",
            FsmState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub state: FsmState,
    pub timestamp_ms: i64,
    pub reason: Option<String>,
    pub details: Value,
}

/// The per-session data bag accumulated over the FSM's lifetime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionData {
    pub agent_connection_time: Option<i64>,
    pub prompt_sent_time: Option<i64>,
    pub response_received_time: Option<i64>,
    #[serde(default)]
    pub full_text: String,
    #[serde(default)]
    pub blocks: Vec<Value>,
    pub error: Option<String>,
    pub stack_trace: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl SessionData {
    fn merge(&mut self, data: Value) {
        let Value::Object(map) = data else { return };
        for (key, value) in map {
            match key.as_str() {
                "agentConnectionTime" => {
                    self.agent_connection_time = value.as_i64();
                }
                "promptSentTime" => {
                    self.prompt_sent_time = value.as_i64();
                }
                "responseReceivedTime" => {
                    self.response_received_time = value.as_i64();
                }
                "fullTextDelta" => {
                    if let Some(delta) = value.as_str() {
                        self.full_text.push_str(delta);
                    }
                }
                "block" => {
                    self.blocks.push(value);
                }
                "error" => {
                    self.error = value.as_str().map(str::to_string);
                }
                "stackTrace" => {
                    self.stack_trace = value.as_str().map(str::to_string);
                }
                other => {
                    self.extra.insert(other.to_string(), value);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub state: FsmState,
    pub data: SessionData,
}

struct Inner {
    state: FsmState,
    history: Vec<TransitionRecord>,
    data: SessionData,
}

/// Explicit per-session state machine. Construction arms a watchdog timer;
/// every observable state change goes through [`SessionFsm::transition`].
pub struct SessionFsm {
    pub session_id: String,
    pub conversation_id: String,
    pub user_message_id: String,
    inner: Mutex<Inner>,
    completion_tx: watch::Sender<Option<CompletionOutcome>>,
    completion_rx: watch::Receiver<Option<CompletionOutcome>>,
    /// Doubles as the watchdog-timer's own cancel switch (stops the sleep
    /// early on a normal terminal transition) and as the cancellation handle
    /// handed to the `Agent` collaborator — any terminal transition, from
    /// whichever source, cancels it, so a watchdog timeout aborts an
    /// in-flight `Agent.run` the same way an explicit `cancel()` call does.
    cancellation: CancellationToken,
    created_at: Instant,
}

impl SessionFsm {
    pub fn new(
        session_id: impl Into<String>,
        conversation_id: impl Into<String>,
        user_message_id: impl Into<String>,
        timeout_ms: u64,
    ) -> std::sync::Arc<Self> {
        let (completion_tx, completion_rx) = watch::channel(None);
        let fsm = std::sync::Arc::new(Self {
            session_id: session_id.into(),
            conversation_id: conversation_id.into(),
            user_message_id: user_message_id.into(),
            inner: Mutex::new(Inner {
                state: FsmState::Pending,
                history: vec![TransitionRecord {
                    state: FsmState::Pending,
                    timestamp_ms: now_ms(),
                    reason: Some("constructed".into()),
                    details: Value::Null,
                }],
                data: SessionData::default(),
            }),
            completion_tx,
            completion_rx,
            cancellation: CancellationToken::new(),
            created_at: Instant::now(),
        });

        let watchdog_fsm = fsm.clone();
        let watchdog_token = fsm.cancellation.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                    // Fires are idempotent: transition() is a no-op once terminal.
                    let _ = watchdog_fsm.transition(
                        FsmState::Timeout,
                        Some("watchdog expired".into()),
                        Value::Null,
                    );
                }
                _ = watchdog_token.cancelled() => {}
            }
        });

        fsm
    }

    pub fn state(&self) -> FsmState {
        self.inner.lock().expect("fsm mutex poisoned").state
    }

    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn history(&self) -> Vec<TransitionRecord> {
        self.inner.lock().expect("fsm mutex poisoned").history.clone()
    }

    pub fn data(&self) -> SessionData {
        self.inner.lock().expect("fsm mutex poisoned").data.clone()
    }

    /// The handle to pass into `Agent::run`. Cancelled automatically on any
    /// terminal transition, and can also be cancelled directly to request
    /// cancellation (the Dispatcher does this from `cancel(sessionId)` by
    /// transitioning to `Cancelled` first, which cancels this token as a
    /// side effect).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Merges chunk data into the bag without attempting a state transition.
    /// `Processing` has no legal self-transition (fsm.rs's transition table
    /// only admits it once, from `SendingPrompt`), but an agent run emits
    /// many chunks while staying in `Processing` — callers transition into
    /// `Processing` on the first chunk and merge on every chunk after that.
    /// A no-op once terminal, same as `transition`.
    pub fn merge_data(&self, data: Value) {
        let mut guard = self.inner.lock().expect("fsm mutex poisoned");
        if guard.state.is_terminal() {
            return;
        }
        guard.data.merge(data);
    }

    /// Validates and applies a transition. Terminal states are idempotent:
    /// a transition attempt after the FSM is already terminal is a silent
    /// no-op, which is what makes the watchdog-versus-normal-completion
    /// race safe.
    pub fn transition(
        &self,
        new_state: FsmState,
        reason: Option<String>,
        data: Value,
    ) -> Result<(), CoreError> {
        let mut guard = self.inner.lock().expect("fsm mutex poisoned");

        if guard.state.is_terminal() {
            return Ok(());
        }

        if !guard.state.legal_targets().contains(&new_state) {
            return Err(CoreError::InvalidTransition(format!(
                "{} -> {}",
                guard.state.as_str(),
                new_state.as_str()
            )));
        }

        guard.data.merge(data.clone());
        guard.history.push(TransitionRecord {
            state: new_state,
            timestamp_ms: now_ms(),
            reason,
            details: data,
        });
        guard.state = new_state;

        if new_state.is_terminal() {
            self.cancellation.cancel();
            let outcome = CompletionOutcome {
                state: new_state,
                data: guard.data.clone(),
            };
            // Drop the guard before sending so any synchronous receiver
            // callback doesn't reenter this mutex.
            drop(guard);
            let _ = self.completion_tx.send(Some(outcome));
        }

        Ok(())
    }

    /// Awaits the terminal outcome. Multiple callers may each hold their own
    /// clone of the underlying receiver and observe the same value — a
    /// `tokio::sync::watch` channel rather than a one-shot, since this
    /// completion signal has more than one observer (the Dispatcher's
    /// background task and diagnostics/test callers).
    pub async fn completion(&self) -> Result<CompletionOutcome, CoreError> {
        let mut rx = self.completion_rx.clone();
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return Self::outcome_to_result(outcome);
            }
            if rx.changed().await.is_err() {
                return Err(CoreError::Database {
                    message: "completion channel closed before a terminal state".into(),
                    retryable: false,
                });
            }
        }
    }

    fn outcome_to_result(outcome: CompletionOutcome) -> Result<CompletionOutcome, CoreError> {
        match outcome.state {
            FsmState::Completed => Ok(outcome),
            FsmState::Cancelled => Err(CoreError::Cancelled),
            FsmState::Timeout => Err(CoreError::Timeout(
                outcome.data.error.clone().unwrap_or_else(|| "session timed out".into()),
            )),
            _ => Err(CoreError::Agent(
                outcome.data.error.clone().unwrap_or_else(|| "session failed".into()),
            )),
        }
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}
