//! Orchestrates the path from an inbound user message to a persisted
//! assistant reply, driving the `SessionFsm` and the `Agent` collaborator.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{Agent, AgentProvider, FolderContext};
use crate::error::{CoreError, CoreResult};
use crate::fsm::{FsmState, SessionFsm};
use crate::registry::SessionRegistry;
use crate::store::Store;
use crate::synchub::{SyncEvent, SyncHub};
use crate::types::{Role, Session, SessionPatch, SessionResponse, SessionStatus};

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub conversation_id: String,
    pub user_message_content: String,
    pub agent_id: String,
    pub idempotency_key: Option<String>,
    pub folder_context: FolderContext,
}

pub struct DispatchHandle {
    pub session: Session,
    pub fsm: Arc<SessionFsm>,
}

/// Default agent-acquisition timeout.
pub const DEFAULT_AGENT_ACQUIRE_TIMEOUT_MS: u64 = 60_000;
/// Default FSM watchdog timeout.
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 120_000;

pub struct Dispatcher {
    store: Arc<Store>,
    registry: Arc<SessionRegistry>,
    sync_hub: Arc<SyncHub>,
    agents: Arc<dyn AgentProvider>,
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
    cancellations: DashMap<String, CancellationToken>,
    session_timeout_ms: u64,
    agent_acquire_timeout_ms: u64,
}

impl Dispatcher {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<SessionRegistry>,
        sync_hub: Arc<SyncHub>,
        agents: Arc<dyn AgentProvider>,
        session_timeout_ms: u64,
        agent_acquire_timeout_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            sync_hub,
            agents,
            locks: DashMap::new(),
            cancellations: DashMap::new(),
            session_timeout_ms,
            agent_acquire_timeout_ms,
        })
    }

    fn lock_for(&self, conversation_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Persists the user message, creates the session row and FSM,
    /// publishes `message_created`, and returns synchronously. The
    /// background task that acquires the agent and drives it to completion
    /// is spawned but not awaited here.
    pub async fn dispatch(self: &Arc<Self>, request: DispatchRequest) -> CoreResult<DispatchHandle> {
        let message = self
            .store
            .append_message(
                &request.conversation_id,
                Role::User,
                &request.user_message_content,
                request.idempotency_key.as_deref(),
            )
            .await?;

        let session = self
            .store
            .create_session(&request.conversation_id, &message.id)
            .await?;

        let fsm = SessionFsm::new(
            session.id.clone(),
            request.conversation_id.clone(),
            message.id.clone(),
            self.session_timeout_ms,
        );
        self.registry.insert(fsm.clone());

        self.sync_hub.publish(
            &request.conversation_id,
            SyncEvent::MessageCreated {
                message: serde_json::to_value(&message).unwrap_or(Value::Null),
            },
        );

        let cancellation = CancellationToken::new();
        self.cancellations
            .insert(session.id.clone(), cancellation.clone());

        let background = self.clone();
        let background_request = request.clone();
        let background_fsm = fsm.clone();
        let background_session_id = session.id.clone();
        tokio::spawn(async move {
            background
                .run_background(background_request, background_fsm, background_session_id, cancellation)
                .await;
        });

        Ok(DispatchHandle { session, fsm })
    }

    async fn run_background(
        self: Arc<Self>,
        request: DispatchRequest,
        fsm: Arc<SessionFsm>,
        session_id: String,
        cancellation: CancellationToken,
    ) {
        // Single-in-flight-per-conversation: hold the conversation's guard
        // for the whole background task so a second dispatch on the same
        // conversation waits for this one to reach a terminal state.
        let guard = self.lock_for(&request.conversation_id);
        let _permit = guard.lock().await;

        let result = self.run_background_inner(&request, &fsm, &session_id, cancellation).await;

        if let Err(err) = result {
            self.fail_session(&request, &fsm, &session_id, err).await;
        }

        self.cancellations.remove(&session_id);
    }

    async fn run_background_inner(
        &self,
        request: &DispatchRequest,
        fsm: &Arc<SessionFsm>,
        session_id: &str,
        cancellation: CancellationToken,
    ) -> CoreResult<()> {
        fsm.transition(FsmState::AcquiringAgent, None, Value::Null)?;

        let agent = tokio::time::timeout(
            Duration::from_millis(self.agent_acquire_timeout_ms),
            self.agents.acquire(&request.agent_id),
        )
        .await
        .map_err(|_| CoreError::Timeout("agent acquisition timed out".into()))??;

        fsm.transition(FsmState::AgentAcquired, None, Value::Null)?;
        fsm.transition(FsmState::SendingPrompt, None, Value::Null)?;

        let hub = self.sync_hub.clone();
        let conversation_id = request.conversation_id.clone();
        let session_id_owned = session_id.to_string();
        let fsm_for_chunks = fsm.clone();
        let store_for_first_chunk = self.store.clone();
        let session_id_for_first_chunk = session_id.to_string();
        let first_chunk_seen = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let on_chunk: Arc<dyn Fn(crate::types::AgentBlock) + Send + Sync> = {
            let first_chunk_seen = first_chunk_seen.clone();
            Arc::new(move |block: crate::types::AgentBlock| {
                let delta = match block.text_delta() {
                    Some(text) => serde_json::json!({ "fullTextDelta": text }),
                    None => serde_json::json!({ "block": &block }),
                };

                // `Processing` has no legal self-transition, so only the
                // chunk that first enters it goes through `transition`;
                // every chunk after that merges straight into the data bag.
                if fsm_for_chunks.state() == FsmState::Processing {
                    fsm_for_chunks.merge_data(delta);
                } else if let Err(err) = fsm_for_chunks.transition(FsmState::Processing, None, delta) {
                    warn!(
                        session_id = %session_id_owned,
                        error = %err,
                        "unexpected failure entering processing on first chunk"
                    );
                }

                hub.publish(
                    &conversation_id,
                    SyncEvent::Stream {
                        session_id: session_id_owned.clone(),
                        chunk: serde_json::to_value(&block).unwrap_or(Value::Null),
                    },
                );

                if !first_chunk_seen.swap(true, std::sync::atomic::Ordering::SeqCst) {
                    let store = store_for_first_chunk.clone();
                    let session_id = session_id_for_first_chunk.clone();
                    tokio::spawn(async move {
                        let _ = store
                            .update_session(
                                &session_id,
                                SessionPatch {
                                    status: Some(SessionStatus::Processing),
                                    ..Default::default()
                                },
                            )
                            .await;
                    });
                }
            })
        };

        let run_result = agent
            .run(
                &request.user_message_content,
                &request.folder_context,
                cancellation,
                on_chunk,
            )
            .await?;

        let assistant_message = self
            .store
            .append_message(
                &request.conversation_id,
                Role::Assistant,
                &run_result.final_text,
                None,
            )
            .await?;

        let completed_at = now_ms();
        let updated_session = self
            .store
            .update_session(
                session_id,
                SessionPatch {
                    status: Some(SessionStatus::Completed),
                    completed_at: Some(completed_at),
                    response: Some(SessionResponse {
                        text: run_result.final_text.clone(),
                        assistant_message_id: assistant_message.id.clone(),
                    }),
                    error: None,
                },
            )
            .await?;

        fsm.transition(
            FsmState::Completed,
            None,
            serde_json::json!({ "fullTextDelta": "" }),
        )?;

        self.sync_hub.publish(
            &request.conversation_id,
            SyncEvent::SessionUpdated {
                session_id: session_id.to_string(),
                status: SessionStatus::Completed.as_str().to_string(),
                message: serde_json::to_value(&assistant_message).ok(),
                error: None,
            },
        );

        info!(
            session_id,
            conversation_id = %request.conversation_id,
            "session completed"
        );
        // The stream has nothing left to deliver for this session; drop the
        // conversation's fan-out channel once no subscriber is attached.
        self.sync_hub.prune_if_idle(&request.conversation_id);
        let _ = updated_session;
        Ok(())
    }

    async fn fail_session(
        &self,
        request: &DispatchRequest,
        fsm: &Arc<SessionFsm>,
        session_id: &str,
        err: CoreError,
    ) {
        let target_state = match &err {
            CoreError::Cancelled => FsmState::Cancelled,
            CoreError::Timeout(_) => FsmState::Timeout,
            _ => FsmState::Error,
        };

        let message = err.to_string();
        let _ = fsm.transition(
            target_state,
            Some(message.clone()),
            serde_json::json!({ "error": message }),
        );

        let status = match target_state {
            FsmState::Cancelled => SessionStatus::Cancelled,
            FsmState::Timeout => SessionStatus::Timeout,
            _ => SessionStatus::Error,
        };

        if let Err(store_err) = self
            .store
            .update_session(
                session_id,
                SessionPatch {
                    status: Some(status),
                    completed_at: Some(now_ms()),
                    error: Some(message.clone()),
                    ..Default::default()
                },
            )
            .await
        {
            warn!(session_id, error = %store_err, "failed to persist terminal session status");
        }

        self.sync_hub.publish(
            &request.conversation_id,
            SyncEvent::SessionUpdated {
                session_id: session_id.to_string(),
                status: status.as_str().to_string(),
                message: None,
                error: Some(message),
            },
        );
        // Same as the completion path: this session's stream is done, so
        // close out the channel if nobody is listening anymore.
        self.sync_hub.prune_if_idle(&request.conversation_id);
    }

    /// External cancellation entry point.
    pub fn cancel(&self, session_id: &str) -> CoreResult<()> {
        let token = self
            .cancellations
            .get(session_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| CoreError::NotFound(format!("no in-flight session {session_id}")))?;
        token.cancel();
        Ok(())
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}
