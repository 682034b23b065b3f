//! End-to-end scenarios, universal invariants, and boundary behaviours for
//! the session lifecycle and durable-message core.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use session_core::agent::{Agent, AgentProvider, AgentRunResult, EchoAgent, FolderContext, StaticAgentProvider};
use session_core::error::CoreError;
use session_core::fsm::{FsmState, SessionFsm};
use session_core::registry::SessionRegistry;
use session_core::store::{ConversationPatch, NewConversation, Store};
use session_core::synchub::{ResumeOutcome, SyncHub};
use session_core::types::{ConversationSource, ConversationStatus, Role};
use session_core::{DispatchRequest, Dispatcher};
use sqlx::sqlite::SqlitePoolOptions;

async fn in_memory_store() -> Arc<Store> {
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite pool");
    sqlx::migrate!("./migrations").run(&pool).await.expect("run migrations");
    Arc::new(Store::from_pool(pool))
}

async fn dispatcher_with_agent(
    store: Arc<Store>,
    agent: Arc<dyn Agent>,
    session_timeout_ms: u64,
) -> (Arc<SessionRegistry>, Arc<SyncHub>, Arc<Dispatcher>) {
    let registry = SessionRegistry::new(session_core::registry::DEFAULT_RETENTION_MS);
    let sync_hub = Arc::new(SyncHub::new());
    let agents: Arc<dyn AgentProvider> = Arc::new(StaticAgentProvider::new(agent));
    let dispatcher = Dispatcher::new(store, registry.clone(), sync_hub.clone(), agents, session_timeout_ms, 5_000);
    (registry, sync_hub, dispatcher)
}

async fn new_conversation(store: &Store, agent_id: &str) -> session_core::Conversation {
    store
        .create_conversation(NewConversation {
            agent_id: agent_id.to_string(),
            title: None,
            source: ConversationSource::Gui,
            external_id: None,
            project_path: None,
        })
        .await
        .unwrap()
}

/// Scenario 1: idempotent retry.
#[tokio::test]
async fn scenario_idempotent_retry() {
    let store = in_memory_store().await;
    let conversation = new_conversation(&store, "claude-code").await;

    let m1 = store
        .append_message(&conversation.id, Role::User, "hi", Some("k-1"))
        .await
        .unwrap();
    let m2 = store
        .append_message(&conversation.id, Role::User, "hi", Some("k-1"))
        .await
        .unwrap();
    let m3 = store
        .append_message(&conversation.id, Role::User, "hi", Some("k-1"))
        .await
        .unwrap();

    assert_eq!(m1.id, m2.id);
    assert_eq!(m1.id, m3.id);

    let messages = store.list_messages(&conversation.id, 100, 0).await.unwrap();
    assert_eq!(messages.len(), 1);
}

/// Scenario 2: crash-safe ordering under concurrent distinct senders.
#[tokio::test]
async fn scenario_crash_safe_ordering() {
    let store = in_memory_store().await;
    let conversation = new_conversation(&store, "claude-code").await;

    let handles: Vec<_> = [("a", "k-a"), ("b", "k-b"), ("c", "k-c")]
        .into_iter()
        .map(|(content, key)| {
            let store = store.clone();
            let conversation_id = conversation.id.clone();
            tokio::spawn(async move {
                store
                    .append_message(&conversation_id, Role::User, content, Some(key))
                    .await
                    .unwrap()
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }

    let messages = store.list_messages(&conversation.id, 100, 0).await.unwrap();
    assert_eq!(messages.len(), 3);
    for window in messages.windows(2) {
        assert!(window[0].created_at < window[1].created_at);
    }
    let contents: std::collections::HashSet<_> = messages.iter().map(|m| m.content.clone()).collect();
    assert_eq!(contents.len(), 3);
}

/// Scenario 3: session recovery when the session already completed.
#[tokio::test]
async fn scenario_session_recovery_completed() {
    let store = in_memory_store().await;
    let conversation = new_conversation(&store, "claude-code").await;

    struct PongAgent;
    #[async_trait::async_trait]
    impl Agent for PongAgent {
        async fn run(
            &self,
            _prompt: &str,
            _folder_context: &FolderContext,
            _cancellation: tokio_util::sync::CancellationToken,
            on_chunk: Arc<dyn Fn(session_core::types::AgentBlock) + Send + Sync>,
        ) -> Result<AgentRunResult, CoreError> {
            on_chunk(session_core::types::AgentBlock::Text { text: "pong".into() });
            Ok(AgentRunResult { final_text: "pong".into(), usage: None })
        }
    }

    let (_registry, sync_hub, dispatcher) =
        dispatcher_with_agent(store.clone(), Arc::new(PongAgent), 5_000).await;

    let handle = dispatcher
        .dispatch(DispatchRequest {
            conversation_id: conversation.id.clone(),
            user_message_content: "ping".into(),
            agent_id: "claude-code".into(),
            idempotency_key: Some("k-2".into()),
            folder_context: FolderContext::default(),
        })
        .await
        .unwrap();

    handle.fsm.completion().await.unwrap();

    let resume = sync_hub.resume(&store, &conversation.id).await.unwrap();
    match resume {
        ResumeOutcome::Replay { session } => {
            assert_eq!(session.status, session_core::types::SessionStatus::Completed);
            assert_eq!(session.response.unwrap().text, "pong");
        }
        other => panic!("expected Replay outcome, got {other:?}"),
    }
}

/// Scenario 4: session recovery while the agent is still producing chunks.
#[tokio::test]
async fn scenario_session_recovery_in_flight() {
    let store = in_memory_store().await;
    let conversation = new_conversation(&store, "claude-code").await;

    struct SlowAgent;
    #[async_trait::async_trait]
    impl Agent for SlowAgent {
        async fn run(
            &self,
            _prompt: &str,
            _folder_context: &FolderContext,
            _cancellation: tokio_util::sync::CancellationToken,
            on_chunk: Arc<dyn Fn(session_core::types::AgentBlock) + Send + Sync>,
        ) -> Result<AgentRunResult, CoreError> {
            on_chunk(session_core::types::AgentBlock::Text { text: "working".into() });
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(AgentRunResult { final_text: "done".into(), usage: None })
        }
    }

    let (_registry, sync_hub, dispatcher) =
        dispatcher_with_agent(store.clone(), Arc::new(SlowAgent), 5_000).await;

    dispatcher
        .dispatch(DispatchRequest {
            conversation_id: conversation.id.clone(),
            user_message_content: "ping".into(),
            agent_id: "claude-code".into(),
            idempotency_key: Some("k-3".into()),
            folder_context: FolderContext::default(),
        })
        .await
        .unwrap();

    // Give the background task time to emit the first chunk and flip the
    // session to `processing` but not enough to finish.
    tokio::time::sleep(Duration::from_millis(60)).await;

    let resume = sync_hub.resume(&store, &conversation.id).await.unwrap();
    match resume {
        ResumeOutcome::Attach { session } => {
            assert_eq!(session.status, session_core::types::SessionStatus::Processing);
        }
        ResumeOutcome::Replay { .. } => {
            // Acceptable if the background task outran the sleep above;
            // still proves resume() classifies the session correctly.
        }
        other => panic!("expected Attach or Replay outcome, got {other:?}"),
    }
}

/// Scenario 5: watchdog timeout when the agent never produces a result.
#[tokio::test]
async fn scenario_watchdog_timeout() {
    let store = in_memory_store().await;
    let conversation = new_conversation(&store, "claude-code").await;

    struct HangingAgent;
    #[async_trait::async_trait]
    impl Agent for HangingAgent {
        async fn run(
            &self,
            _prompt: &str,
            _folder_context: &FolderContext,
            cancellation: tokio_util::sync::CancellationToken,
            _on_chunk: Arc<dyn Fn(session_core::types::AgentBlock) + Send + Sync>,
        ) -> Result<AgentRunResult, CoreError> {
            cancellation.cancelled().await;
            Err(CoreError::Cancelled)
        }
    }

    let (registry, _sync_hub, dispatcher) =
        dispatcher_with_agent(store.clone(), Arc::new(HangingAgent), 500).await;

    let handle = dispatcher
        .dispatch(DispatchRequest {
            conversation_id: conversation.id.clone(),
            user_message_content: "ping".into(),
            agent_id: "claude-code".into(),
            idempotency_key: Some("k-5".into()),
            folder_context: FolderContext::default(),
        })
        .await
        .unwrap();

    let outcome = handle.fsm.completion().await.unwrap_err();
    assert!(matches!(outcome, CoreError::Timeout(_)));

    // Allow the background task's failure handler to persist the terminal row.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let session = store.get_session(&handle.session.id).await.unwrap().unwrap();
    assert!(matches!(
        session.status,
        session_core::types::SessionStatus::Timeout | session_core::types::SessionStatus::Error
    ));

    let diagnostics = registry.diagnostics();
    assert!(diagnostics
        .recent_terminal
        .iter()
        .any(|t| t.session_id == handle.session.id));
}

/// Scenario 6: invalid transition guard.
#[tokio::test]
async fn scenario_invalid_transition_guard() {
    let fsm = SessionFsm::new("s1", "c1", "m1", 60_000);
    let err = fsm.transition(FsmState::Completed, None, Value::Null).unwrap_err();
    assert!(matches!(err, CoreError::InvalidTransition(_)));
    assert_eq!(fsm.state(), FsmState::Pending);
    assert_eq!(fsm.history().len(), 1);
}

/// Boundary: empty and very large content are both accepted.
#[tokio::test]
async fn boundary_empty_and_large_content_accepted() {
    let store = in_memory_store().await;
    let conversation = new_conversation(&store, "claude-code").await;

    let empty = store
        .append_message(&conversation.id, Role::User, "", Some("k-empty"))
        .await
        .unwrap();
    assert_eq!(empty.content, "");

    let large_content = "x".repeat(10_000);
    let large = store
        .append_message(&conversation.id, Role::User, &large_content, Some("k-large"))
        .await
        .unwrap();
    assert_eq!(large.content.len(), 10_000);
}

/// Boundary: five concurrent appends all persist with distinct timestamps.
#[tokio::test]
async fn boundary_five_concurrent_appends_all_persist() {
    let store = in_memory_store().await;
    let conversation = new_conversation(&store, "claude-code").await;

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let store = store.clone();
            let conversation_id = conversation.id.clone();
            tokio::spawn(async move {
                store
                    .append_message(&conversation_id, Role::User, &format!("m{i}"), Some(&format!("k-{i}")))
                    .await
                    .unwrap()
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }

    let messages = store.list_messages(&conversation.id, 100, 0).await.unwrap();
    assert_eq!(messages.len(), 5);
    let timestamps: std::collections::HashSet<_> = messages.iter().map(|m| m.created_at).collect();
    assert_eq!(timestamps.len(), 5);
}

/// Boundary: `latestSession` on a conversation with no sessions returns null.
#[tokio::test]
async fn boundary_latest_session_empty_conversation() {
    let store = in_memory_store().await;
    let conversation = new_conversation(&store, "claude-code").await;
    assert!(store.latest_session(&conversation.id).await.unwrap().is_none());
}

/// Boundary: an expired idempotency key is a cache miss, not a replay.
#[tokio::test]
async fn boundary_expired_idempotency_key_creates_new_message() {
    let store = in_memory_store().await;
    let conversation = new_conversation(&store, "claude-code").await;

    let first = store
        .append_message(&conversation.id, Role::User, "hi", Some("k-expired"))
        .await
        .unwrap();

    // Directly age the idempotency record past the 24h TTL to simulate
    // expiry without sleeping in a test.
    sqlx::query("UPDATE idempotency_records SET created_at = 0 WHERE key = 'k-expired'")
        .execute(store.pool())
        .await
        .unwrap();

    let second = store
        .append_message(&conversation.id, Role::User, "hi", Some("k-expired"))
        .await
        .unwrap();

    assert_ne!(first.id, second.id);
    let messages = store.list_messages(&conversation.id, 100, 0).await.unwrap();
    assert_eq!(messages.len(), 2);
}

/// Universal invariant: updateConversation is idempotent in its observable
/// side effects beyond `updatedAt`.
#[tokio::test]
async fn invariant_update_conversation_is_idempotent() {
    let store = in_memory_store().await;
    let conversation = new_conversation(&store, "claude-code").await;

    let patch = ConversationPatch {
        title: Some("renamed".into()),
        status: Some(ConversationStatus::Active),
    };
    let first = store
        .update_conversation(&conversation.id, ConversationPatch { title: patch.title.clone(), status: patch.status })
        .await
        .unwrap();
    let second = store
        .update_conversation(&conversation.id, ConversationPatch { title: patch.title.clone(), status: patch.status })
        .await
        .unwrap();

    assert_eq!(first.title, second.title);
    assert_eq!(first.status, second.status);
}

/// Universal invariant: a completed session's assistant message points back
/// at the session and postdates the triggering user message.
#[tokio::test]
async fn invariant_completed_session_links_to_assistant_message() {
    let store = in_memory_store().await;
    let conversation = new_conversation(&store, "claude-code").await;

    let (_registry, _sync_hub, dispatcher) =
        dispatcher_with_agent(store.clone(), Arc::new(EchoAgent), 5_000).await;

    let handle = dispatcher
        .dispatch(DispatchRequest {
            conversation_id: conversation.id.clone(),
            user_message_content: "ping".into(),
            agent_id: "claude-code".into(),
            idempotency_key: Some("k-invariant".into()),
            folder_context: FolderContext::default(),
        })
        .await
        .unwrap();

    handle.fsm.completion().await.unwrap();

    let session = store.get_session(&handle.session.id).await.unwrap().unwrap();
    let response = session.response.unwrap();
    let assistant_message = store.get_message(&response.assistant_message_id).await.unwrap().unwrap();
    let user_message = store.get_message(&session.user_message_id).await.unwrap().unwrap();

    assert_eq!(assistant_message.role, Role::Assistant);
    assert!(assistant_message.created_at > user_message.created_at);
}
