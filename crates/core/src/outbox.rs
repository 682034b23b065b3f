//! Client-side offline queue: the counterpart to `SyncHub` that makes
//! reconnect-and-flush correctness testable end-to-end without a browser.
//! Dispatch requests are queued FIFO while "offline" and flushed through a
//! [`Dispatcher`] on reconnect, retried with exponential backoff.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::dispatcher::{DispatchRequest, Dispatcher};
use crate::error::CoreError;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(16);
const MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct QueuedDispatch {
    pub request: DispatchRequest,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Dispatched,
    HardFailure { reason: String },
}

/// FIFO queue of outbound dispatches awaiting a live connection. Not
/// thread-pooled: a single `flush` call drains the queue in order, so queued
/// operations always flush in the order they were enqueued.
pub struct ClientOutbox {
    queue: Mutex<VecDeque<QueuedDispatch>>,
}

impl ClientOutbox {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn enqueue(&self, request: DispatchRequest) {
        self.queue.lock().expect("outbox mutex poisoned").push_back(QueuedDispatch {
            request,
            attempts: 0,
        });
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("outbox mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flushes the queue against `dispatcher`, retrying each entry with
    /// exponential backoff (1s -> 16s cap) up to `MAX_ATTEMPTS` times before
    /// surfacing a hard failure and leaving the operation off the queue for
    /// manual retry.
    pub async fn flush(&self, dispatcher: &Arc<Dispatcher>) -> Vec<FlushOutcome> {
        let mut outcomes = Vec::new();

        loop {
            let next = {
                let mut guard = self.queue.lock().expect("outbox mutex poisoned");
                guard.pop_front()
            };
            let Some(mut entry) = next else { break };

            match dispatcher.dispatch(entry.request.clone()).await {
                Ok(_) => {
                    outcomes.push(FlushOutcome::Dispatched);
                }
                Err(err) => {
                    entry.attempts += 1;
                    if entry.attempts >= MAX_ATTEMPTS {
                        outcomes.push(FlushOutcome::HardFailure {
                            reason: describe(&err),
                        });
                        // Stays off the queue: the operation is no longer
                        // auto-retried once it surfaces as a hard failure.
                    } else {
                        // `entry.attempts` was just incremented to the count
                        // of failures seen so far (1-indexed); the backoff
                        // schedule is 0-indexed so the first retry waits the
                        // full 1s rather than skipping straight to 2s.
                        let backoff = backoff_for(entry.attempts - 1);
                        tokio::time::sleep(backoff).await;
                        self.queue.lock().expect("outbox mutex poisoned").push_back(entry);
                        // A single failed retry goes back to the tail; the
                        // next flush() call (typically triggered by the next
                        // reconnect) will pick it up again.
                        break;
                    }
                }
            }
        }

        outcomes
    }
}

impl Default for ClientOutbox {
    fn default() -> Self {
        Self::new()
    }
}

fn backoff_for(attempt: u32) -> Duration {
    let doubled = INITIAL_BACKOFF.saturating_mul(1 << attempt.min(4));
    doubled.min(MAX_BACKOFF)
}

fn describe(err: &CoreError) -> String {
    err.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{EchoAgent, StaticAgentProvider};
    use crate::registry::SessionRegistry;
    use crate::store::{NewConversation, Store};
    use crate::synchub::SyncHub;
    use crate::types::ConversationSource;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Arc;

    async fn setup() -> (Arc<Store>, Arc<Dispatcher>) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let store = Arc::new(Store::from_pool(pool));
        let registry = SessionRegistry::new(crate::registry::DEFAULT_RETENTION_MS);
        let sync_hub = Arc::new(SyncHub::new());
        let agents: Arc<dyn crate::agent::AgentProvider> =
            Arc::new(StaticAgentProvider::new(Arc::new(EchoAgent)));
        let dispatcher = Dispatcher::new(store.clone(), registry, sync_hub, agents, 5_000, 5_000);
        (store, dispatcher)
    }

    #[tokio::test]
    async fn flush_drains_queued_dispatches_in_order() {
        let (store, dispatcher) = setup().await;
        let conversation = store
            .create_conversation(NewConversation {
                agent_id: "claude-code".into(),
                title: None,
                source: ConversationSource::Gui,
                external_id: None,
                project_path: None,
            })
            .await
            .unwrap();

        let outbox = ClientOutbox::new();
        outbox.enqueue(DispatchRequest {
            conversation_id: conversation.id.clone(),
            user_message_content: "a".into(),
            agent_id: "claude-code".into(),
            idempotency_key: Some("k-a".into()),
            folder_context: crate::agent::FolderContext::default(),
        });
        outbox.enqueue(DispatchRequest {
            conversation_id: conversation.id.clone(),
            user_message_content: "b".into(),
            agent_id: "claude-code".into(),
            idempotency_key: Some("k-b".into()),
            folder_context: crate::agent::FolderContext::default(),
        });

        let outcomes = outbox.flush(&dispatcher).await;
        assert_eq!(outcomes, vec![FlushOutcome::Dispatched, FlushOutcome::Dispatched]);
        assert!(outbox.is_empty());

        let messages = store.list_messages(&conversation.id, 100, 0).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "a");
        assert_eq!(messages[1].content, "b");
    }

    #[tokio::test]
    async fn flush_of_unknown_conversation_reports_hard_failure_after_max_attempts() {
        let (_store, dispatcher) = setup().await;
        let outbox = ClientOutbox::new();
        outbox.enqueue(DispatchRequest {
            conversation_id: "does-not-exist".into(),
            user_message_content: "a".into(),
            agent_id: "claude-code".into(),
            idempotency_key: Some("k-missing".into()),
            folder_context: crate::agent::FolderContext::default(),
        });

        // Drain through all retry rounds; each call to flush() re-attempts
        // whatever is still queued after its backoff sleep.
        let mut last = Vec::new();
        for _ in 0..MAX_ATTEMPTS {
            last = outbox.flush(&dispatcher).await;
            if !last.is_empty() {
                break;
            }
        }

        assert_eq!(last.len(), 1);
        assert!(matches!(last[0], FlushOutcome::HardFailure { .. }));
    }
}
