//! Multi-subscriber fan-out of streaming chunks and lifecycle events, plus
//! the reconnect-resumption surface.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::CoreResult;
use crate::store::Store;
use crate::types::{Session, SessionStatus};

const PER_CONVERSATION_CAPACITY: usize = 256;
const GLOBAL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    MessageCreated { message: Value },
    Stream { session_id: String, chunk: Value },
    SessionUpdated {
        session_id: String,
        status: String,
        message: Option<Value>,
        error: Option<String>,
    },
    ConversationUpdated { conversation: Value },
}

impl SyncEvent {
    /// Lifecycle events are everything but `stream` — these are mirrored to
    /// the global channel that delivers sidebar-style lifecycle updates.
    fn is_lifecycle(&self) -> bool {
        !matches!(self, SyncEvent::Stream { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ResumeOutcome {
    Attach { session: Session },
    Replay { session: Session },
    Terminal { session: Session },
    Idle,
}

struct ConversationChannel {
    sender: broadcast::Sender<SyncEvent>,
}

/// In-process publish/subscribe hub keyed by `conversationId`. Per-key
/// exclusion is provided by `DashMap`'s shard locking.
pub struct SyncHub {
    channels: DashMap<String, ConversationChannel>,
    global: broadcast::Sender<SyncEvent>,
}

impl SyncHub {
    pub fn new() -> Self {
        let (global, _) = broadcast::channel(GLOBAL_CAPACITY);
        Self {
            channels: DashMap::new(),
            global,
        }
    }

    fn channel_for(&self, conversation_id: &str) -> broadcast::Sender<SyncEvent> {
        self.channels
            .entry(conversation_id.to_string())
            .or_insert_with(|| ConversationChannel {
                sender: broadcast::channel(PER_CONVERSATION_CAPACITY).0,
            })
            .sender
            .clone()
    }

    /// Publishes to the conversation's channel and, for lifecycle events
    /// (not `stream`), to the global sidebar channel too. Best-effort:
    /// `broadcast::Sender::send` only fails when there are no subscribers,
    /// which is not an error here — delivery is inherently best-effort.
    pub fn publish(&self, conversation_id: &str, event: SyncEvent) {
        if event.is_lifecycle() {
            let _ = self.global.send(event.clone());
        }
        let _ = self.channel_for(conversation_id).send(event);
    }

    pub fn subscribe(&self, conversation_id: &str) -> broadcast::Receiver<SyncEvent> {
        self.channel_for(conversation_id).subscribe()
    }

    pub fn subscribe_global(&self) -> broadcast::Receiver<SyncEvent> {
        self.global.subscribe()
    }

    /// Looks up the latest session for `conversationId` and classifies it
    /// into one of four reconnect modes.
    pub async fn resume(&self, store: &Store, conversation_id: &str) -> CoreResult<ResumeOutcome> {
        let latest = store.latest_session(conversation_id).await?;
        Ok(match latest {
            None => ResumeOutcome::Idle,
            Some(session) => match session.status {
                SessionStatus::Pending | SessionStatus::Processing => {
                    ResumeOutcome::Attach { session }
                }
                SessionStatus::Completed => ResumeOutcome::Replay { session },
                SessionStatus::Error | SessionStatus::Timeout | SessionStatus::Cancelled => {
                    ResumeOutcome::Terminal { session }
                }
            },
        })
    }

    /// Drops the channel for a conversation once no subscribers and no
    /// in-flight session remain; channels are otherwise kept around for the
    /// lifetime of the process (they are cheap — one `broadcast::Sender`).
    pub fn prune_if_idle(&self, conversation_id: &str) {
        if let Some(entry) = self.channels.get(conversation_id) {
            if entry.sender.receiver_count() == 0 {
                drop(entry);
                self.channels.remove(conversation_id);
            }
        }
    }
}

impl Default for SyncHub {
    fn default() -> Self {
        Self::new()
    }
}
