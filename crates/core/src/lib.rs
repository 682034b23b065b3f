//! Session lifecycle and durable-message core for a multi-agent
//! conversational backend: durable storage, per-session state machines,
//! dispatch orchestration, and multi-subscriber event fan-out.

pub mod agent;
pub mod dispatcher;
pub mod error;
pub mod fsm;
pub mod outbox;
pub mod registry;
pub mod store;
pub mod synchub;
pub mod types;

pub use agent::{Agent, AgentProvider, AgentRunResult, EchoAgent, FolderContext, ProcessAgent, StaticAgentProvider};
pub use dispatcher::{DispatchHandle, DispatchRequest, Dispatcher};
pub use error::{CoreError, CoreResult};
pub use fsm::{CompletionOutcome, FsmState, SessionData, SessionFsm, TransitionRecord};
pub use outbox::{ClientOutbox, FlushOutcome, QueuedDispatch};
pub use registry::{Diagnostics, SessionRegistry};
pub use store::{ConversationPatch, IntegrityReport, NewConversation, Store};
pub use synchub::{ResumeOutcome, SyncEvent, SyncHub};
pub use types::*;
