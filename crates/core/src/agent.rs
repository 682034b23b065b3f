//! The `Agent` collaborator contract.
//!
//! The Store/FSM/Dispatcher/SyncHub quartet treats the external command-line
//! AI assistant as opaque; this module supplies the trait boundary plus two
//! concrete implementations — `ProcessAgent`, which shells out to a real
//! CLI agent, and `EchoAgent`, a deterministic test double.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::types::AgentBlock;

#[derive(Debug, Clone)]
pub struct AgentRunResult {
    pub final_text: String,
    pub usage: Option<Value>,
}

/// Context handed to an agent invocation: the working directory it should
/// operate from, when the dispatch carries one.
#[derive(Debug, Clone, Default)]
pub struct FolderContext {
    pub path: Option<String>,
}

/// An external command-line AI assistant. Implementations must honor the
/// `CancellationToken` promptly — the FSM is authoritative for cancellation
/// and expects `run` to return a `Cancelled` error shortly after the token
/// fires.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn run(
        &self,
        prompt: &str,
        folder_context: &FolderContext,
        cancellation: CancellationToken,
        on_chunk: Arc<dyn Fn(AgentBlock) + Send + Sync>,
    ) -> Result<AgentRunResult, CoreError>;
}

/// Resolves an `agentId` to a concrete [`Agent`] instance, with a bounded
/// acquisition timeout enforced by the Dispatcher.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    async fn acquire(&self, agent_id: &str) -> Result<Arc<dyn Agent>, CoreError>;
}

/// Spawns a configured CLI binary, feeds the prompt on stdin, and streams
/// stdout lines back as `AgentBlock::Text` chunks.
pub struct ProcessAgent {
    binary: String,
    args: Vec<String>,
}

impl ProcessAgent {
    pub fn new(binary: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            args,
        }
    }
}

#[async_trait]
impl Agent for ProcessAgent {
    async fn run(
        &self,
        prompt: &str,
        folder_context: &FolderContext,
        cancellation: CancellationToken,
        on_chunk: Arc<dyn Fn(AgentBlock) + Send + Sync>,
    ) -> Result<AgentRunResult, CoreError> {
        use tokio::io::AsyncWriteExt;

        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args);
        if let Some(path) = &folder_context.path {
            cmd.current_dir(path);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| CoreError::Agent(format!("failed to spawn {}: {e}", self.binary)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CoreError::Agent("agent process has no stdin".into()))?;
        stdin
            .write_all(prompt.as_bytes())
            .await
            .map_err(|e| CoreError::Agent(format!("failed to write prompt: {e}")))?;
        drop(stdin);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::Agent("agent process has no stdout".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        let mut full_text = String::new();
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    let _ = child.start_kill();
                    return Err(CoreError::Cancelled);
                }
                line = lines.next_line() => {
                    match line.map_err(|e| CoreError::Agent(format!("read error: {e}")))? {
                        Some(text) => {
                            full_text.push_str(&text);
                            full_text.push('\n');
                            on_chunk(AgentBlock::Text { text });
                        }
                        None => break,
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| CoreError::Agent(format!("agent process wait failed: {e}")))?;
        if !status.success() {
            return Err(CoreError::Agent(format!(
                "agent process exited with {status}"
            )));
        }

        Ok(AgentRunResult {
            final_text: full_text.trim_end().to_string(),
            usage: None,
        })
    }
}

/// Deterministic test double: echoes the prompt back as a single chunk.
pub struct EchoAgent;

#[async_trait]
impl Agent for EchoAgent {
    async fn run(
        &self,
        prompt: &str,
        _folder_context: &FolderContext,
        cancellation: CancellationToken,
        on_chunk: Arc<dyn Fn(AgentBlock) + Send + Sync>,
    ) -> Result<AgentRunResult, CoreError> {
        if cancellation.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let text = format!("echo: {prompt}");
        on_chunk(AgentBlock::Text { text: text.clone() });
        Ok(AgentRunResult {
            final_text: text,
            usage: None,
        })
    }
}

/// Maps every `agentId` to the same [`EchoAgent`]; used in tests and as a
/// safe default before a real provider is configured.
pub struct StaticAgentProvider {
    agent: Arc<dyn Agent>,
}

impl StaticAgentProvider {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl AgentProvider for StaticAgentProvider {
    async fn acquire(&self, _agent_id: &str) -> Result<Arc<dyn Agent>, CoreError> {
        Ok(self.agent.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_agent_produces_one_chunk_and_resolves() {
        let agent = EchoAgent;
        let chunks = Arc::new(std::sync::Mutex::new(Vec::new()));
        let chunks_clone = chunks.clone();
        let result = agent
            .run(
                "hi",
                &FolderContext::default(),
                CancellationToken::new(),
                Arc::new(move |block| chunks_clone.lock().unwrap().push(block)),
            )
            .await
            .unwrap();

        assert_eq!(result.final_text, "echo: hi");
        assert_eq!(chunks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn echo_agent_honors_pre_cancelled_token() {
        let agent = EchoAgent;
        let token = CancellationToken::new();
        token.cancel();
        let err = agent
            .run("hi", &FolderContext::default(), token, Arc::new(|_| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
    }
}
