//! Process-wide index of live `SessionFsm` instances.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use crate::fsm::{FsmState, SessionFsm, TransitionRecord};

#[derive(Debug, Clone, Serialize)]
pub struct ActiveSummary {
    pub session_id: String,
    pub state: String,
    pub uptime_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct TerminalSummary {
    pub session_id: String,
    pub state: String,
    pub history: Vec<TransitionRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub active_count: usize,
    pub terminal_count: usize,
    pub total: usize,
    pub active: Vec<ActiveSummary>,
    pub recent_terminal: Vec<TerminalSummary>,
}

/// Default sweep interval (10 min) and terminal-FSM retention (1 h).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_RETENTION_MS: i64 = 60 * 60 * 1000;

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionFsm>>,
    retention_ms: i64,
}

impl SessionRegistry {
    pub fn new(retention_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            retention_ms,
        })
    }

    pub fn insert(&self, fsm: Arc<SessionFsm>) {
        self.sessions.insert(fsm.session_id.clone(), fsm);
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionFsm>> {
        self.sessions.get(session_id).map(|entry| entry.clone())
    }

    pub fn remove(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let mut active = Vec::new();
        let mut recent_terminal = Vec::new();

        for entry in self.sessions.iter() {
            let fsm = entry.value();
            let state = fsm.state();
            if state.is_terminal() {
                recent_terminal.push(TerminalSummary {
                    session_id: fsm.session_id.clone(),
                    state: state.as_str().to_string(),
                    history: fsm.history(),
                });
            } else {
                active.push(ActiveSummary {
                    session_id: fsm.session_id.clone(),
                    state: state.as_str().to_string(),
                    uptime_ms: fsm.uptime().as_millis(),
                });
            }
        }

        Diagnostics {
            active_count: active.len(),
            terminal_count: recent_terminal.len(),
            total: self.sessions.len(),
            active,
            recent_terminal,
        }
    }

    /// Removes terminal FSMs whose last transition predates `retention_ms`.
    /// Called periodically by [`SessionRegistry::spawn_sweeper`].
    pub fn sweep(&self) {
        let now = now_ms();
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter_map(|entry| {
                let fsm = entry.value();
                if !fsm.state().is_terminal() {
                    return None;
                }
                let last = fsm.history().last().map(|r| r.timestamp_ms).unwrap_or(0);
                if now - last > self.retention_ms {
                    Some(fsm.session_id.clone())
                } else {
                    None
                }
            })
            .collect();

        for session_id in stale {
            self.sessions.remove(&session_id);
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.sweep();
            }
        });
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[tokio::test]
    async fn diagnostics_splits_active_and_terminal() {
        let registry = SessionRegistry::new(DEFAULT_RETENTION_MS);
        let active_fsm = SessionFsm::new("active", "c1", "m1", 60_000);
        let terminal_fsm = SessionFsm::new("terminal", "c1", "m2", 60_000);
        terminal_fsm
            .transition(FsmState::Error, None, Value::Null)
            .unwrap();

        registry.insert(active_fsm);
        registry.insert(terminal_fsm);

        let diagnostics = registry.diagnostics();
        assert_eq!(diagnostics.active_count, 1);
        assert_eq!(diagnostics.terminal_count, 1);
        assert_eq!(diagnostics.total, 2);
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_terminal_sessions() {
        let registry = SessionRegistry::new(0);
        let fsm = SessionFsm::new("s1", "c1", "m1", 60_000);
        fsm.transition(FsmState::Completed, None, Value::Null).unwrap();
        registry.insert(fsm);

        registry.sweep();
        assert_eq!(registry.diagnostics().total, 0);
    }
}
