//! A single running guest process: the handle `kill`/`resize`/`wait`
//! delegate to once a container has reached `started` (§4.3/§5).

use std::sync::Arc;
use std::time::Duration;

use crate::agent::AgentClient;
use crate::error::Result;
use crate::stdio::StdioPlumbing;

pub struct LinuxProcess {
    pub id: String,
    pub pid: i32,
    agent: Arc<dyn AgentClient>,
    stdio: Option<StdioPlumbing>,
}

impl LinuxProcess {
    pub fn new(
        id: String,
        pid: i32,
        agent: Arc<dyn AgentClient>,
        stdio: Option<StdioPlumbing>,
    ) -> Self {
        Self {
            id,
            pid,
            agent,
            stdio,
        }
    }

    /// A cloned handle to this process's agent connection, for callers
    /// (like [`crate::container::state::Container`]) that need to issue
    /// further RPCs keyed on this process's id without holding onto the
    /// whole `LinuxProcess`.
    pub fn agent_handle(&self) -> Arc<dyn AgentClient> {
        self.agent.clone()
    }

    pub async fn kill(&self, signal: i32) -> Result<()> {
        self.agent.signal_process(&self.id, signal).await
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.agent.resize_process(&self.id, cols, rows).await
    }

    pub async fn wait(&self, timeout: Option<Duration>) -> Result<i32> {
        self.agent.wait_process(&self.id, timeout).await
    }

    /// Drains stdio, then tells the agent to drop the process record.
    pub async fn delete(mut self) -> Result<()> {
        if let Some(stdio) = self.stdio.take() {
            stdio.delete().await;
        }
        self.agent.delete_process(&self.id).await
    }
}
