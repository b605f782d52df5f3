//! Periodic guest clock correction: a VM's clock drifts while suspended or
//! under host scheduling pressure, so every 30s we push the host's wall
//! clock to the agent (§4.7's `setTime`, consumed here).

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;

use crate::agent::AgentClient;

const SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Owns the background task; dropping without calling [`stop`](Self::stop)
/// aborts it anyway, but `stop` is preferred so callers can await the
/// final tick finishing.
pub struct TimeSyncer {
    task: JoinHandle<()>,
}

impl TimeSyncer {
    pub fn start(agent: Arc<dyn AgentClient>) -> Self {
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SYNC_INTERVAL);
            loop {
                interval.tick().await;
                let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::debug!("system clock before epoch, skipping time sync: {e}");
                        continue;
                    }
                };
                if let Err(e) = agent
                    .set_time(now.as_secs() as i64, now.subsec_micros() as i64)
                    .await
                {
                    tracing::debug!("time sync failed: {e}");
                }
            }
        });
        Self { task }
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for TimeSyncer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
