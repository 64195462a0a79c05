use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;

use chronicle_core::InvocationId;

use super::{Scheduler, SchedulerCallback, SchedulerError};

/// Data of an invocation created by `Runtime::schedule_command`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledCommand {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub command: String,
    #[serde(default)]
    pub payload: JsonValue,
    #[serde(default)]
    pub context: JsonValue,
}

/// Binds one callback to a [`Scheduler`] adapter for the lifetime of a runtime.
pub struct CommandScheduler {
    scheduler: Arc<dyn Scheduler>,
    callback: SchedulerCallback,
    running: AtomicBool,
}

impl fmt::Debug for CommandScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandScheduler")
            .field("running", &self.is_running())
            .finish()
    }
}

impl CommandScheduler {
    pub fn new(scheduler: Arc<dyn Scheduler>, callback: SchedulerCallback) -> Self {
        Self {
            scheduler,
            callback,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Subscribe the callback; a second call is a no-op.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.scheduler.subscribe(Arc::clone(&self.callback)).await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        info!("command scheduler started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.scheduler.unsubscribe(&self.callback).await?;
        info!("command scheduler stopped");
        Ok(())
    }

    pub async fn schedule(&self, execute_at: DateTime<Utc>, command: &ScheduledCommand) -> Result<InvocationId, SchedulerError> {
        let data = serde_json::to_value(command)?;
        self.scheduler.schedule(execute_at, data).await
    }
}
