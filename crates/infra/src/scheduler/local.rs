use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, warn};

use chronicle_core::InvocationId;

use super::storage::{Invocation, InvocationStorage};
use super::{Scheduler, SchedulerCallback, SchedulerError};

/// Longest single sleep of the driver; longer delays are slept in chunks.
pub const MAX_TIMEOUT: Duration = Duration::from_millis(2_147_483_647);

/// What happens to an invocation when a callback fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    #[default]
    Never,
    Always,
    /// Give up once the invocation has been retried this many times.
    Max(u32),
}

impl RetryPolicy {
    fn should_retry(self, retry_count: u32) -> bool {
        match self {
            RetryPolicy::Never => false,
            RetryPolicy::Always => true,
            RetryPolicy::Max(max) => retry_count < max,
        }
    }
}

#[derive(Clone, Default)]
pub struct LocalSchedulerConfig {
    pub retry: RetryPolicy,
    pub storage: Option<Arc<dyn InvocationStorage>>,
}

impl fmt::Debug for LocalSchedulerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSchedulerConfig")
            .field("retry", &self.retry)
            .field("storage", &self.storage.is_some())
            .finish()
    }
}

impl LocalSchedulerConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn InvocationStorage>) -> Self {
        self.storage = Some(storage);
        self
    }
}

#[derive(Default)]
struct State {
    callbacks: Vec<SchedulerCallback>,
    /// Sorted by `execute_at`; equal times keep insertion order.
    queue: Vec<Invocation>,
    driver_running: bool,
    loaded: bool,
}

struct Inner {
    config: LocalSchedulerConfig,
    state: Mutex<State>,
    wake: Notify,
}

/// In-process scheduler driven by a single tokio task.
///
/// The driver sleeps until the earliest pending invocation (re-armed whenever an
/// earlier one is scheduled), delivers every due invocation in order and fans each
/// one out to all callbacks concurrently. It only runs while at least one callback
/// is subscribed.
#[derive(Clone)]
pub struct LocalScheduler {
    inner: Arc<Inner>,
}

impl fmt::Debug for LocalScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalScheduler")
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Default for LocalScheduler {
    fn default() -> Self {
        Self::new(LocalSchedulerConfig::default())
    }
}

impl LocalScheduler {
    pub fn new(config: LocalSchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                wake: Notify::new(),
            }),
        }
    }

    /// Pending invocations in delivery order.
    pub async fn pending(&self) -> Vec<Invocation> {
        self.inner.state.lock().await.queue.clone()
    }
}

fn insert_sorted(queue: &mut Vec<Invocation>, invocation: Invocation) {
    let at = queue.partition_point(|e| e.execute_at <= invocation.execute_at);
    queue.insert(at, invocation);
}

#[async_trait]
impl Scheduler for LocalScheduler {
    async fn subscribe(&self, callback: SchedulerCallback) -> Result<(), SchedulerError> {
        let mut state = self.inner.state.lock().await;

        if !state.loaded {
            if let Some(storage) = &self.inner.config.storage {
                for invocation in storage.load().await? {
                    if !state.queue.iter().any(|e| e.id == invocation.id) {
                        insert_sorted(&mut state.queue, invocation);
                    }
                }
            }
            state.loaded = true;
        }

        if !state.callbacks.iter().any(|c| Arc::ptr_eq(c, &callback)) {
            state.callbacks.push(callback);
        }
        if state.driver_running {
            self.inner.wake.notify_one();
        } else {
            state.driver_running = true;
            tokio::spawn(drive(Arc::clone(&self.inner)));
        }
        Ok(())
    }

    async fn unsubscribe(&self, callback: &SchedulerCallback) -> Result<(), SchedulerError> {
        let mut state = self.inner.state.lock().await;
        state.callbacks.retain(|c| !Arc::ptr_eq(c, callback));
        self.inner.wake.notify_one();
        Ok(())
    }

    async fn schedule(&self, execute_at: DateTime<Utc>, data: JsonValue) -> Result<InvocationId, SchedulerError> {
        let invocation = Invocation::new(execute_at, data);
        let id = invocation.id;
        if let Some(storage) = &self.inner.config.storage {
            storage.save(&invocation).await?;
        }

        insert_sorted(&mut self.inner.state.lock().await.queue, invocation);
        self.inner.wake.notify_one();
        debug!(invocation = %id, %execute_at, "invocation scheduled");
        Ok(id)
    }
}

async fn drive(inner: Arc<Inner>) {
    debug!("scheduler driver started");
    loop {
        let delay = {
            let mut state = inner.state.lock().await;
            if state.callbacks.is_empty() {
                state.driver_running = false;
                debug!("scheduler driver stopped, no subscribers");
                return;
            }
            state
                .queue
                .first()
                .map(|first| (first.execute_at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
        };

        match delay {
            Some(delay) if delay.is_zero() => {
                if fire(&inner).await {
                    tokio::task::yield_now().await;
                }
            }
            Some(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay.min(MAX_TIMEOUT)) => {}
                    _ = inner.wake.notified() => {}
                }
            }
            None => inner.wake.notified().await,
        }
    }
}

/// Delivers every due invocation; returns whether any were queued again for retry.
async fn fire(inner: &Inner) -> bool {
    let (due, callbacks) = {
        let mut state = inner.state.lock().await;
        // Left queued for the next subscriber.
        if state.callbacks.is_empty() {
            return false;
        }
        let now = Utc::now();
        let split = state.queue.partition_point(|e| e.execute_at <= now);
        let due: Vec<Invocation> = state.queue.drain(..split).collect();
        (due, state.callbacks.clone())
    };

    let mut retries = Vec::new();
    for invocation in due {
        let deliveries = callbacks
            .iter()
            .map(|callback| callback(invocation.execute_at, invocation.data.clone()));
        let failures: Vec<anyhow::Error> = futures::future::join_all(deliveries)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        if failures.is_empty() {
            forget(inner, &invocation).await;
            continue;
        }

        for failure in &failures {
            warn!(invocation = %invocation.id, retry_count = invocation.retry_count, error = %failure, "scheduled invocation failed");
        }
        if inner.config.retry.should_retry(invocation.retry_count) {
            let retry = Invocation {
                retry_count: invocation.retry_count + 1,
                ..invocation
            };
            if let Some(storage) = &inner.config.storage {
                if let Err(e) = storage.save(&retry).await {
                    warn!(invocation = %retry.id, error = %e, "failed to persist retry");
                }
            }
            retries.push(retry);
        } else {
            error!(invocation = %invocation.id, retry_count = invocation.retry_count, "giving up on scheduled invocation");
            forget(inner, &invocation).await;
        }
    }

    if retries.is_empty() {
        return false;
    }
    inner.state.lock().await.queue.splice(0..0, retries);
    true
}

async fn forget(inner: &Inner, invocation: &Invocation) {
    if let Some(storage) = &inner.config.storage {
        if let Err(e) = storage.delete(invocation.id).await {
            warn!(invocation = %invocation.id, error = %e, "failed to delete delivered invocation");
        }
    }
}
