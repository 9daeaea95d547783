use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use crate::error::{Error, Result};
use crate::mcp::stdio::{StdioSession, StdioSessionConfig};
use crate::mcp::{Session, ToolDescriptor};

/// Fixed-size pool of prewarmed stdio sessions. A request is served from an
/// idle session; if none is idle and the pool is at capacity, the request
/// queues FIFO on `slots` (a semaphore, which grants permits in acquire
/// order) up to `queue_capacity` waiters, beyond which it is rejected with
/// `GatewayQueueOverflow`. A session that raises `ProtocolError` is dropped;
/// no replacement is spawned proactively — only on next demand.
pub struct StdioPool {
    spawn_config: StdioSessionConfig,
    idle: Mutex<VecDeque<Arc<StdioSession>>>,
    slots: Arc<Semaphore>,
    queue_capacity: Arc<Semaphore>,
    pool_size: usize,
}

impl StdioPool {
    pub fn new(spawn_config: StdioSessionConfig, pool_size: usize, queue_capacity: usize) -> Self {
        Self {
            spawn_config,
            idle: Mutex::new(VecDeque::new()),
            slots: Arc::new(Semaphore::new(pool_size)),
            queue_capacity: Arc::new(Semaphore::new(queue_capacity)),
            pool_size,
        }
    }

    async fn checkout(&self) -> Result<(OwnedSemaphorePermit, Arc<StdioSession>)> {
        if self.pool_size == 0 {
            return Err(Error::GatewayQueueOverflow(
                "stdio pool size is 0".to_string(),
            ));
        }

        // Fast path: a permit is free, skip the waiting-queue accounting.
        let permit = match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let _queue_guard = Arc::clone(&self.queue_capacity)
                    .try_acquire_owned()
                    .map_err(|_| {
                        Error::GatewayQueueOverflow("stdio pool queue is full".to_string())
                    })?;
                // FIFO: tokio::sync::Semaphore grants queued acquires in order.
                Arc::clone(&self.slots)
                    .acquire_owned()
                    .await
                    .expect("semaphore not closed")
            }
        };

        let mut idle = self.idle.lock().await;
        if let Some(session) = idle.pop_front() {
            return Ok((permit, session));
        }
        drop(idle);

        let session = Arc::new(StdioSession::open(self.spawn_config.clone()).await?);
        Ok((permit, session))
    }

    async fn checkin(&self, session: Arc<StdioSession>, discard: bool) {
        if discard {
            let _ = session.close().await;
            return;
        }
        self.idle.lock().await.push_back(session);
    }

    pub async fn call_tool(&self, tool_name: &str, arguments: Option<Value>) -> Result<Value> {
        let (_permit, session) = self.checkout().await?;
        let result = session.call_tool(tool_name, arguments).await;
        let discard = matches!(result, Err(Error::ProtocolError(_)) | Err(Error::SessionDropped(_)));
        if discard {
            warn!("stdio worker raised a protocol error, discarding");
        }
        self.checkin(session, discard).await;
        result
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let (_permit, session) = self.checkout().await?;
        let result = session.list_tools().await;
        let discard = matches!(result, Err(Error::ProtocolError(_)) | Err(Error::SessionDropped(_)));
        self.checkin(session, discard).await;
        result
    }

    pub async fn drain(&self) {
        let mut idle = self.idle.lock().await;
        while let Some(session) = idle.pop_front() {
            let _ = session.close().await;
        }
    }

    /// Configured capacity, for the `/servers` runtime-state contract.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Instances not currently checked out. A stdio session has no
    /// standalone health flag like `HttpPool`'s instances — a broken one is
    /// dropped outright and replaced lazily on next checkout — so the
    /// available-permit count is the closest analogue of "healthy and
    /// ready" the pool can report.
    pub fn healthy_count(&self) -> usize {
        self.slots.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> StdioSessionConfig {
        StdioSessionConfig {
            command: "/nonexistent/mcp-server-binary".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn pool_size_zero_overflows_immediately() {
        let pool = StdioPool::new(unreachable_config(), 0, 10);
        let result = pool.call_tool("anything", None).await;
        assert!(matches!(result, Err(Error::GatewayQueueOverflow(_))));
    }

    #[tokio::test]
    async fn queue_overflow_when_pool_busy_and_queue_full() {
        let pool = Arc::new(StdioPool::new(unreachable_config(), 1, 0));
        // Hold the single slot open in a background task.
        let held = Arc::clone(&pool);
        let handle = tokio::spawn(async move {
            let _ = held.slots.clone().acquire_owned().await;
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let result = pool.call_tool("anything", None).await;
        assert!(matches!(result, Err(Error::GatewayQueueOverflow(_))));
        handle.await.unwrap();
    }
}
