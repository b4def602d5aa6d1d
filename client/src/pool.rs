//! Named worker pools
//!
//! Forwarding, liveness marking, and outbound sends are scheduled onto
//! dedicated pools so a slow origin call can never stall the socket's
//! event loop. Each pool is a semaphore-capped slice of the tokio
//! runtime; what happens on exhaustion (queue vs reject) comes from
//! configuration.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::warn;

use crate::config::{OverflowPolicy, PoolConfig, PoolsConfig};

/// A named, bounded task pool.
#[derive(Clone)]
pub struct WorkerPool {
    name: &'static str,
    permits: Arc<Semaphore>,
    policy: OverflowPolicy,
    tracker: TaskTracker,
}

impl WorkerPool {
    pub fn new(name: &'static str, config: &PoolConfig) -> Self {
        Self {
            name,
            permits: Arc::new(Semaphore::new(config.size)),
            policy: config.overflow,
            tracker: TaskTracker::new(),
        }
    }

    /// Schedule a task onto the pool. Returns false if the pool is
    /// exhausted and configured to reject.
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.policy {
            OverflowPolicy::Queue => {
                let permits = self.permits.clone();
                self.tracker.spawn(async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        // Semaphore closed during shutdown
                        return;
                    };
                    task.await;
                });
                true
            }
            OverflowPolicy::Reject => match self.permits.clone().try_acquire_owned() {
                Ok(permit) => {
                    self.tracker.spawn(async move {
                        let _permit = permit;
                        task.await;
                    });
                    true
                }
                Err(_) => {
                    warn!(pool = self.name, "pool exhausted, dropping task");
                    false
                }
            },
        }
    }

    /// Stop accepting tasks and wait for in-flight ones to finish.
    pub async fn close_and_wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// The pools the client runs on, constructed once at startup and passed
/// by reference into the forwarder and dispatcher.
pub struct Pools {
    pub registration: WorkerPool,
    pub liveness: WorkerPool,
    pub request: WorkerPool,
}

impl Pools {
    pub fn from_config(config: &PoolsConfig) -> Self {
        Self {
            registration: WorkerPool::new("registration", &config.registration),
            liveness: WorkerPool::new("liveness", &config.liveness),
            request: WorkerPool::new("request-handling", &config.request),
        }
    }

    pub async fn shutdown(&self) {
        self.registration.close_and_wait().await;
        self.liveness.close_and_wait().await;
        self.request.close_and_wait().await;
    }
}
