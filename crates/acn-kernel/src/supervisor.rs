//! Node task group: background tasks plus the shared shutdown signal.
//!
//! Every long-running loop a node starts (connection watchers, accept loops,
//! delegate pair workers) is spawned through its [`Supervisor`], which races
//! the task against the shutdown signal and can wait for all of them to exit.

use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Receive side of a node's shutdown signal.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolve once shutdown has been requested.
    pub async fn cancelled(&mut self) {
        // A dropped sender means the node is gone.
        let _ = self.rx.wait_for(|closing| *closing).await;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Shutdown signal manager and task group.
pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
    spawned: AtomicU64,
    /// Live task count per task name.
    running: DashMap<&'static str, u64>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_tx: tx,
            tasks: Mutex::new(JoinSet::new()),
            spawned: AtomicU64::new(0),
            running: DashMap::new(),
        }
    }

    /// Get a signal that resolves on shutdown.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.shutdown_tx.subscribe(),
        }
    }

    /// Trigger a graceful shutdown.
    pub fn shutdown(&self) {
        if !self.shutdown_tx.send_replace(true) {
            info!("Supervisor: initiating graceful shutdown");
        }
    }

    /// Check if shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Spawn a background task that is dropped when shutdown is requested.
    pub fn spawn<F>(self: &std::sync::Arc<Self>, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutting_down() {
            debug!(task = name, "Supervisor: refusing to spawn during shutdown");
            return;
        }
        let mut signal = self.subscribe();
        let supervisor = std::sync::Arc::clone(self);
        self.spawned.fetch_add(1, Ordering::Relaxed);
        *self.running.entry(name).or_insert(0) += 1;

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        reap(&mut tasks);
        tasks.spawn(async move {
            tokio::select! {
                _ = fut => {}
                _ = signal.cancelled() => {}
            }
            if let Some(mut count) = supervisor.running.get_mut(name) {
                *count = count.saturating_sub(1);
            }
        });
    }

    /// Wait up to `grace` for spawned tasks to finish, aborting the rest.
    pub async fn join(&self, grace: Duration) {
        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                "Supervisor: tasks did not stop within grace period, aborting"
            );
            tasks.abort_all();
        }
    }

    /// Tasks still held by the group, after dropping the finished ones.
    pub fn tracked_tasks(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        reap(&mut tasks);
        tasks.len()
    }

    /// Number of live tasks with the given name.
    pub fn running(&self, name: &'static str) -> u64 {
        self.running.get(name).map(|c| *c).unwrap_or(0)
    }

    /// Get a health summary.
    pub fn health(&self) -> SupervisorHealth {
        SupervisorHealth {
            is_shutting_down: self.is_shutting_down(),
            spawned_tasks: self.spawned.load(Ordering::Relaxed),
            running_tasks: self.running.iter().map(|e| *e.value()).sum(),
        }
    }
}

/// Collect finished tasks so the set only holds live ones.
fn reap(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result {
            if e.is_panic() {
                warn!("Supervisor: task panicked: {}", e);
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Health report from the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorHealth {
    pub is_shutting_down: bool,
    pub spawned_tasks: u64,
    pub running_tasks: u64,
}
