//! Structured lifecycle for the agent's long-running tasks.
//!
//! Every long-running component implements [`Runner`] and is started through
//! the [`Registry`], which pairs it with a cancellation handle and a join
//! handle. Removing a task cancels it, waits for it, then calls its
//! [`Runner::close`] hook.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Cooperative cancellation token. Cloning shares the underlying signal.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been requested. Safe to call repeatedly;
    /// resolves immediately when shutdown already happened.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `duration`, returning early (with `true`) on shutdown.
    pub async fn sleep(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.wait() => true,
        }
    }
}

/// Trigger side of a [`Shutdown`] token.
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn new() -> (ShutdownHandle, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownHandle { tx }, Shutdown { rx })
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new().0
    }
}

/// A long-running task. `run` must return promptly once `shutdown` fires.
///
/// Runners owning external resources (sockets, registered inputs) override
/// [`Runner::close`], which the registry calls after the task has been
/// cancelled and awaited.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, shutdown: Shutdown) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct TaskEntry {
    name: String,
    runner: Arc<dyn Runner>,
    handle: Arc<ShutdownHandle>,
    join: JoinHandle<()>,
}

/// Registry of running tasks, keyed by small integer ids.
pub struct Registry {
    parent: Shutdown,
    tasks: Mutex<HashMap<u32, TaskEntry>>,
}

impl Registry {
    /// Create a registry. Every task started here also terminates when
    /// `parent` fires.
    pub fn new(parent: Shutdown) -> Registry {
        Registry {
            parent,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start `runner` as a new task and return its id.
    ///
    /// Panics when every id in `[1, u32::MAX]` is taken, which can only be
    /// reached by a task leak and is treated as fatal.
    pub fn add_task(&self, runner: Arc<dyn Runner>, name: &str) -> u32 {
        let mut tasks = self.tasks.lock().unwrap();

        let mut id: u32 = 1;
        while tasks.contains_key(&id) {
            id = id
                .checked_add(1)
                .unwrap_or_else(|| panic!("too many tasks in the registry, no free slot"));
        }

        let (handle, child) = ShutdownHandle::new();
        let handle = Arc::new(handle);
        let join = tokio::spawn({
            let parent = self.parent.clone();
            let handle = Arc::clone(&handle);
            let runner = Arc::clone(&runner);
            let name = name.to_string();
            async move {
                let run = runner.run(child);
                tokio::pin!(run);
                let result = tokio::select! {
                    res = &mut run => res,
                    _ = parent.wait() => {
                        handle.shutdown();
                        (&mut run).await
                    }
                };
                if let Err(err) = result {
                    tracing::error!(task = %name, error = %err, "task terminated with error");
                }
            }
        });

        tasks.insert(
            id,
            TaskEntry {
                name: name.to_string(),
                runner,
                handle,
                join,
            },
        );
        id
    }

    /// Cancel the task, wait for it to finish, then call its close hook.
    pub async fn remove_task(&self, id: u32) {
        let entry = self.tasks.lock().unwrap().remove(&id);
        let Some(entry) = entry else {
            tracing::debug!(id, "remove_task called with unknown id");
            return;
        };
        entry.handle.shutdown();
        if let Err(err) = entry.join.await {
            tracing::warn!(task = %entry.name, error = %err, "task panicked");
        }
        if let Err(err) = entry.runner.close().await {
            tracing::debug!(task = %entry.name, error = %err, "failed to close task");
        }
    }

    /// Whether the task's future is still running.
    pub fn is_running(&self, id: u32) -> bool {
        let tasks = self.tasks.lock().unwrap();
        tasks.get(&id).is_some_and(|t| !t.join.is_finished())
    }

    /// Cancel every task in parallel, then wait for and close each.
    pub async fn close(&self) {
        let entries: Vec<TaskEntry> = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.handle.shutdown();
        }
        for entry in entries {
            if let Err(err) = entry.join.await {
                tracing::warn!(task = %entry.name, error = %err, "task panicked");
            }
            if let Err(err) = entry.runner.close().await {
                tracing::debug!(task = %entry.name, error = %err, "failed to close task");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    struct Sleeper {
        closed: AtomicU32,
        cancelled_before_close: AtomicBool,
        done: AtomicBool,
    }

    impl Sleeper {
        fn new() -> Arc<Sleeper> {
            Arc::new(Sleeper {
                closed: AtomicU32::new(0),
                cancelled_before_close: AtomicBool::new(false),
                done: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Runner for Sleeper {
        async fn run(&self, shutdown: Shutdown) -> Result<()> {
            shutdown.wait().await;
            self.done.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.cancelled_before_close
                .store(self.done.load(Ordering::SeqCst), Ordering::SeqCst);
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn remove_task_cancels_then_closes_once() {
        let (_handle, parent) = ShutdownHandle::new();
        let registry = Registry::new(parent);
        let runner = Sleeper::new();

        let id = registry.add_task(runner.clone(), "sleeper");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.is_running(id));

        registry.remove_task(id).await;
        assert_eq!(runner.closed.load(Ordering::SeqCst), 1);
        assert!(runner.cancelled_before_close.load(Ordering::SeqCst));
        assert!(!registry.is_running(id));
    }

    #[tokio::test]
    async fn parent_shutdown_stops_tasks() {
        let (handle, parent) = ShutdownHandle::new();
        let registry = Registry::new(parent);
        let runner = Sleeper::new();
        registry.add_task(runner.clone(), "sleeper");

        handle.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(runner.done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn close_removes_every_task() {
        let (_handle, parent) = ShutdownHandle::new();
        let registry = Registry::new(parent);
        let a = Sleeper::new();
        let b = Sleeper::new();
        registry.add_task(a.clone(), "a");
        registry.add_task(b.clone(), "b");

        registry.close().await;
        assert_eq!(a.closed.load(Ordering::SeqCst), 1);
        assert_eq!(b.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ids_are_reused_after_removal() {
        let (_handle, parent) = ShutdownHandle::new();
        let registry = Registry::new(parent);
        let id1 = registry.add_task(Sleeper::new(), "a");
        assert_eq!(id1, 1);
        registry.remove_task(id1).await;
        let id2 = registry.add_task(Sleeper::new(), "b");
        assert_eq!(id2, 1);
    }
}
