//! Task management for async service lifecycle.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound on how long one task may take to stop.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Manages named async tasks sharing one cancellation hierarchy.
///
/// Every task receives a child of `global_token`, so cancelling the global
/// token stops everything while a single task can still be cancelled alone.
pub struct TaskManager {
    tasks: HashMap<String, TaskInfo>,
    pub global_token: CancellationToken,
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            global_token: CancellationToken::new(),
        }
    }

    /// Spawns and registers a task with the given name.
    pub async fn spawn_task<F, Fut>(&mut self, name: String, task_fn: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let task_token = self.global_token.child_token();
        let task_token_clone = task_token.clone();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            info!("Starting task: {task_name}");
            match task_fn(task_token_clone).await {
                Ok(()) => {
                    info!("Task '{task_name}' completed successfully");
                    Ok(())
                }
                Err(e) => {
                    error!("Task '{task_name}' failed: {e:#}");
                    Err(e)
                }
            }
        });

        if let Some(previous) = self.tasks.insert(
            name.clone(),
            TaskInfo {
                handle,
                cancel_token: task_token,
            },
        ) {
            warn!("Task '{name}' replaced a running task of the same name");
            previous.cancel_token.cancel();
        }

        info!("Task '{name}' spawned");
        Ok(())
    }

    /// Cancels one task and waits for it to finish.
    pub async fn cancel_task(&mut self, name: &str) -> Result<()> {
        let Some(task) = self.tasks.remove(name) else {
            anyhow::bail!("No task named '{name}'");
        };
        task.cancel_token.cancel();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, task.handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(anyhow::anyhow!("Task '{name}' panicked: {e}")),
            Err(_) => Err(anyhow::anyhow!("Task '{name}' did not stop in time")),
        }
    }

    /// Shuts down all registered tasks gracefully.
    ///
    /// Waits for all tasks to complete and returns the first error
    /// encountered, if any.
    pub async fn shutdown_all(&mut self) -> Result<()> {
        info!("Stopping all {} tasks", self.tasks.len());

        self.global_token.cancel();

        let mut first_error = None;
        let tasks: Vec<_> = self.tasks.drain().collect();

        for (name, info) in tasks {
            let error = match tokio::time::timeout(SHUTDOWN_TIMEOUT, info.handle).await {
                Ok(Ok(Ok(()))) => continue,
                Ok(Ok(Err(e))) => {
                    warn!("Task '{name}' failed during shutdown: {e}");
                    e
                }
                Ok(Err(e)) => {
                    let error = anyhow::anyhow!("Task '{name}' panicked: {e}");
                    error!("{error}");
                    error
                }
                Err(_) => {
                    let error = anyhow::anyhow!("Task '{name}' shutdown timeout exceeded");
                    error!("{error}");
                    error
                }
            };
            first_error.get_or_insert(error);
        }

        if let Some(error) = first_error {
            Err(error).context("One or more tasks failed during shutdown")
        } else {
            info!("All tasks stopped");
            Ok(())
        }
    }

    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.tasks
            .get(name)
            .is_some_and(|task| !task.handle.is_finished())
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

struct TaskInfo {
    handle: JoinHandle<Result<()>>,
    cancel_token: CancellationToken,
}
