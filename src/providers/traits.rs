use anyhow::Result;
use async_trait::async_trait;

use crate::task_manager::TaskManager;

/// Base trait for providers that create components asynchronously.
///
/// # Example
///
/// ```no_run
/// use fanwarden::providers::traits::AsyncProvider;
///
/// struct DbPathProvider;
///
/// #[async_trait::async_trait]
/// impl AsyncProvider<String> for DbPathProvider {
///     async fn provide(&self) -> anyhow::Result<String> {
///         Ok("/var/lib/fanwarden/fanwarden.json".to_string())
///     }
/// }
/// ```
#[async_trait]
pub trait AsyncProvider<T> {
    async fn provide(&self) -> Result<T>;
}

/// Trait for services that are started through the TaskManager.
///
/// # Example
///
/// ```no_run
/// use fanwarden::providers::traits::ServiceProvider;
/// use fanwarden::task_manager::TaskManager;
/// use anyhow::Result;
///
/// struct HeartbeatService;
///
/// #[async_trait::async_trait]
/// impl ServiceProvider for HeartbeatService {
///     async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
///         task_manager.spawn_task("heartbeat".to_string(), |token| async move {
///             token.cancelled().await;
///             Ok(())
///         }).await
///     }
///
///     fn name(&self) -> &'static str { "HeartbeatService" }
/// }
/// ```
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    /// Starts the service in TaskManager.
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()>;

    /// Returns service name for logging and management.
    fn name(&self) -> &'static str;

    /// Returns startup priority (higher numbers start first).
    fn priority(&self) -> i32 {
        0
    }

    /// Indicates if service is critical for system operation.
    fn is_critical(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use pretty_assertions::assert_eq;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AsyncProvider<usize> for CountingProvider {
        async fn provide(&self) -> Result<usize> {
            Ok(self.calls.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    struct FailingService;

    #[async_trait]
    impl ServiceProvider for FailingService {
        async fn start(&self, _task_manager: &mut TaskManager) -> Result<()> {
            Err(anyhow!("hardware missing"))
        }

        fn name(&self) -> &'static str {
            "FailingService"
        }
    }

    struct SpawningService {
        started: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ServiceProvider for SpawningService {
        async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
            let started = self.started.clone();
            task_manager
                .spawn_task("spawning".into(), move |token| async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    token.cancelled().await;
                    Ok(())
                })
                .await
        }

        fn name(&self) -> &'static str {
            "SpawningService"
        }

        fn priority(&self) -> i32 {
            7
        }

        fn is_critical(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn provider_builds_fresh_value_per_call() {
        let provider = CountingProvider {
            calls: AtomicUsize::new(0),
        };
        assert_eq!(provider.provide().await.unwrap(), 1);
        assert_eq!(provider.provide().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn service_defaults_are_low_priority_and_optional() {
        let service = FailingService;
        let mut manager = TaskManager::new();

        assert_eq!(service.priority(), 0);
        assert!(!service.is_critical());
        assert!(service.start(&mut manager).await.is_err());
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn service_spawns_into_task_manager() {
        let started = Arc::new(AtomicUsize::new(0));
        let service = SpawningService {
            started: started.clone(),
        };
        let mut manager = TaskManager::new();

        service.start(&mut manager).await.unwrap();
        tokio::task::yield_now().await;
        manager.shutdown_all().await.unwrap();

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(service.priority(), 7);
        assert!(service.is_critical());
    }
}
