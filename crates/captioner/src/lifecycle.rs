use std::time::Duration;
use log::{info, warn};
use crate::worker::{InferenceWorker, WorkerError, WorkerFactory, WorkerResult};

/// When the driver should replace the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadPolicy {
    /// Reload after every K-th timeout
    pub every_timeouts: u32,
    /// Reload after every N successes since the last load
    pub every_successes: u32,
}

impl ReloadPolicy {
    pub fn after_timeout(&self, timeouts: u32) -> bool {
        self.every_timeouts > 0 && timeouts > 0 && timeouts % self.every_timeouts == 0
    }

    pub fn after_success(&self, successes_since_load: u32) -> bool {
        self.every_successes > 0 && successes_since_load > 0 && successes_since_load % self.every_successes == 0
    }
}

impl Default for ReloadPolicy {
    fn default() -> Self {
        Self { every_timeouts: 3, every_successes: 300 }
    }
}

/// Owner of the single live worker handle
pub struct WorkerLifecycle {
    factory: Box<dyn WorkerFactory>,
    device: String,
    handle: Option<Box<dyn InferenceWorker>>,
    reload_pause: Duration,
}

impl WorkerLifecycle {
    pub fn new(factory: Box<dyn WorkerFactory>, device: impl Into<String>, reload_pause: Duration) -> Self {
        Self {
            factory,
            device: device.into(),
            handle: None,
            reload_pause,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.handle.is_some()
    }

    /// Construct a worker. Any existing handle is fully released first.
    pub async fn load(&mut self) -> WorkerResult<()> {
        if self.handle.is_some() {
            self.unload().await;
        }
        let worker = self.factory.load(&self.device).await?;
        self.handle = Some(worker);
        Ok(())
    }

    /// Release the worker: reclamation pass, then shutdown. Errors are logged, not returned.
    pub async fn unload(&mut self) {
        let Some(mut worker) = self.handle.take() else {
            return;
        };
        if let Err(e) = worker.reclaim().await {
            warn!("Reclamation before unload failed: {}", e);
        }
        if let Err(e) = worker.shutdown().await {
            warn!("Worker shutdown failed: {}", e);
        }
    }

    /// Replace the worker; the old one is gone before the new one is constructed
    pub async fn reload(&mut self, why: &str) -> WorkerResult<()> {
        info!("🔄 Reloading worker ({})", why);
        self.unload().await;
        if !self.reload_pause.is_zero() {
            tokio::time::sleep(self.reload_pause).await;
        }
        self.load().await
    }

    pub fn worker(&mut self) -> WorkerResult<&mut dyn InferenceWorker> {
        match self.handle.as_deref_mut() {
            Some(worker) => Ok(worker),
            None => Err(WorkerError::NotLoaded),
        }
    }

    /// Whether the loaded worker can still serve requests
    pub fn is_healthy(&mut self) -> bool {
        self.handle.as_deref_mut().map_or(false, |w| w.is_alive())
    }

    /// Non-reload reclamation pass on the live worker
    pub async fn reclaim(&mut self) {
        if let Some(worker) = self.handle.as_deref_mut() {
            if let Err(e) = worker.reclaim().await {
                warn!("Periodic reclamation failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use crate::testing::ScriptedFactory;

    #[test]
    fn timeout_reloads_only_at_multiples() {
        let policy = ReloadPolicy { every_timeouts: 3, every_successes: 300 };
        let reloads: Vec<u32> = (0..=9).filter(|t| policy.after_timeout(*t)).collect();
        assert_eq!(reloads, vec![3, 6, 9]);
        assert!(!policy.after_success(0));
        assert!(!policy.after_success(299));
        assert!(policy.after_success(300));
    }

    #[tokio::test]
    async fn reload_releases_old_worker_before_loading() {
        let factory = ScriptedFactory::new();
        let stats = factory.stats();
        let mut lifecycle = WorkerLifecycle::new(Box::new(factory), "cuda", Duration::ZERO);

        assert!(matches!(lifecycle.worker(), Err(WorkerError::NotLoaded)));
        lifecycle.load().await.unwrap();
        assert_eq!(stats.live.load(Ordering::SeqCst), 1);

        lifecycle.reload("test").await.unwrap();
        assert_eq!(stats.loads.load(Ordering::SeqCst), 2);
        assert_eq!(stats.shutdowns.load(Ordering::SeqCst), 1);
        // never two resident at once
        assert_eq!(stats.max_live.load(Ordering::SeqCst), 1);

        lifecycle.unload().await;
        assert!(!lifecycle.is_loaded());
        assert_eq!(stats.live.load(Ordering::SeqCst), 0);
        assert!(stats.reclaims.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn failed_load_leaves_nothing_loaded() {
        let factory = ScriptedFactory::new().failing_loads();
        let mut lifecycle = WorkerLifecycle::new(Box::new(factory), "cuda", Duration::ZERO);
        assert!(lifecycle.load().await.is_err());
        assert!(!lifecycle.is_loaded());
        assert!(!lifecycle.is_healthy());
    }
}
