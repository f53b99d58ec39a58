use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, PartialEq)]
pub enum LifecycleState {
    Init,
    Starting,
    Ready,
    Shutdown,
}

/// Hooks for long-lived components. Components keep their own interior
/// locking, so the manager only ever holds shared references.
#[async_trait::async_trait]
pub trait LifecycleComponent {
    async fn on_init(&self) -> Result<()> {
        Ok(())
    }
    async fn on_start(&self) -> Result<()> {
        Ok(())
    }
    async fn on_shutdown(&self) -> Result<()> {
        Ok(())
    }
}

pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<Arc<dyn LifecycleComponent + Send + Sync>>,
    pub scheduler: JobScheduler,
}

impl LifecycleManager {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            state: LifecycleState::Init,
            components: Vec::new(),
            scheduler,
        })
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    pub fn attach(&mut self, component: Arc<dyn LifecycleComponent + Send + Sync>) {
        self.components.push(component);
    }

    /// Register a job that runs `task` every `every`. A run that is still in
    /// progress does not block the next one; tasks must tolerate overlap.
    pub async fn every<F, Fut>(&self, name: &str, every: Duration, task: F) -> Result<Uuid>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = Arc::new(task);
        let job = Job::new_repeated_async(every, move |_uuid, _lock| {
            let task = task.clone();
            Box::pin(async move {
                task().await;
            })
        })?;
        match self.scheduler.add(job).await {
            Ok(id) => {
                info!(job = name, every_secs = every.as_secs(), "Registered periodic job");
                Ok(id)
            }
            Err(e) => {
                error!(job = name, "Failed to register periodic job: {}", e);
                Err(e.into())
            }
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Init");
        self.state = LifecycleState::Init;
        for comp in &self.components {
            comp.on_init().await?;
        }

        info!("Lifecycle Phase: Starting");
        self.state = LifecycleState::Starting;
        for comp in &self.components {
            comp.on_start().await?;
        }

        info!("Lifecycle Phase: Ready (Starting Scheduler)");
        self.scheduler.start().await?;
        self.state = LifecycleState::Ready;

        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Shutdown");
        self.state = LifecycleState::Shutdown;

        if let Err(e) = self.scheduler.shutdown().await {
            warn!("Scheduler shutdown error: {}", e);
        }
        for comp in self.components.iter().rev() {
            if let Err(e) = comp.on_shutdown().await {
                warn!("Component shutdown error: {}", e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        inits: AtomicUsize,
        starts: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl LifecycleComponent for Counting {
        async fn on_init(&self) -> Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn on_start(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn on_shutdown(&self) -> Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn components_see_every_phase_once() {
        let component = Arc::new(Counting::default());
        let mut lifecycle = LifecycleManager::new().await.unwrap();
        lifecycle.attach(component.clone());

        lifecycle.start().await.unwrap();
        assert_eq!(*lifecycle.state(), LifecycleState::Ready);
        lifecycle.shutdown().await.unwrap();
        assert_eq!(*lifecycle.state(), LifecycleState::Shutdown);

        assert_eq!(component.inits.load(Ordering::SeqCst), 1);
        assert_eq!(component.starts.load(Ordering::SeqCst), 1);
        assert_eq!(component.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn periodic_job_runs_after_start() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut lifecycle = LifecycleManager::new().await.unwrap();
        let counter = runs.clone();
        lifecycle
            .every("count", Duration::from_secs(1), move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await
            .unwrap();

        lifecycle.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        lifecycle.shutdown().await.unwrap();
        assert!(runs.load(Ordering::SeqCst) >= 1);
    }
}
