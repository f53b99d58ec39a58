use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::context::{AgentKey, ContextBuilder, ExecutionContext};
use crate::config::CacheConfig;
use crate::core::error::RuntimeError;
use crate::core::lifecycle::LifecycleComponent;

type BuildResult = Result<Arc<ExecutionContext>, RuntimeError>;

enum Slot {
    /// A build task is running; waiters subscribe to its outcome.
    Building {
        generation: u64,
        outcome: watch::Receiver<Option<BuildResult>>,
    },
    Ready(Arc<ExecutionContext>),
}

/// Keeps at most one execution context per (user, agent), building it on the
/// first acquire and dropping it after it sits idle.
///
/// All coordination is per key: a slow build for one agent never blocks
/// acquires for another.
pub struct ExecutorCache {
    entries: Arc<DashMap<AgentKey, Slot>>,
    builder: Arc<dyn ContextBuilder>,
    config: CacheConfig,
    next_generation: AtomicU64,
}

impl ExecutorCache {
    pub fn new(builder: Arc<dyn ContextBuilder>, config: CacheConfig) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            builder,
            config,
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Return the cached context or build it. Concurrent first-time callers
    /// share one build and receive the same instance.
    pub async fn acquire(
        &self,
        user_id: &str,
        agent_name: &str,
    ) -> Result<Arc<ExecutionContext>, RuntimeError> {
        let key = AgentKey::new(user_id, agent_name);

        let mut outcome = match self.entries.entry(key.clone()) {
            Entry::Occupied(occupied) => match occupied.get() {
                Slot::Ready(ctx) => {
                    ctx.touch(Utc::now());
                    return Ok(ctx.clone());
                }
                Slot::Building { outcome, .. } => outcome.clone(),
            },
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(None);
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                vacant.insert(Slot::Building {
                    generation,
                    outcome: rx.clone(),
                });
                self.spawn_build(key.clone(), generation, tx);
                rx
            }
        };

        let result = match tokio::time::timeout(
            self.config.acquire_timeout(),
            outcome.wait_for(|value| value.is_some()),
        )
        .await
        {
            Err(_) => {
                warn!(agent = %key, "Timed out waiting for execution context");
                return Err(RuntimeError::ConcurrencyTimeout {
                    what: format!("agent '{}' to become ready", key.agent_name),
                });
            }
            Ok(Err(_closed)) => None,
            Ok(Ok(value)) => (*value).clone(),
        };

        match result {
            Some(Ok(ctx)) => {
                ctx.touch(Utc::now());
                Ok(ctx)
            }
            Some(Err(e)) => Err(e),
            None => {
                // The build task went away without reporting (panicked).
                self.entries.remove_if(&key, |_, slot| {
                    matches!(slot, Slot::Building { outcome: rx, .. } if rx.same_channel(&outcome))
                });
                Err(RuntimeError::Engine(format!(
                    "building agent '{}' was aborted",
                    key.agent_name
                )))
            }
        }
    }

    fn spawn_build(
        &self,
        key: AgentKey,
        generation: u64,
        tx: watch::Sender<Option<BuildResult>>,
    ) {
        let entries = self.entries.clone();
        let builder = self.builder.clone();
        let build_timeout = self.config.build_timeout();

        tokio::spawn(async move {
            let started = Instant::now();
            let result: BuildResult =
                match tokio::time::timeout(build_timeout, builder.build(&key)).await {
                    Ok(Ok(ctx)) => Ok(Arc::new(ctx)),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(RuntimeError::ConcurrencyTimeout {
                        what: format!("agent '{}' to finish building", key.agent_name),
                    }),
                };

            match &result {
                Ok(ctx) => {
                    let mut installed = false;
                    if let Some(mut slot) = entries.get_mut(&key)
                        && matches!(*slot, Slot::Building { generation: g, .. } if g == generation)
                    {
                        *slot = Slot::Ready(ctx.clone());
                        installed = true;
                    }
                    if installed {
                        debug!(agent = %key, elapsed_ms = started.elapsed().as_millis() as u64, "Execution context ready");
                    } else {
                        debug!(agent = %key, "Execution context was invalidated while building; not caching");
                    }
                }
                Err(e) => {
                    entries.remove_if(&key, |_, slot| {
                        matches!(slot, Slot::Building { generation: g, .. } if *g == generation)
                    });
                    warn!(agent = %key, "Failed to build execution context: {}", e);
                }
            }

            // Nobody listening is fine; the result is simply dropped.
            let _ = tx.send(Some(result));
        });
    }

    /// Drop every ready context idle longer than the TTL as of `now`. Each
    /// removal re-checks idleness under the entry's lock, so a concurrent
    /// acquire that touched it wins.
    pub fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let ttl_ms = self.config.idle_ttl().as_millis() as i64;
        let candidates: Vec<AgentKey> = self
            .entries
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Ready(ctx) if ctx.is_idle_at(now, ttl_ms) => Some(entry.key().clone()),
                _ => None,
            })
            .collect();

        let mut evicted = 0;
        for key in candidates {
            let removed = self.entries.remove_if(&key, |_, slot| {
                matches!(slot, Slot::Ready(ctx) if ctx.is_idle_at(now, ttl_ms))
            });
            if let Some((key, Slot::Ready(ctx))) = removed {
                ctx.release();
                evicted += 1;
                info!(agent = %key, "Evicted idle execution context");
            }
        }
        evicted
    }

    /// Force-remove a key. A build in flight still answers its waiters but
    /// its result is not cached.
    pub fn invalidate(&self, user_id: &str, agent_name: &str) -> bool {
        match self.entries.remove(&AgentKey::new(user_id, agent_name)) {
            Some((key, slot)) => {
                if let Slot::Ready(ctx) = slot {
                    ctx.release();
                }
                info!(agent = %key, "Invalidated execution context");
                true
            }
            None => false,
        }
    }

    /// Drop all ready contexts, releasing their resources.
    pub fn clear(&self) {
        let keys: Vec<AgentKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, Slot::Ready(ctx))) = self.entries.remove(&key) {
                ctx.release();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, user_id: &str, agent_name: &str) -> bool {
        self.entries
            .contains_key(&AgentKey::new(user_id, agent_name))
    }
}

#[async_trait]
impl LifecycleComponent for ExecutorCache {
    async fn on_shutdown(&self) -> Result<()> {
        info!(contexts = self.len(), "Releasing execution contexts...");
        self.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Builder that counts constructions and can be slowed down or failed.
    struct CountingBuilder {
        builds: AtomicUsize,
        delay: Duration,
        fail_first: AtomicUsize,
    }

    impl CountingBuilder {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                builds: AtomicUsize::new(0),
                delay,
                fail_first: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ContextBuilder for CountingBuilder {
        async fn build(&self, key: &AgentKey) -> Result<ExecutionContext, RuntimeError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(RuntimeError::configuration(&key.agent_name, "boom"));
            }
            Ok(ExecutionContext::new(key.clone(), "prompt".into(), Vec::new()))
        }
    }

    fn cache_with(builder: Arc<CountingBuilder>, config: CacheConfig) -> Arc<ExecutorCache> {
        Arc::new(ExecutorCache::new(builder, config))
    }

    #[tokio::test]
    async fn concurrent_first_acquires_build_once() {
        let builder = CountingBuilder::new(Duration::from_millis(100));
        let cache = cache_with(builder.clone(), CacheConfig::default());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.acquire("u1", "helper").await.unwrap()
            }));
        }
        let mut contexts = Vec::new();
        for handle in handles {
            contexts.push(handle.await.unwrap());
        }

        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
        assert!(contexts.iter().all(|c| Arc::ptr_eq(c, &contexts[0])));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn distinct_keys_build_independently() {
        let builder = CountingBuilder::new(Duration::from_millis(10));
        let cache = cache_with(builder.clone(), CacheConfig::default());
        let a = cache.acquire("u1", "helper").await.unwrap();
        let b = cache.acquire("u2", "helper").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(builder.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_build_reaches_all_waiters_and_is_not_cached() {
        let builder = CountingBuilder::new(Duration::from_millis(50));
        builder.fail_first.store(1, Ordering::SeqCst);
        let cache = cache_with(builder.clone(), CacheConfig::default());

        let (a, b) = tokio::join!(cache.acquire("u1", "helper"), cache.acquire("u1", "helper"));
        assert!(matches!(a, Err(RuntimeError::Configuration { .. })));
        assert!(matches!(b, Err(RuntimeError::Configuration { .. })));
        assert!(!cache.contains("u1", "helper"));

        // The next call retries.
        cache.acquire("u1", "helper").await.unwrap();
        assert_eq!(builder.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn idle_contexts_are_evicted_and_released() {
        let builder = CountingBuilder::new(Duration::ZERO);
        let config = CacheConfig {
            idle_ttl_secs: 60,
            ..CacheConfig::default()
        };
        let cache = cache_with(builder.clone(), config);
        let ctx = cache.acquire("u1", "helper").await.unwrap();
        let token = ctx.cancellation();

        // Within the TTL: survives.
        assert_eq!(cache.evict_idle(Utc::now() + chrono::Duration::seconds(30)), 0);
        assert!(cache.contains("u1", "helper"));

        // Beyond it: evicted on the sweep and its resources released.
        assert_eq!(cache.evict_idle(Utc::now() + chrono::Duration::seconds(61)), 1);
        assert!(!cache.contains("u1", "helper"));
        assert!(token.is_cancelled());

        // Next acquire rebuilds.
        let fresh = cache.acquire("u1", "helper").await.unwrap();
        assert!(!Arc::ptr_eq(&ctx, &fresh));
        assert_eq!(builder.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn touching_keeps_context_alive() {
        let builder = CountingBuilder::new(Duration::ZERO);
        let config = CacheConfig {
            idle_ttl_secs: 60,
            ..CacheConfig::default()
        };
        let cache = cache_with(builder, config);
        let ctx = cache.acquire("u1", "helper").await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(50);
        ctx.touch(later);
        assert_eq!(cache.evict_idle(later + chrono::Duration::seconds(30)), 0);
        assert_eq!(cache.evict_idle(later + chrono::Duration::seconds(61)), 1);
    }

    #[tokio::test]
    async fn slow_build_times_out_waiters() {
        let builder = CountingBuilder::new(Duration::from_secs(5));
        let config = CacheConfig {
            acquire_timeout_secs: 0,
            ..CacheConfig::default()
        };
        let cache = cache_with(builder, config);
        let err = cache.acquire("u1", "helper").await.err().unwrap();
        assert!(matches!(err, RuntimeError::ConcurrencyTimeout { .. }));
    }

    #[tokio::test]
    async fn build_timeout_is_reported_and_not_cached() {
        let builder = CountingBuilder::new(Duration::from_secs(5));
        let config = CacheConfig {
            build_timeout_secs: 0,
            ..CacheConfig::default()
        };
        let cache = cache_with(builder, config);
        let err = cache.acquire("u1", "helper").await.err().unwrap();
        assert!(matches!(err, RuntimeError::ConcurrencyTimeout { .. }));
        assert!(!cache.contains("u1", "helper"));
    }

    #[tokio::test]
    async fn invalidate_during_build_is_not_cached() {
        let builder = CountingBuilder::new(Duration::from_millis(100));
        let cache = cache_with(builder.clone(), CacheConfig::default());

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.acquire("u1", "helper").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.invalidate("u1", "helper"));

        // The in-flight caller still gets its context.
        assert!(waiter.await.unwrap().is_ok());
        assert!(!cache.contains("u1", "helper"));
    }

    #[tokio::test]
    async fn invalidate_ready_context_releases_it() {
        let cache = cache_with(CountingBuilder::new(Duration::ZERO), CacheConfig::default());
        let ctx = cache.acquire("u1", "helper").await.unwrap();
        assert!(cache.invalidate("u1", "helper"));
        assert!(ctx.cancellation().is_cancelled());
        assert!(!cache.invalidate("u1", "helper"));
    }

    #[tokio::test]
    async fn shutdown_clears_everything() {
        let cache = cache_with(CountingBuilder::new(Duration::ZERO), CacheConfig::default());
        let ctx = cache.acquire("u1", "a").await.unwrap();
        cache.acquire("u1", "b").await.unwrap();
        cache.on_shutdown().await.unwrap();
        assert!(cache.is_empty());
        assert!(ctx.cancellation().is_cancelled());
    }
}
