//! Concurrency behaviour of the executor cache through its public API.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use conductor::config::CacheConfig;
use conductor::core::agent::{AgentKey, ContextBuilder, ExecutionContext, ExecutorCache};
use conductor::core::error::RuntimeError;

/// Build time depends on the agent name; builds are counted per key.
#[derive(Default)]
struct SlowBuilder {
    builds: Mutex<HashMap<AgentKey, usize>>,
}

impl SlowBuilder {
    fn builds_for(&self, user: &str, agent: &str) -> usize {
        self.builds
            .lock()
            .unwrap()
            .get(&AgentKey::new(user, agent))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ContextBuilder for SlowBuilder {
    async fn build(&self, key: &AgentKey) -> Result<ExecutionContext, RuntimeError> {
        *self.builds.lock().unwrap().entry(key.clone()).or_default() += 1;
        let delay = if key.agent_name == "slow" { 800 } else { 20 };
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(ExecutionContext::new(key.clone(), format!("prompt for {}", key), Vec::new()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_users_many_agents_build_once_each() {
    let builder = Arc::new(SlowBuilder::default());
    let cache = Arc::new(ExecutorCache::new(builder.clone(), CacheConfig::default()));

    let mut handles = Vec::new();
    for round in 0..5 {
        for user in ["alice", "bob", "carol"] {
            for agent in ["mail", "notes"] {
                let cache = cache.clone();
                handles.push(tokio::spawn(async move {
                    let ctx = cache.acquire(user, agent).await.unwrap();
                    (round, ctx)
                }));
            }
        }
    }

    let mut by_key: HashMap<AgentKey, Arc<ExecutionContext>> = HashMap::new();
    for handle in handles {
        let (_, ctx) = handle.await.unwrap();
        let first = by_key.entry(ctx.key().clone()).or_insert_with(|| ctx.clone());
        assert!(Arc::ptr_eq(first, &ctx));
    }

    assert_eq!(by_key.len(), 6);
    assert_eq!(cache.len(), 6);
    for user in ["alice", "bob", "carol"] {
        for agent in ["mail", "notes"] {
            assert_eq!(builder.builds_for(user, agent), 1);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_build_does_not_block_other_keys() {
    let builder = Arc::new(SlowBuilder::default());
    let cache = Arc::new(ExecutorCache::new(builder, CacheConfig::default()));

    let slow = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.acquire("alice", "slow").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    cache.acquire("alice", "fast").await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(!slow.is_finished());

    slow.await.unwrap().unwrap();
}

#[tokio::test]
async fn sweep_keeps_recently_used_and_drops_idle() {
    let builder = Arc::new(SlowBuilder::default());
    let config = CacheConfig {
        idle_ttl_secs: 60,
        ..CacheConfig::default()
    };
    let cache = ExecutorCache::new(builder.clone(), config);

    let idle = cache.acquire("alice", "mail").await.unwrap();
    let busy = cache.acquire("bob", "mail").await.unwrap();

    let later = Utc::now() + chrono::Duration::seconds(45);
    busy.touch(later);

    assert_eq!(cache.evict_idle(later + chrono::Duration::seconds(30)), 1);
    assert!(!cache.contains("alice", "mail"));
    assert!(cache.contains("bob", "mail"));
    assert!(idle.cancellation().is_cancelled());
    assert!(!busy.cancellation().is_cancelled());

    // A post-eviction acquire builds a fresh context.
    cache.acquire("alice", "mail").await.unwrap();
    assert_eq!(builder.builds_for("alice", "mail"), 2);
}
