use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::error::RuntimeError;
use crate::core::memory::MemorySystem;
use crate::core::oauth::CredentialBridge;
use crate::tools::{LoadContext, Tool, ToolRegistry};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentKey {
    pub user_id: String,
    pub agent_name: String,
}

impl AgentKey {
    pub fn new(user_id: &str, agent_name: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            agent_name: agent_name.to_string(),
        }
    }
}

impl fmt::Display for AgentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.agent_name)
    }
}

/// A ready-to-run agent: its prompt and bound tools. At most one exists per
/// key while it sits in the cache.
pub struct ExecutionContext {
    key: AgentKey,
    system_prompt: String,
    tools: Vec<Arc<dyn Tool>>,
    last_used_ms: AtomicI64,
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(key: AgentKey, system_prompt: String, tools: Vec<Arc<dyn Tool>>) -> Self {
        let now = Utc::now();
        Self {
            key,
            system_prompt,
            tools,
            last_used_ms: AtomicI64::new(now.timestamp_millis()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn key(&self) -> &AgentKey {
        &self.key
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    pub fn touch(&self, now: DateTime<Utc>) {
        self.last_used_ms
            .fetch_max(now.timestamp_millis(), Ordering::AcqRel);
    }

    pub fn last_used_ms(&self) -> i64 {
        self.last_used_ms.load(Ordering::Acquire)
    }

    pub fn is_idle_at(&self, now: DateTime<Utc>, ttl_ms: i64) -> bool {
        now.timestamp_millis() - self.last_used_ms() > ttl_ms
    }

    /// Cancelled once the context leaves the cache. Every engine request
    /// built from this context carries it, so in-flight tool calls stop.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn release(&self) {
        self.cancel.cancel();
    }
}

/// Constructs execution contexts on cache misses.
#[async_trait]
pub trait ContextBuilder: Send + Sync {
    async fn build(&self, key: &AgentKey) -> Result<ExecutionContext, RuntimeError>;
}

/// Builds a context from the agent row and its tool rows.
pub struct AgentContextBuilder {
    memory: Arc<MemorySystem>,
    credentials: Arc<CredentialBridge>,
    registry: ToolRegistry,
}

impl AgentContextBuilder {
    pub fn new(
        memory: Arc<MemorySystem>,
        credentials: Arc<CredentialBridge>,
        registry: ToolRegistry,
    ) -> Self {
        Self {
            memory,
            credentials,
            registry,
        }
    }
}

#[async_trait]
impl ContextBuilder for AgentContextBuilder {
    async fn build(&self, key: &AgentKey) -> Result<ExecutionContext, RuntimeError> {
        let agent = self
            .memory
            .get_agent(&key.user_id, &key.agent_name)
            .await?
            .ok_or_else(|| RuntimeError::UnknownAgent {
                user_id: key.user_id.clone(),
                agent: key.agent_name.clone(),
            })?;
        if !agent.enabled {
            return Err(RuntimeError::AgentDisabled {
                agent: key.agent_name.clone(),
            });
        }

        let rows = self.memory.list_tool_configs(agent.id).await?;
        let mut load = LoadContext::new(
            &key.user_id,
            &key.agent_name,
            self.memory.clone(),
            self.credentials.clone(),
        );
        let tools = self.registry.load(&rows, &mut load)?;

        info!(
            agent = %key,
            tools = tools.len(),
            "Built execution context"
        );
        Ok(ExecutionContext::new(key.clone(), agent.system_prompt, tools))
    }
}
