mod bootstrap;
mod cache;
mod context;

pub use bootstrap::init_core_subsystems;
pub use cache::ExecutorCache;
pub use context::{AgentContextBuilder, AgentKey, ContextBuilder, ExecutionContext};

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{CacheConfig, RuntimeConfig};
use crate::core::engine::{EngineRequest, EngineResponse, ExecutionEngine, HistoryMessage};
use crate::core::error::RuntimeError;
use crate::core::memory::MemorySystem;
use crate::core::oauth::CredentialBridge;
use crate::tools::ToolRegistry;

/// Entry point for both interactive chat and scheduled runs. Everything goes
/// through the same executor cache, so a scheduled run and a chat turn for the
/// same agent share one context.
pub struct Runtime {
    memory: Arc<MemorySystem>,
    credentials: Arc<CredentialBridge>,
    cache: Arc<ExecutorCache>,
    engine: Arc<dyn ExecutionEngine>,
}

impl Runtime {
    pub fn new(
        memory: Arc<MemorySystem>,
        credentials: Arc<CredentialBridge>,
        registry: ToolRegistry,
        engine: Arc<dyn ExecutionEngine>,
        cache_config: CacheConfig,
    ) -> Self {
        let builder = AgentContextBuilder::new(memory.clone(), credentials.clone(), registry);
        let cache = Arc::new(ExecutorCache::new(Arc::new(builder), cache_config));
        Self {
            memory,
            credentials,
            cache,
            engine,
        }
    }

    /// Wire the runtime from the data directory: database, vault, providers
    /// and the builtin tool registry.
    pub async fn bootstrap(
        data_dir: &Path,
        config: &RuntimeConfig,
        engine: Arc<dyn ExecutionEngine>,
    ) -> Result<Self> {
        let (memory, credentials) = init_core_subsystems(data_dir, config).await?;
        let registry = ToolRegistry::builtin();
        info!(tool_types = ?registry.types(), "Tool registry ready");
        Ok(Self::new(
            memory,
            credentials,
            registry,
            engine,
            config.cache.clone(),
        ))
    }

    pub fn memory(&self) -> &Arc<MemorySystem> {
        &self.memory
    }

    pub fn credentials(&self) -> &Arc<CredentialBridge> {
        &self.credentials
    }

    pub fn cache(&self) -> &Arc<ExecutorCache> {
        &self.cache
    }

    /// One interactive turn: recent session history in, the turn appended
    /// after the engine answers. A failed turn leaves the session untouched.
    pub async fn chat(
        &self,
        user_id: &str,
        agent_name: &str,
        session_id: &str,
        input: &str,
    ) -> Result<EngineResponse, RuntimeError> {
        let ctx = self.cache.acquire(user_id, agent_name).await?;
        let history: Vec<HistoryMessage> = self
            .memory
            .read_window(session_id)
            .await?
            .iter()
            .map(HistoryMessage::from)
            .collect();

        let response = self
            .engine
            .execute(EngineRequest {
                system_context: ctx.system_prompt().to_string(),
                tools: ctx.tools().to_vec(),
                history,
                input: input.to_string(),
                cancel: ctx.cancellation(),
            })
            .await?;

        if let Err(e) = self
            .memory
            .append_turn(session_id, input, &response.output)
            .await
        {
            // The user already has an answer; losing the history entry is
            // not worth failing the turn over.
            warn!(session = session_id, "Failed to record turn: {}", e);
        }
        Ok(response)
    }

    /// An unattended run: fresh empty history, nothing written to any session.
    pub async fn run_scheduled(
        &self,
        user_id: &str,
        agent_name: &str,
        prompt: &str,
    ) -> Result<EngineResponse, RuntimeError> {
        let ctx = self.cache.acquire(user_id, agent_name).await?;
        self.engine
            .execute(EngineRequest {
                system_context: ctx.system_prompt().to_string(),
                tools: ctx.tools().to_vec(),
                history: Vec::new(),
                input: prompt.to_string(),
                cancel: ctx.cancellation(),
            })
            .await
    }
}
