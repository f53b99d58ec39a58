use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use super::schema::{ArgsSchema, ConfigIssue};
use super::{BoundTool, SharedClients, Tool, ToolHandler, builtin};
use crate::core::error::RuntimeError;
use crate::core::memory::MemorySystem;
use crate::core::memory::types::ToolConfigRow;
use crate::core::oauth::CredentialBridge;

/// Everything a factory may need while building one agent's tools.
pub struct LoadContext {
    pub user_id: String,
    pub agent_name: String,
    pub memory: Arc<MemorySystem>,
    pub credentials: Arc<CredentialBridge>,
    pub shared: SharedClients,
}

impl LoadContext {
    pub fn new(
        user_id: &str,
        agent_name: &str,
        memory: Arc<MemorySystem>,
        credentials: Arc<CredentialBridge>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            agent_name: agent_name.to_string(),
            memory,
            credentials,
            shared: SharedClients::default(),
        }
    }
}

/// Builds the handler for one configuration row.
pub type ToolFactory = fn(&ToolConfigRow, &mut LoadContext) -> Result<Arc<dyn ToolHandler>, ConfigIssue>;

/// Fixed table of tool types. New types need code; new instances only need
/// configuration rows.
#[derive(Clone)]
pub struct ToolRegistry {
    factories: HashMap<&'static str, ToolFactory>,
}

impl ToolRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(builtin::notes::TOOL_TYPE, builtin::notes::build);
        registry.register(builtin::gmail::TOOL_TYPE, builtin::gmail::build);
        registry.register(builtin::http_fetch::TOOL_TYPE, builtin::http_fetch::build);
        registry
    }

    pub fn register(&mut self, tool_type: &'static str, factory: ToolFactory) {
        if self.factories.insert(tool_type, factory).is_some() {
            warn!(tool_type, "Tool type registered twice; keeping the latest factory");
        }
    }

    pub fn contains(&self, tool_type: &str) -> bool {
        self.factories.contains_key(tool_type)
    }

    pub fn types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.factories.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Turn an agent's rows (already in configured order) into bound tools.
    /// Any bad row fails the whole agent with a configuration error.
    pub fn load(
        &self,
        rows: &[ToolConfigRow],
        ctx: &mut LoadContext,
    ) -> Result<Vec<Arc<dyn Tool>>, RuntimeError> {
        let agent = ctx.agent_name.clone();
        let mut names = HashSet::new();
        let mut tools: Vec<Arc<dyn Tool>> = Vec::with_capacity(rows.len());

        for row in rows {
            let reject = |reason: String| {
                RuntimeError::configuration(
                    &agent,
                    format!("tool '{}' (row {}): {}", row.name, row.id, reason),
                )
            };

            let name = row.name.trim();
            if name.is_empty() {
                return Err(reject("name must not be empty".into()));
            }
            if !names.insert(name.to_string()) {
                return Err(reject("duplicate tool name for this agent".into()));
            }

            let factory = self
                .factories
                .get(row.tool_type.as_str())
                .ok_or_else(|| reject(format!("unknown tool_type '{}'", row.tool_type)))?;

            let row_schema =
                ArgsSchema::parse(&row.runtime_args_schema).map_err(|e| reject(e.to_string()))?;
            let handler = factory(row, ctx).map_err(|e| reject(e.to_string()))?;
            let schema = row_schema
                .with_base(handler.base_args())
                .map_err(|e| reject(e.to_string()))?;

            tools.push(Arc::new(BoundTool::new(name, &row.description, schema, handler)));
        }

        debug!(
            user_id = %ctx.user_id,
            agent = %ctx.agent_name,
            tools = tools.len(),
            "Loaded tools"
        );
        Ok(tools)
    }
}
