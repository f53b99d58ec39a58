pub mod builtin;
mod loader;
pub mod schema;

pub use loader::{LoadContext, ToolFactory, ToolRegistry};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::core::error::CredentialError;
use schema::{ArgSpec, ArgsSchema};

/// What the execution engine sees of a tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON-Schema object for the call arguments.
    pub parameters: Value,
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("upstream call failed: {0}")]
    Upstream(String),
    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    /// Plain-language text handed back to the engine as the tool result.
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidArguments(reason) => format!("The tool call was not valid: {}.", reason),
            Self::Credential(e) => e.user_message(),
            Self::Upstream(_) => {
                "The service behind this tool did not respond properly. Try again later.".to_string()
            }
            Self::Failed(reason) => reason.clone(),
        }
    }
}

/// A callable tool bound into an execution context.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> &ToolSpec;
    async fn invoke(&self, args: Value) -> Result<String, ToolError>;
}

/// The behavior behind a tool type. One handler is built per configuration
/// row; arguments arrive already validated.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Arguments every instance of this tool type accepts.
    fn base_args(&self) -> Vec<ArgSpec> {
        Vec::new()
    }

    async fn call(&self, args: Map<String, Value>) -> Result<String, ToolError>;
}

/// A handler wrapped with its row's name, description and argument schema.
pub struct BoundTool {
    spec: ToolSpec,
    schema: ArgsSchema,
    handler: Arc<dyn ToolHandler>,
}

impl BoundTool {
    pub fn new(
        name: &str,
        description: &str,
        schema: ArgsSchema,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            spec: ToolSpec {
                name: name.to_string(),
                description: description.to_string(),
                parameters: schema.to_json_schema(),
            },
            schema,
            handler,
        }
    }
}

#[async_trait]
impl Tool for BoundTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn invoke(&self, args: Value) -> Result<String, ToolError> {
        let args = self
            .schema
            .validate(&args)
            .map_err(ToolError::InvalidArguments)?;
        debug!(tool = %self.spec.name, "Invoking tool");
        self.handler.call(args).await
    }
}

/// Clients shared by all rows of the same tool type within one load.
#[derive(Default)]
pub struct SharedClients {
    clients: HashMap<&'static str, Arc<dyn Any + Send + Sync>>,
    created: usize,
}

impl SharedClients {
    pub fn get_or_insert_with<T, F>(&mut self, key: &'static str, make: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.clients.get(key)
            && let Ok(client) = existing.clone().downcast::<T>()
        {
            return client;
        }
        let client = Arc::new(make());
        self.created += 1;
        self.clients.insert(key, client.clone());
        client
    }

    /// How many clients were constructed (not reused).
    pub fn created(&self) -> usize {
        self.created
    }
}
