//! The boundary to the component that actually reasons over a turn.
//!
//! The runtime hands the engine everything it needs (system context, bound
//! tools, recent history, input) and gets back the final output plus a record
//! of the tool calls made along the way. Engines keep no state between calls.

mod remote;

pub use remote::RemoteEngine;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::core::error::RuntimeError;
use crate::core::memory::types::StmEntry;
use crate::tools::Tool;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

impl From<&StmEntry> for HistoryMessage {
    fn from(entry: &StmEntry) -> Self {
        Self {
            role: entry.role.clone(),
            content: entry.content.clone(),
        }
    }
}

pub struct EngineRequest {
    pub system_context: String,
    pub tools: Vec<Arc<dyn Tool>>,
    pub history: Vec<HistoryMessage>,
    pub input: String,
    /// Cancelled when the owning context is evicted; in-flight tool calls stop.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInvocation {
    pub tool: String,
    pub arguments: Value,
    pub output: String,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineResponse {
    pub output: String,
    pub tool_invocations: Vec<ToolInvocation>,
}

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn execute(&self, request: EngineRequest) -> Result<EngineResponse, RuntimeError>;
}

/// Run one tool call on behalf of an engine. Failures come back as the
/// tool's plain-language result, never as an error of the turn.
pub async fn invoke_tool(request: &EngineRequest, name: &str, arguments: Value) -> ToolInvocation {
    let Some(tool) = request.tools.iter().find(|t| t.spec().name == name) else {
        return ToolInvocation {
            tool: name.to_string(),
            arguments,
            output: format!("There is no tool named '{}'.", name),
            success: false,
        };
    };

    let outcome = tokio::select! {
        outcome = tool.invoke(arguments.clone()) => outcome,
        _ = request.cancel.cancelled() => {
            warn!(tool = name, "Tool call cancelled; agent was unloaded");
            return ToolInvocation {
                tool: name.to_string(),
                arguments,
                output: "The agent was unloaded before this tool finished. Try again.".to_string(),
                success: false,
            };
        }
    };

    match outcome {
        Ok(output) => ToolInvocation {
            tool: name.to_string(),
            arguments,
            output,
            success: true,
        },
        Err(e) => {
            warn!(tool = name, "Tool call failed: {}", e);
            ToolInvocation {
                tool: name.to_string(),
                arguments,
                output: e.user_message(),
                success: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::CredentialError;
    use crate::tools::{ToolError, ToolSpec};
    use serde_json::json;

    struct Disconnected {
        spec: ToolSpec,
    }

    #[async_trait]
    impl Tool for Disconnected {
        fn spec(&self) -> &ToolSpec {
            &self.spec
        }

        async fn invoke(&self, _args: Value) -> Result<String, ToolError> {
            Err(ToolError::Credential(CredentialError::NotConnected {
                service: "gmail".into(),
            }))
        }
    }

    struct Stalled {
        spec: ToolSpec,
    }

    #[async_trait]
    impl Tool for Stalled {
        fn spec(&self) -> &ToolSpec {
            &self.spec
        }

        async fn invoke(&self, _args: Value) -> Result<String, ToolError> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok("too late".into())
        }
    }

    fn spec(name: &str) -> ToolSpec {
        ToolSpec {
            name: name.into(),
            description: String::new(),
            parameters: json!({"type": "object"}),
        }
    }

    fn request_with(tools: Vec<Arc<dyn Tool>>) -> EngineRequest {
        EngineRequest {
            system_context: String::new(),
            tools,
            history: Vec::new(),
            input: String::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn tool_failures_become_plain_results() {
        let request = request_with(vec![Arc::new(Disconnected {
            spec: spec("inbox"),
        })]);

        let call = invoke_tool(&request, "inbox", json!({})).await;
        assert!(!call.success);
        assert!(call.output.starts_with("Gmail isn't connected"));

        let missing = invoke_tool(&request, "nope", json!({})).await;
        assert!(!missing.success);
        assert!(missing.output.contains("'nope'"));
    }

    #[tokio::test]
    async fn cancellation_stops_a_running_tool() {
        let request = request_with(vec![Arc::new(Stalled {
            spec: spec("slow"),
        })]);
        let cancel = request.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            cancel.cancel();
        });

        let call = invoke_tool(&request, "slow", json!({})).await;
        assert!(!call.success);
        assert!(call.output.contains("unloaded"));
    }
}
