use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{EngineRequest, EngineResponse, ExecutionEngine, invoke_tool};
use crate::config::EngineConfig;
use crate::core::error::RuntimeError;
use crate::tools::ToolSpec;

#[derive(Serialize)]
struct TurnRequest<'a> {
    system_context: &'a str,
    tools: Vec<&'a ToolSpec>,
    messages: &'a [WireMessage],
}

#[derive(Debug, Clone, Serialize)]
struct WireMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
}

impl WireMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TurnResponse {
    Final { output: String },
    ToolCalls { calls: Vec<WireToolCall> },
}

/// Engine reached over HTTP. Each round posts the conversation so far to
/// `{endpoint}/v1/turn`; requested tool calls run locally and their results
/// are sent back in the next round.
pub struct RemoteEngine {
    client: reqwest::Client,
    endpoint: String,
    max_tool_rounds: usize,
}

impl RemoteEngine {
    pub fn new(config: &EngineConfig) -> anyhow::Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("engine.endpoint is not configured"))?
            .trim_end_matches('/')
            .to_string();
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            endpoint,
            max_tool_rounds: config.max_tool_rounds.max(1),
        })
    }

    async fn post_turn(&self, body: &TurnRequest<'_>) -> Result<TurnResponse, RuntimeError> {
        let res = self
            .client
            .post(format!("{}/v1/turn", self.endpoint))
            .json(body)
            .send()
            .await
            .map_err(|e| RuntimeError::Engine(format!("request failed: {}", e)))?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(RuntimeError::Engine(format!(
                "engine answered HTTP {}: {}",
                status, body
            )));
        }
        res.json()
            .await
            .map_err(|e| RuntimeError::Engine(format!("unreadable engine response: {}", e)))
    }
}

#[async_trait]
impl ExecutionEngine for RemoteEngine {
    async fn execute(&self, request: EngineRequest) -> Result<EngineResponse, RuntimeError> {
        let specs: Vec<&ToolSpec> = request.tools.iter().map(|t| t.spec()).collect();
        let mut messages: Vec<WireMessage> = request
            .history
            .iter()
            .map(|m| WireMessage::text(&m.role, &m.content))
            .collect();
        messages.push(WireMessage::text("user", &request.input));

        let mut invocations = Vec::new();
        for round in 1..=self.max_tool_rounds {
            let body = TurnRequest {
                system_context: &request.system_context,
                tools: specs.clone(),
                messages: &messages,
            };
            match self.post_turn(&body).await? {
                TurnResponse::Final { output } => {
                    return Ok(EngineResponse {
                        output,
                        tool_invocations: invocations,
                    });
                }
                TurnResponse::ToolCalls { calls } => {
                    debug!(round, calls = calls.len(), "Engine requested tool calls");
                    messages.push(WireMessage {
                        role: "assistant".into(),
                        content: String::new(),
                        tool_call_id: None,
                        tool_calls: calls.clone(),
                    });
                    for call in calls {
                        let invocation =
                            invoke_tool(&request, &call.name, call.arguments).await;
                        messages.push(WireMessage {
                            role: "tool".into(),
                            content: invocation.output.clone(),
                            tool_call_id: Some(call.id),
                            tool_calls: Vec::new(),
                        });
                        invocations.push(invocation);
                    }
                }
            }
        }

        warn!(
            rounds = self.max_tool_rounds,
            "Engine kept requesting tools; giving up on this turn"
        );
        Err(RuntimeError::Engine(format!(
            "no final answer after {} tool rounds",
            self.max_tool_rounds
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::HistoryMessage;
    use axum::{Json, Router, routing::post};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    async fn spawn_engine(tool_rounds: usize) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/v1/turn",
            post(move |Json(body): Json<Value>| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < tool_rounds {
                        Json(serde_json::json!({
                            "type": "tool_calls",
                            "calls": [{"id": format!("c{}", n), "name": "missing_tool", "arguments": {}}]
                        }))
                    } else {
                        let count = body["messages"].as_array().map(|m| m.len()).unwrap_or(0);
                        Json(serde_json::json!({
                            "type": "final",
                            "output": format!("saw {} messages", count)
                        }))
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), hits)
    }

    fn engine(endpoint: &str, rounds: usize) -> RemoteEngine {
        RemoteEngine::new(&EngineConfig {
            endpoint: Some(endpoint.to_string()),
            max_tool_rounds: rounds,
            ..EngineConfig::default()
        })
        .unwrap()
    }

    fn request() -> EngineRequest {
        EngineRequest {
            system_context: "be brief".into(),
            tools: Vec::new(),
            history: vec![HistoryMessage {
                role: "user".into(),
                content: "earlier".into(),
            }],
            input: "now".into(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn final_answer_after_tool_round() {
        let (url, hits) = spawn_engine(1).await;
        let response = engine(&url, 4).execute(request()).await.unwrap();

        // history + input + assistant tool call + tool result
        assert_eq!(response.output, "saw 4 messages");
        assert_eq!(response.tool_invocations.len(), 1);
        assert!(!response.tool_invocations[0].success);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn tool_round_limit_is_an_engine_error() {
        let (url, _) = spawn_engine(usize::MAX).await;
        let err = engine(&url, 2).execute(request()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Engine(_)));
    }

    #[test]
    fn endpoint_is_required() {
        assert!(RemoteEngine::new(&EngineConfig::default()).is_err());
    }
}
