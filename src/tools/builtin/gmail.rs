use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::core::error::CredentialError;
use crate::core::memory::types::ToolConfigRow;
use crate::core::oauth::CredentialBridge;
use crate::tools::schema::{ArgSpec, ArgType, ConfigIssue, StaticConfig};
use crate::tools::{LoadContext, ToolError, ToolHandler};

pub const TOOL_TYPE: &str = "gmail";
const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com";
const DEFAULT_SERVICE: &str = "gmail";
const DEFAULT_TIMEOUT_SECS: u64 = 20;
const DEFAULT_MAX_RESULTS: i64 = 10;

/// HTTP client shared by every gmail row of one agent.
struct GmailClient {
    http: reqwest::Client,
}

/// Mailbox search using the user's connected Gmail account. Credentials are
/// resolved per call, so the tool loads fine before the account is connected.
struct GmailSearch {
    client: Arc<GmailClient>,
    credentials: Arc<CredentialBridge>,
    user_id: String,
    service: String,
    api_base: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
    #[serde(default, rename = "threadId")]
    thread_id: Option<String>,
    #[serde(default)]
    snippet: Option<String>,
}

pub fn build(row: &ToolConfigRow, ctx: &mut LoadContext) -> Result<Arc<dyn ToolHandler>, ConfigIssue> {
    let config = StaticConfig::new(&row.static_config)?;
    let api_base = config
        .optional_str("api_base")?
        .unwrap_or(DEFAULT_API_BASE)
        .trim_end_matches('/')
        .to_string();
    let service = config
        .optional_str("service")?
        .unwrap_or(DEFAULT_SERVICE)
        .to_string();
    let timeout = config.optional_u64("timeout_secs")?.unwrap_or(DEFAULT_TIMEOUT_SECS);

    let client = ctx.shared.get_or_insert_with(TOOL_TYPE, || GmailClient {
        http: reqwest::Client::new(),
    });

    Ok(Arc::new(GmailSearch {
        client,
        credentials: ctx.credentials.clone(),
        user_id: ctx.user_id.clone(),
        service,
        api_base,
        timeout: Duration::from_secs(timeout.max(1)),
    }))
}

fn render(messages: &[MessageRef]) -> String {
    if messages.is_empty() {
        return "No messages matched.".to_string();
    }
    let mut out = format!("Found {} message(s):", messages.len());
    for message in messages {
        out.push_str("\n- ");
        out.push_str(&message.id);
        if let Some(thread) = &message.thread_id {
            out.push_str(&format!(" (thread {})", thread));
        }
        if let Some(snippet) = message.snippet.as_deref().filter(|s| !s.is_empty()) {
            out.push_str(": ");
            out.push_str(snippet);
        }
    }
    out
}

#[async_trait]
impl ToolHandler for GmailSearch {
    fn base_args(&self) -> Vec<ArgSpec> {
        vec![
            ArgSpec::optional("query", ArgType::String, "Gmail search query, e.g. 'is:unread'"),
            ArgSpec::optional("max_results", ArgType::Integer, "Maximum messages to list")
                .with_default(json!(DEFAULT_MAX_RESULTS)),
        ]
    }

    async fn call(&self, args: Map<String, Value>) -> Result<String, ToolError> {
        let credential = self
            .credentials
            .get_usable_credential(&self.user_id, &self.service)
            .await?;

        let max_results = args
            .get("max_results")
            .and_then(Value::as_i64)
            .unwrap_or(DEFAULT_MAX_RESULTS)
            .clamp(1, 100);
        let mut query: Vec<(&str, String)> = vec![("maxResults", max_results.to_string())];
        if let Some(q) = args.get("query").and_then(Value::as_str) {
            query.push(("q", q.to_string()));
        }

        let url = format!("{}/gmail/v1/users/me/messages", self.api_base);
        let request = self.client.http.get(&url).query(&query).timeout(self.timeout);
        let response = credential
            .apply(request)
            .send()
            .await
            .map_err(|e| ToolError::Upstream(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ToolError::Credential(CredentialError::ReauthRequired {
                service: self.service.clone(),
                reason: format!("mail API answered HTTP {}", status),
            }));
        }
        if !status.is_success() {
            return Err(ToolError::Upstream(format!("mail API answered HTTP {}", status)));
        }

        let body: ListResponse = response
            .json()
            .await
            .map_err(|e| ToolError::Upstream(format!("unreadable mail API response: {}", e)))?;
        debug!(user_id = %self.user_id, count = body.messages.len(), "Listed mail messages");
        Ok(render(&body.messages))
    }
}
