use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::core::memory::types::ToolConfigRow;
use crate::core::oauth::CredentialBridge;
use crate::tools::schema::{ConfigIssue, StaticConfig};
use crate::tools::{LoadContext, ToolError, ToolHandler};

pub const TOOL_TYPE: &str = "http_fetch";
const DEFAULT_TIMEOUT_SECS: u64 = 20;
const DEFAULT_MAX_CHARS: u64 = 8000;

/// GET against a fixed endpoint. Call arguments become query parameters; an
/// optional `service` attaches the user's credential for that provider.
struct HttpFetch {
    http: Arc<reqwest::Client>,
    url: String,
    headers: Vec<(String, String)>,
    service: Option<String>,
    credentials: Arc<CredentialBridge>,
    user_id: String,
    timeout: Duration,
    max_chars: usize,
}

pub fn build(row: &ToolConfigRow, ctx: &mut LoadContext) -> Result<Arc<dyn ToolHandler>, ConfigIssue> {
    let config = StaticConfig::new(&row.static_config)?;
    let url = config.required_str("url")?;
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ConfigIssue::new("static_config.url", "must be an http(s) URL"));
    }
    let headers = config.optional_string_map("headers")?;
    let service = config.optional_str("service")?.map(str::to_string);
    let timeout = config.optional_u64("timeout_secs")?.unwrap_or(DEFAULT_TIMEOUT_SECS);
    let max_chars = config.optional_u64("max_chars")?.unwrap_or(DEFAULT_MAX_CHARS);

    let http = ctx.shared.get_or_insert_with(TOOL_TYPE, reqwest::Client::new);

    Ok(Arc::new(HttpFetch {
        http,
        url: url.to_string(),
        headers,
        service,
        credentials: ctx.credentials.clone(),
        user_id: ctx.user_id.clone(),
        timeout: Duration::from_secs(timeout.max(1)),
        max_chars: max_chars as usize,
    }))
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate(body: &str, max_chars: usize) -> String {
    if body.chars().count() > max_chars {
        let kept: String = body.chars().take(max_chars).collect();
        format!("{}... [truncated]", kept)
    } else {
        body.to_string()
    }
}

#[async_trait]
impl ToolHandler for HttpFetch {
    async fn call(&self, args: Map<String, Value>) -> Result<String, ToolError> {
        let query: Vec<(String, String)> = args
            .iter()
            .map(|(k, v)| (k.clone(), query_value(v)))
            .collect();

        let mut request = self.http.get(&self.url).query(&query).timeout(self.timeout);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(service) = &self.service {
            let credential = self
                .credentials
                .get_usable_credential(&self.user_id, service)
                .await?;
            request = credential.apply(request);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ToolError::Upstream(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::Upstream(e.to_string()))?;

        if !status.is_success() {
            return Err(ToolError::Upstream(format!("HTTP {}", status)));
        }
        Ok(truncate(&body, self.max_chars))
    }
}
