use chrono::{DateTime, Utc};
use serde::Serialize;

/// One short-term memory entry, in session order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StmEntry {
    pub seq: i64,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentRecord {
    pub id: i64,
    pub user_id: String,
    pub agent_name: String,
    pub system_prompt: String,
    pub enabled: bool,
}

/// A tool configuration row as stored. `static_config` and
/// `runtime_args_schema` are raw JSON; the tool loader validates them.
#[derive(Debug, Clone, Serialize)]
pub struct ToolConfigRow {
    pub id: i64,
    pub agent_id: i64,
    pub tool_type: String,
    pub name: String,
    pub description: String,
    pub static_config: serde_json::Value,
    pub runtime_args_schema: serde_json::Value,
    pub sort_order: i64,
}

/// Insert payload for a tool configuration row.
#[derive(Debug, Clone)]
pub struct NewToolConfig {
    pub tool_type: String,
    pub name: String,
    pub description: String,
    pub static_config: serde_json::Value,
    pub runtime_args_schema: serde_json::Value,
    pub sort_order: i64,
}

impl NewToolConfig {
    pub fn new(tool_type: &str, name: &str, description: &str) -> Self {
        Self {
            tool_type: tool_type.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            static_config: serde_json::json!({}),
            runtime_args_schema: serde_json::json!([]),
            sort_order: 0,
        }
    }

    pub fn with_static_config(mut self, value: serde_json::Value) -> Self {
        self.static_config = value;
        self
    }

    pub fn with_args_schema(mut self, value: serde_json::Value) -> Self {
        self.runtime_args_schema = value;
        self
    }

    pub fn with_order(mut self, order: i64) -> Self {
        self.sort_order = order;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleRecord {
    pub id: String,
    pub user_id: String,
    pub agent_name: String,
    pub trigger_spec: String,
    pub prompt: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
    pub consecutive_errors: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledResultRecord {
    pub id: i64,
    pub schedule_id: String,
    pub user_id: String,
    pub agent_name: String,
    pub created_at: DateTime<Utc>,
    pub success: bool,
    pub payload: String,
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}
