use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::warn;

use crate::core::memory::MemorySystem;
use crate::core::memory::notes::{EMPTY_NOTE_SENTINEL, NoteChange, NoteEdit, NoteError};
use crate::core::memory::types::ToolConfigRow;
use crate::tools::schema::{ArgSpec, ArgType, ConfigIssue, StaticConfig};
use crate::tools::{LoadContext, ToolError, ToolHandler};

pub const TOOL_TYPE: &str = "long_term_memory";

/// Read and edit the long-term note of the agent that owns the tool.
struct NoteTool {
    memory: Arc<MemorySystem>,
    user_id: String,
    agent_name: String,
}

pub fn build(row: &ToolConfigRow, ctx: &mut LoadContext) -> Result<Arc<dyn ToolHandler>, ConfigIssue> {
    // No settings yet, but the field must still be a JSON object.
    StaticConfig::new(&row.static_config)?;
    Ok(Arc::new(NoteTool {
        memory: ctx.memory.clone(),
        user_id: ctx.user_id.clone(),
        agent_name: ctx.agent_name.clone(),
    }))
}

fn text_arg(args: &Map<String, Value>, name: &str, action: &str) -> Result<String, ToolError> {
    match args.get(name).and_then(Value::as_str) {
        Some(s) => Ok(s.to_string()),
        None => Err(ToolError::InvalidArguments(format!(
            "'{}' is required for action '{}'",
            name, action
        ))),
    }
}

fn parse_edit(action: &str, args: &Map<String, Value>) -> Result<NoteEdit, ToolError> {
    match action {
        "overwrite" => Ok(NoteEdit::Overwrite(text_arg(args, "content", action)?)),
        "append" => Ok(NoteEdit::Append(text_arg(args, "content", action)?)),
        "prepend" => Ok(NoteEdit::Prepend(text_arg(args, "content", action)?)),
        "replace_section" => Ok(NoteEdit::ReplaceSection {
            header: text_arg(args, "header", action)?,
            content: text_arg(args, "content", action)?,
        }),
        "delete_section" => Ok(NoteEdit::DeleteSection {
            header: text_arg(args, "header", action)?,
        }),
        other => Err(ToolError::InvalidArguments(format!(
            "unknown action '{}'",
            other
        ))),
    }
}

#[async_trait]
impl ToolHandler for NoteTool {
    fn base_args(&self) -> Vec<ArgSpec> {
        vec![
            ArgSpec::required(
                "action",
                ArgType::String,
                "One of: read, overwrite, append, prepend, replace_section, delete_section",
            ),
            ArgSpec::optional("content", ArgType::String, "Text to write"),
            ArgSpec::optional(
                "header",
                ArgType::String,
                "Section header for replace_section and delete_section",
            ),
        ]
    }

    async fn call(&self, args: Map<String, Value>) -> Result<String, ToolError> {
        let action = args
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if action == "read" {
            let note = self
                .memory
                .read_note(&self.user_id, &self.agent_name)
                .await
                .map_err(storage_failure)?;
            return Ok(if note.trim().is_empty() {
                EMPTY_NOTE_SENTINEL.to_string()
            } else {
                note
            });
        }

        let edit = parse_edit(&action, &args)?;
        match self
            .memory
            .edit_note(&self.user_id, &self.agent_name, &edit)
            .await
        {
            Ok(NoteChange::Updated(_)) => Ok("Long-term notes updated.".to_string()),
            Ok(NoteChange::Unchanged) => Ok("No change made to long-term notes.".to_string()),
            Err(NoteError::SectionNotFound { header }) => Err(ToolError::Failed(format!(
                "There is no section '{}' in the long-term notes.",
                header
            ))),
            Err(e) => Err(storage_failure(e)),
        }
    }
}

fn storage_failure(err: NoteError) -> ToolError {
    warn!("Long-term note operation failed: {}", err);
    ToolError::Failed("Long-term notes could not be accessed right now.".to_string())
}
