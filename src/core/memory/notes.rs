//! Long-term note: one mutable text document per (user, agent).
//!
//! Edits are applied to the stored text as a pure transformation
//! ([`apply_edit`]) and then upserted. Concurrent writers are last-write-wins.

use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::MemorySystem;
use crate::config::MemoryConfig;

/// Returned by `read` when the note has no content yet.
pub const EMPTY_NOTE_SENTINEL: &str = "(no long-term notes yet)";

/// What a section edit does when its header is not present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingSectionPolicy {
    /// Leave the note untouched and report that nothing changed.
    NoOp,
    /// Fail the edit with [`NoteError::SectionNotFound`].
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoteEdit {
    Overwrite(String),
    Append(String),
    Prepend(String),
    ReplaceSection { header: String, content: String },
    DeleteSection { header: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoteChange {
    Updated(String),
    Unchanged,
}

#[derive(Debug, Error)]
pub enum NoteError {
    #[error("section '{header}' not found in long-term notes")]
    SectionNotFound { header: String },
    #[error("long-term note storage failed: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// Text conventions used when editing a note.
#[derive(Debug, Clone)]
pub struct NoteFormat {
    pub separator: String,
    pub section_marker: String,
    pub missing_section: MissingSectionPolicy,
}

impl From<&MemoryConfig> for NoteFormat {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            separator: config.note_separator.clone(),
            section_marker: config.section_marker.clone(),
            missing_section: config.missing_section,
        }
    }
}

impl Default for NoteFormat {
    fn default() -> Self {
        Self::from(&MemoryConfig::default())
    }
}

/// Byte ranges of one headed section inside the note.
struct SectionSpan<'a> {
    /// Header line including its line ending.
    header: &'a str,
    start: usize,
    body_start: usize,
    end: usize,
}

fn header_key<'a>(text: &'a str, marker: &str) -> &'a str {
    let text = text.trim();
    text.strip_prefix(marker.trim()).unwrap_or(text).trim()
}

fn line_ending(line: &str) -> &str {
    if line.ends_with("\r\n") {
        "\r\n"
    } else if line.ends_with('\n') {
        "\n"
    } else {
        ""
    }
}

/// Headed sections in order. Text before the first header belongs to none.
fn section_spans<'a>(content: &'a str, marker: &str) -> Vec<SectionSpan<'a>> {
    let mut spans: Vec<SectionSpan<'a>> = Vec::new();
    let mut offset = 0;
    for line in content.split_inclusive('\n') {
        if line.starts_with(marker) {
            if let Some(last) = spans.last_mut() {
                last.end = offset;
            }
            spans.push(SectionSpan {
                header: line,
                start: offset,
                body_start: offset + line.len(),
                end: content.len(),
            });
        }
        offset += line.len();
    }
    spans
}

fn edit_section(
    current: &str,
    header: &str,
    replacement: Option<&str>,
    format: &NoteFormat,
) -> Result<NoteChange, NoteError> {
    let wanted = header_key(header, &format.section_marker);
    let spans = section_spans(current, &format.section_marker);

    let Some(index) = spans
        .iter()
        .position(|s| header_key(s.header, &format.section_marker) == wanted)
    else {
        return match format.missing_section {
            MissingSectionPolicy::NoOp => Ok(NoteChange::Unchanged),
            MissingSectionPolicy::Error => Err(NoteError::SectionNotFound {
                header: wanted.to_string(),
            }),
        };
    };
    let span = &spans[index];

    let mut out = String::with_capacity(current.len());
    out.push_str(&current[..span.start]);
    if let Some(content) = replacement {
        let eol = match line_ending(span.header) {
            "" => "\n",
            eol => eol,
        };
        let body = &current[span.body_start..span.end];
        let mut trailing = &body[body.trim_end_matches(['\r', '\n']).len()..];
        if trailing.is_empty() && index + 1 < spans.len() {
            trailing = eol;
        }

        out.push_str(span.header);
        let content = content.trim_end_matches(['\r', '\n']);
        if !content.is_empty() {
            if line_ending(span.header).is_empty() {
                out.push_str(eol);
            }
            out.push_str(content);
        }
        out.push_str(trailing);
    }
    out.push_str(&current[span.end..]);

    Ok(NoteChange::Updated(out))
}

/// Compute the note content after `edit`, without touching storage.
pub fn apply_edit(current: &str, edit: &NoteEdit, format: &NoteFormat) -> Result<NoteChange, NoteError> {
    match edit {
        NoteEdit::Overwrite(content) => Ok(NoteChange::Updated(content.clone())),
        NoteEdit::Append(content) => {
            if current.is_empty() {
                Ok(NoteChange::Updated(content.clone()))
            } else {
                Ok(NoteChange::Updated(format!("{}{}{}", current, format.separator, content)))
            }
        }
        NoteEdit::Prepend(content) => {
            if current.is_empty() {
                Ok(NoteChange::Updated(content.clone()))
            } else {
                Ok(NoteChange::Updated(format!("{}{}{}", content, format.separator, current)))
            }
        }
        NoteEdit::ReplaceSection { header, content } => {
            edit_section(current, header, Some(content), format)
        }
        NoteEdit::DeleteSection { header } => edit_section(current, header, None, format),
    }
}

impl MemorySystem {
    /// Current note content; empty when nothing was ever written.
    pub async fn read_note(&self, user_id: &str, agent_name: &str) -> Result<String, NoteError> {
        let db = self.db.lock().await;
        let content = db
            .query_row(
                "SELECT content FROM long_term_notes WHERE user_id = ?1 AND agent_name = ?2",
                params![user_id, agent_name],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(content.unwrap_or_default())
    }

    /// Apply `edit` and upsert the result. Read and write happen under one
    /// hold of the connection so in-process edits never interleave.
    pub async fn edit_note(
        &self,
        user_id: &str,
        agent_name: &str,
        edit: &NoteEdit,
    ) -> Result<NoteChange, NoteError> {
        let format = NoteFormat::from(&self.config);
        let db = self.db.lock().await;
        let current = db
            .query_row(
                "SELECT content FROM long_term_notes WHERE user_id = ?1 AND agent_name = ?2",
                params![user_id, agent_name],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .unwrap_or_default();

        let change = apply_edit(&current, edit, &format)?;
        if let NoteChange::Updated(ref content) = change {
            db.execute(
                "INSERT INTO long_term_notes (user_id, agent_name, content, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, agent_name) DO UPDATE SET
                    content = excluded.content, updated_at = excluded.updated_at",
                params![user_id, agent_name, content, Utc::now().timestamp_millis()],
            )?;
            debug!(user_id, agent_name, chars = content.len(), "Long-term note updated");
        }
        Ok(change)
    }
}
