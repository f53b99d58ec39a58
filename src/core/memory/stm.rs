use anyhow::{Result, anyhow};
use chrono::Utc;
use rusqlite::{Connection, ErrorCode, params};
use tracing::{debug, warn};

use super::MemorySystem;
use super::types::{StmEntry, from_millis};

const TRUNCATION_SUFFIX: &str = "... [truncated]";
const MAX_APPEND_ATTEMPTS: usize = 2;

fn truncate_content(content: &str, max_chars: usize) -> String {
    if content.chars().count() > max_chars {
        let kept: String = content.chars().take(max_chars).collect();
        format!("{}{}", kept, TRUNCATION_SUFFIX)
    } else {
        content.to_string()
    }
}

impl MemorySystem {
    /// Append one entry to a session's short-term window. Appends to the same
    /// session are serialized; other sessions are not blocked.
    pub async fn append(&self, session_id: &str, role: &str, content: &str) -> Result<StmEntry> {
        let lock = self.session_lock(session_id);
        let result = {
            let _writer = lock.lock().await;
            let db = self.db.lock().await;
            self.insert_entry(&db, session_id, role, content)
        };
        drop(lock);
        self.release_session_lock(session_id);
        result
    }

    /// Append a user input and the assistant reply as one uninterrupted pair.
    /// Both rows are written in one transaction; on failure neither is kept.
    pub async fn append_turn(
        &self,
        session_id: &str,
        user_content: &str,
        assistant_content: &str,
    ) -> Result<Vec<StmEntry>> {
        let lock = self.session_lock(session_id);
        let result = {
            let _writer = lock.lock().await;
            let db = self.db.lock().await;
            db.unchecked_transaction()
                .map_err(anyhow::Error::from)
                .and_then(|tx| {
                    let user = self.insert_entry(&tx, session_id, "user", user_content)?;
                    let assistant =
                        self.insert_entry(&tx, session_id, "assistant", assistant_content)?;
                    tx.commit()?;
                    Ok(vec![user, assistant])
                })
        };
        drop(lock);
        self.release_session_lock(session_id);
        result
    }

    /// The most recent `window_size` entries of a session, oldest first.
    pub async fn read_window(&self, session_id: &str) -> Result<Vec<StmEntry>> {
        let limit = self.config.window_size.max(1) as i64;
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT seq, role, content, created_at FROM (
                SELECT seq, role, content, created_at FROM short_term_memory
                WHERE session_id = ?1 ORDER BY seq DESC LIMIT ?2
             ) ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![session_id, limit], |row| {
            Ok(StmEntry {
                seq: row.get(0)?,
                role: row.get(1)?,
                content: row.get(2)?,
                created_at: from_millis(row.get(3)?),
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    fn insert_entry(
        &self,
        db: &Connection,
        session_id: &str,
        role: &str,
        content: &str,
    ) -> Result<StmEntry> {
        let stored_content = truncate_content(content, self.config.stm_content_max_chars);
        let created_at = Utc::now();

        for attempt in 1..=MAX_APPEND_ATTEMPTS {
            let seq: i64 = db.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM short_term_memory WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )?;

            match db.execute(
                "INSERT INTO short_term_memory (session_id, seq, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![session_id, seq, role, stored_content, created_at.timestamp_millis()],
            ) {
                Ok(_) => {
                    let cutoff = seq - self.config.window_size.max(1) as i64;
                    let pruned = db.execute(
                        "DELETE FROM short_term_memory WHERE session_id = ?1 AND seq <= ?2",
                        params![session_id, cutoff],
                    )?;
                    if pruned > 0 {
                        debug!(session_id, pruned, "Pruned short-term entries beyond window");
                    }
                    return Ok(StmEntry {
                        seq,
                        role: role.to_string(),
                        content: stored_content,
                        created_at,
                    });
                }
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    warn!(
                        session_id,
                        seq, attempt, "Short-term append raced another writer; last write wins"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(anyhow!(
            "Short-term append for session {} kept conflicting after {} attempts",
            session_id,
            MAX_APPEND_ATTEMPTS
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::core::memory::test_memory_system;
    use std::sync::Arc;

    fn memory_with_window(window_size: usize) -> MemorySystem {
        MemorySystem::open_in_memory(MemoryConfig {
            window_size,
            ..MemoryConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn window_keeps_newest_entries_in_order() {
        let mem = memory_with_window(10);
        for i in 0..15 {
            mem.append("s1", "user", &format!("msg {}", i)).await.unwrap();
        }

        let window = mem.read_window("s1").await.unwrap();
        assert_eq!(window.len(), 10);
        let contents: Vec<_> = window.iter().map(|e| e.content.as_str()).collect();
        let expected: Vec<String> = (5..15).map(|i| format!("msg {}", i)).collect();
        assert_eq!(contents, expected);
        assert!(window.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[tokio::test]
    async fn failed_turn_leaves_no_half_pair() {
        let mem = test_memory_system();
        mem.append_turn("s1", "hello", "hi").await.unwrap();
        {
            let db = mem.get_db();
            db.lock()
                .await
                .execute_batch(
                    "CREATE TEMP TRIGGER refuse_assistant BEFORE INSERT ON short_term_memory
                     WHEN NEW.role = 'assistant'
                     BEGIN SELECT RAISE(ABORT, 'refused'); END;",
                )
                .unwrap();
        }

        assert!(mem.append_turn("s1", "again", "never stored").await.is_err());

        let window = mem.read_window("s1").await.unwrap();
        let contents: Vec<_> = window.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["hello", "hi"]);
    }

    #[tokio::test]
    async fn pruning_bounds_stored_rows() {
        let mem = memory_with_window(3);
        for i in 0..8 {
            mem.append("s1", "user", &format!("m{}", i)).await.unwrap();
        }
        let db = mem.get_db();
        let db = db.lock().await;
        let stored: i64 = db
            .query_row(
                "SELECT COUNT(*) FROM short_term_memory WHERE session_id = 's1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(stored, 3);
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let mem = test_memory_system();
        mem.append("a", "user", "for a").await.unwrap();
        mem.append("b", "user", "for b").await.unwrap();
        mem.append("a", "assistant", "reply a").await.unwrap();

        let a = mem.read_window("a").await.unwrap();
        let b = mem.read_window("b").await.unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].content, "for b");
        assert_eq!(b[0].seq, 1);
    }

    #[tokio::test]
    async fn unknown_session_reads_empty() {
        let mem = test_memory_system();
        assert!(mem.read_window("ghost").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn long_content_is_truncated() {
        let mem = MemorySystem::open_in_memory(MemoryConfig {
            stm_content_max_chars: 100,
            ..MemoryConfig::default()
        })
        .unwrap();
        let entry = mem.append("s", "tool", &"é".repeat(300)).await.unwrap();
        assert!(entry.content.ends_with(TRUNCATION_SUFFIX));
        assert_eq!(entry.content.chars().count(), 100 + TRUNCATION_SUFFIX.len());
    }

    #[tokio::test]
    async fn concurrent_appends_to_one_session_get_distinct_sequence_numbers() {
        let mem = Arc::new(test_memory_system());
        let mut handles = Vec::new();
        for i in 0..20 {
            let mem = mem.clone();
            handles.push(tokio::spawn(async move {
                mem.append("shared", "user", &format!("m{}", i)).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let window = mem.read_window("shared").await.unwrap();
        let seqs: Vec<i64> = window.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn append_turn_writes_user_then_assistant() {
        let mem = test_memory_system();
        let entries = mem.append_turn("s", "hi", "hello!").await.unwrap();
        assert_eq!(entries.len(), 2);

        let window = mem.read_window("s").await.unwrap();
        assert_eq!(window[0].role, "user");
        assert_eq!(window[0].content, "hi");
        assert_eq!(window[1].role, "assistant");
        assert_eq!(window[1].seq, window[0].seq + 1);
    }
}
