use anyhow::Result;
use rusqlite::{OptionalExtension, params};

use super::MemorySystem;
use super::types::{AgentRecord, NewToolConfig, ToolConfigRow};

fn parse_json_column(raw: String) -> serde_json::Value {
    // Unparseable JSON is handed to the tool loader as a string so it can be
    // rejected there with a path, instead of failing the whole query.
    serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw))
}

impl MemorySystem {
    pub async fn get_agent(&self, user_id: &str, agent_name: &str) -> Result<Option<AgentRecord>> {
        let db = self.db.lock().await;
        let agent = db
            .query_row(
                "SELECT id, user_id, agent_name, system_prompt, enabled FROM agents
                 WHERE user_id = ?1 AND agent_name = ?2",
                params![user_id, agent_name],
                |row| {
                    Ok(AgentRecord {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        agent_name: row.get(2)?,
                        system_prompt: row.get(3)?,
                        enabled: row.get::<_, i64>(4)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(agent)
    }

    /// Insert or update an agent row, returning its id.
    pub async fn upsert_agent(
        &self,
        user_id: &str,
        agent_name: &str,
        system_prompt: &str,
    ) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO agents (user_id, agent_name, system_prompt) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id, agent_name) DO UPDATE SET system_prompt = excluded.system_prompt",
            params![user_id, agent_name, system_prompt],
        )?;
        let id = db.query_row(
            "SELECT id FROM agents WHERE user_id = ?1 AND agent_name = ?2",
            params![user_id, agent_name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub async fn set_agent_enabled(&self, agent_id: i64, enabled: bool) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE agents SET enabled = ?1 WHERE id = ?2",
            params![enabled as i64, agent_id],
        )?;
        Ok(rows > 0)
    }

    pub async fn add_tool_config(&self, agent_id: i64, tool: &NewToolConfig) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO tool_configs
                (agent_id, tool_type, name, description, static_config, runtime_args_schema, sort_order)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                agent_id,
                tool.tool_type,
                tool.name,
                tool.description,
                tool.static_config.to_string(),
                tool.runtime_args_schema.to_string(),
                tool.sort_order
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// Tool rows for an agent in configured order.
    pub async fn list_tool_configs(&self, agent_id: i64) -> Result<Vec<ToolConfigRow>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, agent_id, tool_type, name, description, static_config,
                    runtime_args_schema, sort_order
             FROM tool_configs WHERE agent_id = ?1 ORDER BY sort_order ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![agent_id], |row| {
            Ok(ToolConfigRow {
                id: row.get(0)?,
                agent_id: row.get(1)?,
                tool_type: row.get(2)?,
                name: row.get(3)?,
                description: row.get(4)?,
                static_config: parse_json_column(row.get(5)?),
                runtime_args_schema: parse_json_column(row.get(6)?),
                sort_order: row.get(7)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use crate::core::memory::test_memory_system;
    use crate::core::memory::types::NewToolConfig;

    #[tokio::test]
    async fn upsert_agent_is_stable_per_key() {
        let mem = test_memory_system();
        let first = mem.upsert_agent("u1", "helper", "be nice").await.unwrap();
        let second = mem.upsert_agent("u1", "helper", "be terse").await.unwrap();
        assert_eq!(first, second);

        let agent = mem.get_agent("u1", "helper").await.unwrap().unwrap();
        assert_eq!(agent.system_prompt, "be terse");
        assert!(agent.enabled);
        assert!(mem.get_agent("u2", "helper").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tool_configs_come_back_in_sort_order() {
        let mem = test_memory_system();
        let agent = mem.upsert_agent("u1", "helper", "").await.unwrap();
        mem.add_tool_config(agent, &NewToolConfig::new("http_fetch", "second", "").with_order(2))
            .await
            .unwrap();
        mem.add_tool_config(agent, &NewToolConfig::new("http_fetch", "first", "").with_order(1))
            .await
            .unwrap();

        let rows = mem.list_tool_configs(agent).await.unwrap();
        let names: Vec<_> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(rows[0].static_config, serde_json::json!({}));
    }

    #[tokio::test]
    async fn malformed_json_column_is_kept_as_string() {
        let mem = test_memory_system();
        let agent = mem.upsert_agent("u1", "helper", "").await.unwrap();
        {
            let db = mem.get_db();
            let db = db.lock().await;
            db.execute(
                "INSERT INTO tool_configs (agent_id, tool_type, name, runtime_args_schema)
                 VALUES (?1, 'http_fetch', 'broken', '[{not json')",
                rusqlite::params![agent],
            )
            .unwrap();
        }
        let rows = mem.list_tool_configs(agent).await.unwrap();
        assert_eq!(rows[0].runtime_args_schema, serde_json::json!("[{not json"));
    }
}
