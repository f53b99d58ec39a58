mod agents;
pub mod notes;
mod schedule;
mod stm;
pub mod types;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::MemoryConfig;
use crate::core::lifecycle::LifecycleComponent;
use crate::platform::{NativePlatform, Platform};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS agents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    agent_name TEXT NOT NULL,
    system_prompt TEXT NOT NULL DEFAULT '',
    enabled INTEGER NOT NULL DEFAULT 1,
    UNIQUE(user_id, agent_name)
);

CREATE TABLE IF NOT EXISTS tool_configs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
    tool_type TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    static_config TEXT NOT NULL DEFAULT '{}',
    runtime_args_schema TEXT NOT NULL DEFAULT '[]',
    sort_order INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_tool_configs_agent ON tool_configs(agent_id, sort_order);

CREATE TABLE IF NOT EXISTS credentials (
    user_id TEXT NOT NULL,
    service_name TEXT NOT NULL,
    access_token_enc TEXT NOT NULL,
    refresh_token_enc TEXT,
    expires_at INTEGER,
    scopes TEXT NOT NULL DEFAULT '',
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (user_id, service_name)
);

CREATE TABLE IF NOT EXISTS short_term_memory (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE(session_id, seq)
);

CREATE TABLE IF NOT EXISTS long_term_notes (
    user_id TEXT NOT NULL,
    agent_name TEXT NOT NULL,
    content TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(user_id, agent_name)
);

CREATE TABLE IF NOT EXISTS schedules (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    agent_name TEXT NOT NULL,
    trigger_spec TEXT NOT NULL,
    prompt TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    last_run_at INTEGER,
    last_status TEXT,
    consecutive_errors INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS scheduled_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    schedule_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    agent_name TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    success INTEGER NOT NULL,
    payload TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_scheduled_results_user ON scheduled_results(user_id, created_at);
";

/// SQLite-backed store for conversation memory and the configuration tables
/// the runtime reads (agents, tool configs, schedules).
///
/// Statements hold the connection lock only while they run. Short-term
/// appends are additionally serialized per session through `session_locks`.
pub struct MemorySystem {
    db: Arc<Mutex<Connection>>,
    config: MemoryConfig,
    session_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MemorySystem {
    pub async fn open<P: AsRef<Path>>(db_path: P, config: MemoryConfig) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            tokio::fs::create_dir_all(parent).await?;
            NativePlatform::restrict_dir_permissions(parent);
        }

        let db = Connection::open(db_path)?;
        NativePlatform::restrict_file_permissions(db_path);
        Self::from_connection(db, config)
    }

    /// In-memory database; used by tests and one-shot tooling.
    pub fn open_in_memory(config: MemoryConfig) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, config)
    }

    fn from_connection(db: Connection, config: MemoryConfig) -> Result<Self> {
        db.execute_batch("PRAGMA foreign_keys = ON;")?;
        db.execute_batch(SCHEMA)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            config,
            session_locks: DashMap::new(),
        })
    }

    /// Shared connection handle, used by the vault so credentials live in the
    /// same database file.
    pub fn get_db(&self) -> Arc<Mutex<Connection>> {
        self.db.clone()
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.session_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the per-session lock once nobody else holds a handle to it.
    fn release_session_lock(&self, session_id: &str) {
        self.session_locks
            .remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[async_trait]
impl LifecycleComponent for MemorySystem {
    async fn on_init(&self) -> Result<()> {
        info!("Memory store initializing...");
        let db = self.db.lock().await;
        db.execute_batch("PRAGMA optimize;")?;
        Ok(())
    }

    async fn on_shutdown(&self) -> Result<()> {
        info!("Memory store shutting down...");
        Ok(())
    }
}

/// In-memory store with default settings for tests.
#[cfg(test)]
pub fn test_memory_system() -> MemorySystem {
    MemorySystem::open_in_memory(MemoryConfig::default()).expect("in-memory memory store")
}
