//! Runtime configuration.
//!
//! Loaded from `<data_dir>/config.toml`. Every field has a default, so an
//! absent file (or an empty one) yields a working configuration.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::memory::notes::MissingSectionPolicy;
use crate::core::oauth::ProviderDef;
use crate::core::scheduler::CatchUpPolicy;

pub const CONFIG_FILE_NAME: &str = "config.toml";
const MASTER_KEY_ENV: &str = "CONDUCTOR_MASTER_KEY";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub cache: CacheConfig,
    pub memory: MemoryConfig,
    pub scheduler: SchedulerConfig,
    pub credentials: CredentialConfig,
    pub engine: EngineConfig,
    /// Extra or overriding OAuth provider definitions, merged over the
    /// embedded registry by id.
    pub providers: Vec<ProviderDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub idle_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub build_timeout_secs: u64,
    pub acquire_timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: 30 * 60,
            sweep_interval_secs: 60,
            build_timeout_secs: 30,
            acquire_timeout_secs: 45,
        }
    }
}

impl CacheConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Number of short-term entries kept (and returned) per session.
    pub window_size: usize,
    pub stm_content_max_chars: usize,
    pub note_separator: String,
    /// Line prefix that opens a section in the long-term note.
    pub section_marker: String,
    pub missing_section: MissingSectionPolicy,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            window_size: 50,
            stm_content_max_chars: 4000,
            note_separator: "\n\n".to_string(),
            section_marker: "## ".to_string(),
            missing_section: MissingSectionPolicy::Error,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
    pub job_timeout_secs: u64,
    /// A due window older than this is considered missed (e.g. downtime).
    pub misfire_grace_secs: u64,
    pub catch_up: CatchUpPolicy,
    pub max_consecutive_errors: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            job_timeout_secs: 300,
            misfire_grace_secs: 120,
            catch_up: CatchUpPolicy::Skip,
            max_consecutive_errors: 5,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// Effective misfire grace. Never shorter than one tick, so a window
    /// caught late in a regular tick still counts as on time.
    pub fn misfire_grace(&self) -> chrono::Duration {
        let secs = self.misfire_grace_secs.max(self.tick_interval().as_secs());
        chrono::Duration::seconds(secs.min(u64::from(u32::MAX)) as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Secret the vault key is derived from. Falls back to machine identity.
    pub master_key: Option<String>,
    /// Tokens expiring within this window are refreshed before use.
    pub refresh_skew_secs: i64,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            master_key: None,
            refresh_skew_secs: 60,
            request_timeout_secs: 15,
            max_attempts: 3,
            backoff_base_ms: 250,
        }
    }
}

impl CredentialConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of the execution engine service. Required for `serve`/`run`.
    pub endpoint: Option<String>,
    pub request_timeout_secs: u64,
    pub max_tool_rounds: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            request_timeout_secs: 120,
            max_tool_rounds: 8,
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl RuntimeConfig {
    /// Load `config.toml` from `data_dir`, then apply environment overrides.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE_NAME);
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Self::from_toml(&raw).with_context(|| format!("Invalid config at {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(key) = std::env::var(MASTER_KEY_ENV)
            && !key.trim().is_empty()
        {
            config.credentials.master_key = Some(key);
        }
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn database_path(data_dir: &Path) -> PathBuf {
        data_dir.join("conductor.db")
    }
}
