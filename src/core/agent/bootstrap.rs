use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::config::RuntimeConfig;
use crate::core::memory::MemorySystem;
use crate::core::oauth::{CredentialBridge, ProviderRegistry};
use crate::core::vault::SqliteSecretStore;

/// Open the memory store and build the credential bridge over the same
/// database. Providers from the config file are merged over the embedded set.
pub async fn init_core_subsystems(
    data_dir: &Path,
    config: &RuntimeConfig,
) -> Result<(Arc<MemorySystem>, Arc<CredentialBridge>)> {
    let db_path = RuntimeConfig::database_path(data_dir);
    let memory = MemorySystem::open(&db_path, config.memory.clone())
        .await
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

    if config.credentials.master_key.is_none() {
        info!("No master key configured; deriving vault key from machine identity");
    }
    let store = SqliteSecretStore::new(memory.get_db(), config.credentials.master_key.as_deref())?;

    let providers = ProviderRegistry::embedded()
        .context("Embedded provider definitions are invalid")?
        .with_overrides(&config.providers);
    info!(
        providers = providers.ids().count(),
        "Credential providers registered"
    );

    let bridge = CredentialBridge::new(Arc::new(store), providers, config.credentials.clone())?;
    Ok((Arc::new(memory), Arc::new(bridge)))
}
