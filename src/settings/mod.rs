mod file;
mod in_memory;
mod postgres;

use anyhow::Context;
use async_trait::async_trait;

use crate::types::{ModelConfig, Profile};

pub use file::FileSettingsStore;
pub use in_memory::InMemorySettingsStore;
pub use postgres::PostgresSettingsStore;

/// Flat key-value persistence for user settings.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
}

/// Loads a profile's config, falling back to the built-in default when
/// nothing has been stored yet.
pub async fn load_profile(
    store: &dyn SettingsStore,
    profile: Profile,
) -> anyhow::Result<ModelConfig> {
    let key = profile.storage_key();
    match store.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .with_context(|| format!("stored {key} is not a valid model config")),
        None => Ok(ModelConfig::default_for(profile)),
    }
}

pub async fn save_profile(
    store: &dyn SettingsStore,
    profile: Profile,
    config: &ModelConfig,
) -> anyhow::Result<()> {
    let raw = serde_json::to_string(config)?;
    store.set(profile.storage_key(), &raw).await
}
