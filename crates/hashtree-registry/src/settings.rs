//! Build registry and tree components from `hashtree-config`

use std::sync::Arc;

use hashtree_config::Config;
use hashtree_core::{HashTreeConfig, Store};

use crate::persistence::{FileSlot, JsonPersistence};
use crate::registry::RegistryConfig;

/// Publish and resolve timings from the config file (and its env overrides)
pub fn registry_config(config: &Config) -> RegistryConfig {
    RegistryConfig::default()
        .with_publish_debounce(config.registry.publish_debounce())
        .with_publish_retry(config.registry.publish_retry())
        .with_resolve_timeout(config.registry.resolve_timeout())
}

pub fn tree_config<S: Store>(config: &Config, store: Arc<S>) -> HashTreeConfig<S> {
    HashTreeConfig::new(store)
        .with_encryption(config.tree.encrypted)
        .with_chunk_size(config.tree.chunk_size)
        .with_fetch_timeout(config.tree.fetch_timeout())
}

/// Root records persisted to `<data_dir>/<roots_file>`
pub fn file_persistence(config: &Config) -> JsonPersistence<FileSlot> {
    JsonPersistence::new(FileSlot::new(config.roots_path()))
}
