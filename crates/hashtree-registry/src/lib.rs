//! Tree root registry for hashtree
//!
//! Keeps the current root CID of each `(owner, tree name)` and reconciles
//! it across local edits, signed Nostr announcements, a background worker
//! mirror and speculative prefetch hints. Local writes are persisted as
//! dirty records and published after a debounce; failed publishes retry
//! until they succeed or the record is replaced.
//!
//! # Example
//!
//! ```rust
//! use hashtree_registry::{
//!     publish_fn, JsonPersistence, MemorySlot, RegistryConfig, RootOptions, TreeKey,
//!     TreeRootRegistry,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = TreeRootRegistry::new(
//!         RegistryConfig::default(),
//!         Arc::new(JsonPersistence::new(MemorySlot::new())),
//!         Arc::new(publish_fn(|_key, _record| async { Ok(true) })),
//!     );
//!
//!     let key = TreeKey::new("npub1example", "photos");
//!     registry.set_local(&key, [7u8; 32], RootOptions::new());
//!     assert!(registry.get(&key).unwrap().is_dirty());
//!
//!     registry.flush_pending_publishes().await;
//!     assert!(!registry.get(&key).unwrap().is_dirty());
//! }
//! ```

pub mod announcement;
pub mod envelope;
pub mod persistence;
pub mod publisher;
pub mod record;
pub mod registry;
pub mod scheduler;
pub mod settings;

#[cfg(test)]
mod testing;

pub use announcement::{
    build_root_event, infer_visibility, parse_root_event, AnnouncementError, EventSink,
    NostrRootPublisher, RootAnnouncement, HASHTREE_KIND, HASHTREE_LABEL,
};
pub use envelope::{
    recover_link_key, seal_tree_key, unlock_record, unlock_tree_key, verify_unlocked_root,
    EnvelopeError, SealedKey, UnlockContext,
};
pub use persistence::{
    FileSlot, JsonPersistence, MemorySlot, PersistenceError, RootPersistence, StorageSlot,
};
pub use publisher::{publish_fn, FnPublisher, PublishError, RootPublisher};
pub use record::{
    ExternalSource, InvalidTreeKey, KeyEnvelope, RecordState, RootOptions, RootSource,
    RootUpdate, TreeKey, TreeRootRecord,
};
pub use registry::{
    RegistryConfig, Subscription, TreeRootRegistry, UpdateStream, DEFAULT_PUBLISH_DEBOUNCE,
    DEFAULT_PUBLISH_RETRY, DEFAULT_RESOLVE_TIMEOUT,
};
pub use settings::{file_persistence, registry_config, tree_config};
