//! Tree root records
//!
//! One record per `(owner, tree name)`: the current root hash, its key
//! material and where the value came from. A record is either clean (last
//! value seen from some source) or dirty (a local write not yet confirmed
//! published); the two states carry different data so a clean record can
//! never have a retry pending.

use std::fmt;
use std::str::FromStr;

use hashtree_core::{Cid, EncryptionKey, Hash, TreeVisibility};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid tree key: {0:?}")]
pub struct InvalidTreeKey(pub String);

/// `(owner, tree name)` identifying one tree root
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreeKey {
    pub owner: String,
    pub tree_name: String,
}

impl TreeKey {
    pub fn new(owner: impl Into<String>, tree_name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            tree_name: tree_name.into(),
        }
    }
}

impl fmt::Display for TreeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.tree_name)
    }
}

impl FromStr for TreeKey {
    type Err = InvalidTreeKey;

    /// Splits on the first `/`; tree names may themselves contain slashes
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() => {
                Ok(TreeKey::new(owner, name))
            }
            _ => Err(InvalidTreeKey(s.to_string())),
        }
    }
}

/// Where a root value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RootSource {
    LocalWrite,
    Nostr,
    Worker,
    Prefetch,
    Tauri,
}

impl RootSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RootSource::LocalWrite => "local-write",
            RootSource::Nostr => "nostr",
            RootSource::Worker => "worker",
            RootSource::Prefetch => "prefetch",
            RootSource::Tauri => "tauri",
        }
    }
}

impl fmt::Display for RootSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowest-priority speculative sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternalSource {
    Prefetch,
    Tauri,
}

impl From<ExternalSource> for RootSource {
    fn from(source: ExternalSource) -> Self {
        match source {
            ExternalSource::Prefetch => RootSource::Prefetch,
            ExternalSource::Tauri => RootSource::Tauri,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Last value accepted from `source`
    Clean { source: RootSource, updated_at: u64 },
    /// Local write waiting for a successful publish
    Dirty { pending_since: u64, retry_count: u32 },
}

/// Wrapped forms of a tree's content key. Field names match the tags of the
/// root announcement and the persisted JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyEnvelope {
    /// Content key XOR link key (hex)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_key: Option<String>,
    /// Hex SHA256 of the link key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    /// Content key sealed to the owner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_encrypted_key: Option<String>,
    /// Link key sealed to the owner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_encrypted_link_key: Option<String>,
}

impl KeyEnvelope {
    pub fn is_empty(&self) -> bool {
        self.encrypted_key.is_none()
            && self.key_id.is_none()
            && self.self_encrypted_key.is_none()
            && self.self_encrypted_link_key.is_none()
    }

    /// Whether the content key can ever be recovered under `visibility`
    pub fn is_recoverable(&self, visibility: TreeVisibility) -> bool {
        match visibility {
            TreeVisibility::Public => true,
            TreeVisibility::LinkVisible => {
                (self.encrypted_key.is_some() && self.key_id.is_some())
                    || self.self_encrypted_link_key.is_some()
            }
            TreeVisibility::Private => self.self_encrypted_key.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeRootRecord {
    pub hash: Hash,
    /// Decrypted content key, when known
    pub key: Option<EncryptionKey>,
    pub visibility: TreeVisibility,
    pub envelope: KeyEnvelope,
    pub state: RecordState,
}

impl TreeRootRecord {
    pub fn cid(&self) -> Cid {
        Cid {
            hash: self.hash,
            key: self.key,
        }
    }

    pub fn updated_at(&self) -> u64 {
        match self.state {
            RecordState::Clean { updated_at, .. } => updated_at,
            RecordState::Dirty { pending_since, .. } => pending_since,
        }
    }

    pub fn source(&self) -> RootSource {
        match self.state {
            RecordState::Clean { source, .. } => source,
            RecordState::Dirty { .. } => RootSource::LocalWrite,
        }
    }

    pub fn is_dirty(&self) -> bool {
        matches!(self.state, RecordState::Dirty { .. })
    }

    pub fn retry_count(&self) -> u32 {
        match self.state {
            RecordState::Dirty { retry_count, .. } => retry_count,
            RecordState::Clean { .. } => 0,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.envelope.is_recoverable(self.visibility)
    }
}

/// Optional fields for a root write. Anything left `None` is inherited
/// from the existing record (see [`RootOptions::resolve`]).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootOptions {
    pub key: Option<EncryptionKey>,
    pub visibility: Option<TreeVisibility>,
    pub encrypted_key: Option<String>,
    pub key_id: Option<String>,
    pub self_encrypted_key: Option<String>,
    pub self_encrypted_link_key: Option<String>,
}

impl RootOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: EncryptionKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_visibility(mut self, visibility: TreeVisibility) -> Self {
        self.visibility = Some(visibility);
        self
    }

    /// Set every envelope field present in `envelope`
    pub fn with_envelope(mut self, envelope: KeyEnvelope) -> Self {
        if envelope.encrypted_key.is_some() {
            self.encrypted_key = envelope.encrypted_key;
        }
        if envelope.key_id.is_some() {
            self.key_id = envelope.key_id;
        }
        if envelope.self_encrypted_key.is_some() {
            self.self_encrypted_key = envelope.self_encrypted_key;
        }
        if envelope.self_encrypted_link_key.is_some() {
            self.self_encrypted_link_key = envelope.self_encrypted_link_key;
        }
        self
    }

    /// Fill omitted fields from `prev`.
    ///
    /// - `visibility` always inherits when omitted.
    /// - An explicit change of visibility inherits nothing else.
    /// - `key_id` and `self_encrypted_link_key` belong to the tree's link
    ///   and survive root changes.
    /// - `key`, `encrypted_key` and `self_encrypted_key` belong to one root
    ///   and only survive while the hash is unchanged.
    pub(crate) fn resolve(
        self,
        prev: Option<&TreeRootRecord>,
        hash: &Hash,
    ) -> (Option<EncryptionKey>, TreeVisibility, KeyEnvelope) {
        let Some(prev) = prev else {
            return (
                self.key,
                self.visibility.unwrap_or_default(),
                KeyEnvelope {
                    encrypted_key: self.encrypted_key,
                    key_id: self.key_id,
                    self_encrypted_key: self.self_encrypted_key,
                    self_encrypted_link_key: self.self_encrypted_link_key,
                },
            );
        };

        let visibility = self.visibility.unwrap_or(prev.visibility);
        let same_tier = visibility == prev.visibility;
        let same_root = same_tier && prev.hash == *hash;

        let per_tree = |own: Option<String>, old: &Option<String>| {
            own.or_else(|| same_tier.then(|| old.clone()).flatten())
        };
        let per_root = |own: Option<String>, old: &Option<String>| {
            own.or_else(|| same_root.then(|| old.clone()).flatten())
        };

        let key = self.key.or(if same_root { prev.key } else { None });
        let envelope = KeyEnvelope {
            encrypted_key: per_root(self.encrypted_key, &prev.envelope.encrypted_key),
            key_id: per_tree(self.key_id, &prev.envelope.key_id),
            self_encrypted_key: per_root(
                self.self_encrypted_key,
                &prev.envelope.self_encrypted_key,
            ),
            self_encrypted_link_key: per_tree(
                self.self_encrypted_link_key,
                &prev.envelope.self_encrypted_link_key,
            ),
        };

        (key, visibility, envelope)
    }
}

/// Change notification. `record` is `None` after a delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootUpdate {
    pub key: TreeKey,
    pub record: Option<TreeRootRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link_visible_record() -> TreeRootRecord {
        TreeRootRecord {
            hash: [1u8; 32],
            key: Some([2u8; 32]),
            visibility: TreeVisibility::LinkVisible,
            envelope: KeyEnvelope {
                encrypted_key: Some("k1".into()),
                key_id: Some("id".into()),
                self_encrypted_key: None,
                self_encrypted_link_key: Some("sealed-link".into()),
            },
            state: RecordState::Clean {
                source: RootSource::Nostr,
                updated_at: 100,
            },
        }
    }

    #[test]
    fn test_tree_key_display_and_parse() {
        let key = TreeKey::new("npub1abc", "photos/2024");
        assert_eq!(key.to_string(), "npub1abc/photos/2024");
        assert_eq!("npub1abc/photos/2024".parse::<TreeKey>().unwrap(), key);
        assert!("no-slash".parse::<TreeKey>().is_err());
        assert!("/name".parse::<TreeKey>().is_err());
        assert!("owner/".parse::<TreeKey>().is_err());
    }

    #[test]
    fn test_source_serde_names() {
        assert_eq!(
            serde_json::to_string(&RootSource::LocalWrite).unwrap(),
            "\"local-write\""
        );
        let parsed: RootSource = serde_json::from_str("\"tauri\"").unwrap();
        assert_eq!(parsed, RootSource::Tauri);
        assert_eq!(RootSource::from(ExternalSource::Prefetch), RootSource::Prefetch);
    }

    #[test]
    fn test_recoverability_per_tier() {
        let mut envelope = KeyEnvelope::default();
        assert!(envelope.is_recoverable(TreeVisibility::Public));
        assert!(!envelope.is_recoverable(TreeVisibility::LinkVisible));
        assert!(!envelope.is_recoverable(TreeVisibility::Private));

        envelope.encrypted_key = Some("x".into());
        assert!(!envelope.is_recoverable(TreeVisibility::LinkVisible));
        envelope.key_id = Some("id".into());
        assert!(envelope.is_recoverable(TreeVisibility::LinkVisible));

        let owner_only = KeyEnvelope {
            self_encrypted_link_key: Some("s".into()),
            ..Default::default()
        };
        assert!(owner_only.is_recoverable(TreeVisibility::LinkVisible));
        assert!(!owner_only.is_recoverable(TreeVisibility::Private));
    }

    #[test]
    fn test_state_accessors() {
        let mut record = link_visible_record();
        assert_eq!(record.updated_at(), 100);
        assert_eq!(record.source(), RootSource::Nostr);
        assert!(!record.is_dirty());

        record.state = RecordState::Dirty {
            pending_since: 200,
            retry_count: 3,
        };
        assert_eq!(record.updated_at(), 200);
        assert_eq!(record.source(), RootSource::LocalWrite);
        assert_eq!(record.retry_count(), 3);
    }

    #[test]
    fn test_omitted_visibility_is_inherited() {
        let prev = link_visible_record();
        let (key, visibility, envelope) = RootOptions::new().resolve(Some(&prev), &[9u8; 32]);
        assert_eq!(visibility, TreeVisibility::LinkVisible);
        // new root: per-root material dropped, per-tree kept
        assert_eq!(key, None);
        assert_eq!(envelope.encrypted_key, None);
        assert_eq!(envelope.key_id.as_deref(), Some("id"));
        assert_eq!(envelope.self_encrypted_link_key.as_deref(), Some("sealed-link"));
    }

    #[test]
    fn test_same_hash_keeps_key_material() {
        let prev = link_visible_record();
        let (key, _, envelope) = RootOptions::new().resolve(Some(&prev), &prev.hash);
        assert_eq!(key, prev.key);
        assert_eq!(envelope, prev.envelope);
    }

    #[test]
    fn test_explicit_visibility_change_inherits_nothing() {
        let prev = link_visible_record();
        let (key, visibility, envelope) = RootOptions::new()
            .with_visibility(TreeVisibility::Public)
            .resolve(Some(&prev), &prev.hash);
        assert_eq!(visibility, TreeVisibility::Public);
        assert_eq!(key, None);
        assert!(envelope.is_empty());
    }

    #[test]
    fn test_no_previous_record_defaults_public() {
        let (key, visibility, envelope) = RootOptions::new()
            .with_key([5u8; 32])
            .resolve(None, &[1u8; 32]);
        assert_eq!(key, Some([5u8; 32]));
        assert_eq!(visibility, TreeVisibility::Public);
        assert!(envelope.is_empty());
    }
}
