//! Nostr root announcements
//!
//! A tree root is announced as a parameterized replaceable event of kind
//! 30078 signed by the owner:
//!
//! - `d`: tree name
//! - `l`: `hashtree`
//! - `hash`: root hash (hex)
//! - `visibility`: `public`, `link-visible` or `private`
//! - `key`: content key (hex), public trees only
//! - `encryptedKey`, `keyId`, `selfEncryptedLinkKey`: link-visible trees
//! - `selfEncryptedKey`: private trees
//!
//! Older events without a `visibility` tag get their tier from the
//! envelope tags present (see [`infer_visibility`]).
//!
//! `created_at` carries the record's `updated_at`, so relays and the
//! registry order announcements the same way.

use std::sync::Arc;

use async_trait::async_trait;
use hashtree_core::{from_hex, key_from_hex, key_to_hex, Hash, TreeVisibility};
use nostr::nips::nip19::ToBech32;
use nostr::{Alphabet, Event, EventBuilder, Keys, Kind, SingleLetterTag, Tag, TagKind, Timestamp};
use thiserror::Error;
use tracing::debug;

use crate::publisher::{PublishError, RootPublisher};
use crate::record::{KeyEnvelope, RootOptions, TreeKey, TreeRootRecord};
use crate::registry::TreeRootRegistry;

pub const HASHTREE_KIND: u16 = 30078;
pub const HASHTREE_LABEL: &str = "hashtree";

const TAG_HASH: &str = "hash";
const TAG_VISIBILITY: &str = "visibility";
const TAG_KEY: &str = "key";
const TAG_ENCRYPTED_KEY: &str = "encryptedKey";
const TAG_KEY_ID: &str = "keyId";
const TAG_SELF_ENCRYPTED_KEY: &str = "selfEncryptedKey";
const TAG_SELF_ENCRYPTED_LINK_KEY: &str = "selfEncryptedLinkKey";

#[derive(Debug, Error)]
pub enum AnnouncementError {
    #[error("unexpected event kind {0}")]
    WrongKind(u16),
    #[error("not a hashtree root event")]
    NotHashtree,
    #[error("missing {0} tag")]
    MissingTag(&'static str),
    #[error("invalid {tag} tag: {reason}")]
    InvalidTag { tag: &'static str, reason: String },
    #[error("invalid signature: {0}")]
    Signature(String),
    #[error("failed to build event: {0}")]
    Build(String),
    #[error("owner mismatch: {0}")]
    OwnerMismatch(String),
}

fn custom_tag(name: &str, value: String) -> Tag {
    Tag::custom(TagKind::Custom(name.to_string().into()), vec![value])
}

/// Sign a root announcement for `record`. Only the envelope fields that
/// belong to the record's visibility tier are included.
pub fn build_root_event(
    keys: &Keys,
    tree_name: &str,
    record: &TreeRootRecord,
) -> Result<Event, AnnouncementError> {
    let mut tags = vec![
        Tag::identifier(tree_name.to_string()),
        Tag::custom(
            TagKind::SingleLetter(SingleLetterTag::lowercase(Alphabet::L)),
            vec![HASHTREE_LABEL.to_string()],
        ),
        custom_tag(TAG_HASH, hex::encode(record.hash)),
        custom_tag(TAG_VISIBILITY, record.visibility.as_str().to_string()),
    ];

    let envelope = &record.envelope;
    match record.visibility {
        TreeVisibility::Public => {
            if let Some(key) = &record.key {
                tags.push(custom_tag(TAG_KEY, key_to_hex(key)));
            }
        }
        TreeVisibility::LinkVisible => {
            let fields = [
                (TAG_ENCRYPTED_KEY, &envelope.encrypted_key),
                (TAG_KEY_ID, &envelope.key_id),
                (TAG_SELF_ENCRYPTED_LINK_KEY, &envelope.self_encrypted_link_key),
            ];
            for (name, value) in fields {
                if let Some(value) = value {
                    tags.push(custom_tag(name, value.clone()));
                }
            }
        }
        TreeVisibility::Private => {
            if let Some(sealed) = &envelope.self_encrypted_key {
                tags.push(custom_tag(TAG_SELF_ENCRYPTED_KEY, sealed.clone()));
            }
        }
    }

    EventBuilder::new(Kind::Custom(HASHTREE_KIND), "", tags)
        .custom_created_at(Timestamp::from_secs(record.updated_at()))
        .to_event(keys)
        .map_err(|e| AnnouncementError::Build(e.to_string()))
}

/// Decoded root announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootAnnouncement {
    pub key: TreeKey,
    pub hash: Hash,
    pub updated_at: u64,
    pub options: RootOptions,
}

impl RootAnnouncement {
    /// Feed into the registry as a resolver update
    pub fn apply(self, registry: &TreeRootRegistry) -> bool {
        registry.set_from_resolver(&self.key, self.hash, self.updated_at, self.options)
    }
}

fn tag_value<'a>(event: &'a Event, name: &str) -> Option<&'a str> {
    event.tags.iter().find_map(|tag| {
        let values = tag.as_slice();
        if values.first().map(|s| s.as_str()) == Some(name) {
            values.get(1).map(|s| s.as_str())
        } else {
            None
        }
    })
}

fn has_label(event: &Event) -> bool {
    event.tags.iter().any(|tag| {
        let values = tag.as_slice();
        values.first().map(|s| s.as_str()) == Some("l")
            && values.get(1).map(|s| s.as_str()) == Some(HASHTREE_LABEL)
    })
}

/// Verify and decode a root announcement. The owner in the returned key
/// is the author's npub.
pub fn parse_root_event(event: &Event) -> Result<RootAnnouncement, AnnouncementError> {
    if event.kind != Kind::Custom(HASHTREE_KIND) {
        return Err(AnnouncementError::WrongKind(u16::from(event.kind)));
    }
    if !has_label(event) {
        return Err(AnnouncementError::NotHashtree);
    }
    event
        .verify()
        .map_err(|e| AnnouncementError::Signature(e.to_string()))?;

    let tree_name = tag_value(event, "d")
        .filter(|name| !name.is_empty())
        .ok_or(AnnouncementError::MissingTag("d"))?;
    let hash_hex = tag_value(event, TAG_HASH).ok_or(AnnouncementError::MissingTag(TAG_HASH))?;
    let hash = from_hex(hash_hex).map_err(|e| AnnouncementError::InvalidTag {
        tag: TAG_HASH,
        reason: e.to_string(),
    })?;
    let key = tag_value(event, TAG_KEY)
        .map(key_from_hex)
        .transpose()
        .map_err(|e| AnnouncementError::InvalidTag {
            tag: TAG_KEY,
            reason: e.to_string(),
        })?;

    let envelope = KeyEnvelope {
        encrypted_key: tag_value(event, TAG_ENCRYPTED_KEY).map(str::to_string),
        key_id: tag_value(event, TAG_KEY_ID).map(str::to_string),
        self_encrypted_key: tag_value(event, TAG_SELF_ENCRYPTED_KEY).map(str::to_string),
        self_encrypted_link_key: tag_value(event, TAG_SELF_ENCRYPTED_LINK_KEY)
            .map(str::to_string),
    };
    let visibility = match tag_value(event, TAG_VISIBILITY) {
        Some(value) => value
            .parse::<TreeVisibility>()
            .map_err(|reason| AnnouncementError::InvalidTag {
                tag: TAG_VISIBILITY,
                reason,
            })?,
        None => infer_visibility(&envelope),
    };

    let owner = event
        .pubkey
        .to_bech32()
        .map_err(|e| AnnouncementError::InvalidTag {
            tag: "pubkey",
            reason: e.to_string(),
        })?;

    let mut options = RootOptions::new()
        .with_visibility(visibility)
        .with_envelope(envelope);
    options.key = key;

    Ok(RootAnnouncement {
        key: TreeKey::new(owner, tree_name),
        hash,
        updated_at: event.created_at.as_u64(),
        options,
    })
}

/// Tier implied by which envelope tags are present
pub fn infer_visibility(envelope: &KeyEnvelope) -> TreeVisibility {
    if envelope.encrypted_key.is_some()
        || envelope.key_id.is_some()
        || envelope.self_encrypted_link_key.is_some()
    {
        TreeVisibility::LinkVisible
    } else if envelope.self_encrypted_key.is_some() {
        TreeVisibility::Private
    } else {
        TreeVisibility::Public
    }
}

/// Destination for signed events (relay pool, local relay, test capture)
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send_event(&self, event: Event) -> Result<(), PublishError>;
}

/// [`RootPublisher`] that signs announcements with the owner's keys
pub struct NostrRootPublisher {
    keys: Keys,
    npub: String,
    sink: Arc<dyn EventSink>,
}

impl NostrRootPublisher {
    pub fn new(keys: Keys, sink: Arc<dyn EventSink>) -> Result<Self, AnnouncementError> {
        let npub = keys
            .public_key()
            .to_bech32()
            .map_err(|e| AnnouncementError::Build(e.to_string()))?;
        Ok(Self { keys, npub, sink })
    }

    pub fn npub(&self) -> &str {
        &self.npub
    }
}

#[async_trait]
impl RootPublisher for NostrRootPublisher {
    async fn publish(&self, key: &TreeKey, record: &TreeRootRecord) -> Result<bool, PublishError> {
        if key.owner != self.npub {
            return Err(AnnouncementError::OwnerMismatch(key.to_string()).into());
        }
        if !record.is_recoverable() {
            return Err(PublishError::Rejected(format!(
                "{} key for {} cannot be recovered from its envelope",
                record.visibility.as_str(),
                key
            )));
        }
        let event = build_root_event(&self.keys, &key.tree_name, record)?;
        debug!("announcing {} as event {}", key, event.id);
        self.sink.send_event(event).await?;
        Ok(true)
    }
}
