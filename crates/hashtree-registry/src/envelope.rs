//! Content key envelopes for the three visibility tiers
//!
//! - public: the key is carried in clear (or the tree is unencrypted)
//! - link-visible: `encryptedKey = contentKey XOR linkKey`, `keyId =
//!   SHA256(linkKey)`; the link key travels out of band in the URL
//!   fragment. The owner also keeps the link key sealed to themselves
//!   (`selfEncryptedLinkKey`).
//! - private: `selfEncryptedKey` is the content key sealed to the owner
//!
//! Owner seals are NIP-44 v2 messages from the owner to the owner.
//!
//! The XOR wrap carries no integrity check of its own. A wrong link key
//! yields a wrong content key, which is caught when the root block fails
//! to decrypt; [`verify_unlocked_root`] performs that check.

use hashtree_core::{
    key_from_hex, key_to_hex, Cid, EncryptionKey, Hash, HashTree, HashTreeError, LinkKey, Store,
    TreeVisibility,
};
use nostr::nips::nip44::{self, Version};
use nostr::Keys;
use thiserror::Error;

use crate::record::{KeyEnvelope, RootOptions, TreeRootRecord};

#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Link-visible tree opened without the link key
    #[error("link required")]
    LinkRequired,
    #[error("link key does not match key id")]
    KeyIdMismatch,
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("failed to seal key: {0}")]
    Seal(String),
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("tree error: {0}")]
    Tree(HashTreeError),
}

/// Output of [`seal_tree_key`]
#[derive(Debug, Clone)]
pub struct SealedKey {
    pub visibility: TreeVisibility,
    pub content_key: EncryptionKey,
    /// Link key to put in the share URL (link-visible only)
    pub link_key: Option<LinkKey>,
    pub envelope: KeyEnvelope,
}

impl SealedKey {
    /// Options for a local write of this tree's root. The owner keeps the
    /// decrypted key locally regardless of tier.
    pub fn root_options(&self) -> RootOptions {
        RootOptions::new()
            .with_key(self.content_key)
            .with_visibility(self.visibility)
            .with_envelope(self.envelope.clone())
    }
}

fn self_seal(owner: &Keys, plaintext: &str) -> Result<String, EnvelopeError> {
    nip44::encrypt(owner.secret_key(), &owner.public_key(), plaintext, Version::V2)
        .map_err(|e| EnvelopeError::Seal(e.to_string()))
}

fn self_open(owner: &Keys, payload: &str) -> Result<String, EnvelopeError> {
    nip44::decrypt(owner.secret_key(), &owner.public_key(), payload)
        .map_err(|e| EnvelopeError::AccessDenied(format!("cannot open owner seal: {}", e)))
}

/// Wrap `content_key` for `visibility`. For link-visible trees a fresh
/// link key is generated unless one is given (re-sharing keeps the link).
pub fn seal_tree_key(
    visibility: TreeVisibility,
    content_key: &EncryptionKey,
    owner: &Keys,
    link_key: Option<&LinkKey>,
) -> Result<SealedKey, EnvelopeError> {
    let (link_key, envelope) = match visibility {
        TreeVisibility::Public => (None, KeyEnvelope::default()),
        TreeVisibility::LinkVisible => {
            let link = link_key.copied().unwrap_or_else(LinkKey::generate);
            let envelope = KeyEnvelope {
                encrypted_key: Some(key_to_hex(&link.mask(content_key))),
                key_id: Some(link.key_id()),
                self_encrypted_key: None,
                self_encrypted_link_key: Some(self_seal(owner, &link.to_hex())?),
            };
            (Some(link), envelope)
        }
        TreeVisibility::Private => (
            None,
            KeyEnvelope {
                self_encrypted_key: Some(self_seal(owner, &key_to_hex(content_key))?),
                ..Default::default()
            },
        ),
    };

    Ok(SealedKey {
        visibility,
        content_key: *content_key,
        link_key,
        envelope,
    })
}

/// What a reader holds when opening a tree
#[derive(Default, Clone, Copy)]
pub struct UnlockContext<'a> {
    pub link_key: Option<&'a LinkKey>,
    pub owner: Option<&'a Keys>,
}

impl<'a> UnlockContext<'a> {
    pub fn with_link_key(link_key: &'a LinkKey) -> Self {
        Self {
            link_key: Some(link_key),
            owner: None,
        }
    }

    pub fn as_owner(owner: &'a Keys) -> Self {
        Self {
            link_key: None,
            owner: Some(owner),
        }
    }
}

fn unmask(wrapped_hex: &str, link: &LinkKey) -> Result<EncryptionKey, EnvelopeError> {
    let wrapped =
        key_from_hex(wrapped_hex).map_err(|e| EnvelopeError::InvalidKey(e.to_string()))?;
    Ok(link.mask(&wrapped))
}

/// Recover the content key. `Ok(None)` means the tree is public without a
/// key (unencrypted content).
pub fn unlock_tree_key(
    visibility: TreeVisibility,
    known_key: Option<EncryptionKey>,
    envelope: &KeyEnvelope,
    ctx: UnlockContext<'_>,
) -> Result<Option<EncryptionKey>, EnvelopeError> {
    if known_key.is_some() {
        return Ok(known_key);
    }

    match visibility {
        TreeVisibility::Public => Ok(None),
        TreeVisibility::LinkVisible => {
            let link = match (ctx.link_key, ctx.owner) {
                (Some(link), _) => {
                    if let Some(id) = &envelope.key_id {
                        if *id != link.key_id() {
                            return Err(EnvelopeError::KeyIdMismatch);
                        }
                    }
                    *link
                }
                (None, Some(owner)) => recover_link_key(envelope, owner)?,
                (None, None) => return Err(EnvelopeError::LinkRequired),
            };
            let wrapped = envelope.encrypted_key.as_deref().ok_or_else(|| {
                EnvelopeError::AccessDenied("no wrapped key published".into())
            })?;
            unmask(wrapped, &link).map(Some)
        }
        TreeVisibility::Private => {
            let owner = ctx
                .owner
                .ok_or_else(|| EnvelopeError::AccessDenied("private tree".into()))?;
            let sealed = envelope
                .self_encrypted_key
                .as_deref()
                .ok_or_else(|| EnvelopeError::AccessDenied("no sealed key".into()))?;
            let hex = self_open(owner, sealed)?;
            key_from_hex(&hex)
                .map(Some)
                .map_err(|e| EnvelopeError::InvalidKey(e.to_string()))
        }
    }
}

/// [`unlock_tree_key`] for a stored record
pub fn unlock_record(
    record: &TreeRootRecord,
    ctx: UnlockContext<'_>,
) -> Result<Option<EncryptionKey>, EnvelopeError> {
    unlock_tree_key(record.visibility, record.key, &record.envelope, ctx)
}

/// Owner-side recovery of a link-visible tree's link key, for re-sharing
pub fn recover_link_key(envelope: &KeyEnvelope, owner: &Keys) -> Result<LinkKey, EnvelopeError> {
    let sealed = envelope
        .self_encrypted_link_key
        .as_deref()
        .ok_or_else(|| EnvelopeError::AccessDenied("no sealed link key".into()))?;
    let hex = self_open(owner, sealed)?;
    LinkKey::from_hex(&hex).map_err(|e| EnvelopeError::InvalidKey(e.to_string()))
}

/// Check an unwrapped key against the root block it should decrypt
pub async fn verify_unlocked_root<S: Store>(
    tree: &HashTree<S>,
    hash: Hash,
    key: EncryptionKey,
) -> Result<(), EnvelopeError> {
    match tree.get_block(&Cid::encrypted(hash, key)).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(EnvelopeError::Tree(HashTreeError::MissingBlock(hex::encode(
            hash,
        )))),
        Err(HashTreeError::AccessDenied(reason)) => Err(EnvelopeError::AccessDenied(reason)),
        Err(e) => Err(EnvelopeError::Tree(e)),
    }
}
