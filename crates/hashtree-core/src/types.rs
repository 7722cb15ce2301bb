//! Core hashtree types: hashes, CIDs, links and tree nodes

use std::fmt;
use std::hash::{Hash as StdHash, Hasher};
use std::str::FromStr;

use thiserror::Error;

use crate::crypto::{key_from_hex, key_to_hex, EncryptionKey};

/// 32-byte SHA256 digest
pub type Hash = [u8; 32];

pub fn to_hex(hash: &Hash) -> String {
    hex::encode(hash)
}

pub fn from_hex(s: &str) -> Result<Hash, hex::FromHexError> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(s.trim(), &mut out)?;
    Ok(out)
}

pub fn hash_equals(a: &Hash, b: &Hash) -> bool {
    a == b
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CidParseError {
    #[error("invalid hash: {0}")]
    Hash(String),
    #[error("invalid key: {0}")]
    Key(String),
}

/// Content identifier: hash plus optional decryption key.
///
/// Identity is the hash alone; the key only decides whether the holder can
/// read the referenced content.
#[derive(Debug, Clone, Copy)]
pub struct Cid {
    pub hash: Hash,
    pub key: Option<EncryptionKey>,
}

impl Cid {
    pub fn public(hash: Hash) -> Self {
        Self { hash, key: None }
    }

    pub fn encrypted(hash: Hash, key: EncryptionKey) -> Self {
        Self {
            hash,
            key: Some(key),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    /// Same content, key attached
    pub fn with_key(mut self, key: Option<EncryptionKey>) -> Self {
        self.key = key;
        self
    }

    /// Parse `hash` or `hash:key` (hex)
    pub fn parse(s: &str) -> Result<Self, CidParseError> {
        let (hash_part, key_part) = match s.split_once(':') {
            Some((h, k)) => (h, Some(k)),
            None => (s, None),
        };
        let hash = from_hex(hash_part).map_err(|e| CidParseError::Hash(e.to_string()))?;
        let key = key_part
            .map(|k| key_from_hex(k).map_err(|e| CidParseError::Key(e.to_string())))
            .transpose()?;
        Ok(Self { hash, key })
    }
}

impl PartialEq for Cid {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Cid {}

impl StdHash for Cid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{}:{}", to_hex(&self.hash), key_to_hex(key)),
            None => write!(f, "{}", to_hex(&self.hash)),
        }
    }
}

impl FromStr for Cid {
    type Err = CidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cid::parse(s)
    }
}

/// What a link points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LinkType {
    /// Raw bytes, a single chunk
    Blob = 0,
    /// Chunked file node
    File = 1,
    /// Directory node
    Dir = 2,
}

impl LinkType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(LinkType::Blob),
            1 => Some(LinkType::File),
            2 => Some(LinkType::Dir),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_file(self) -> bool {
        matches!(self, LinkType::Blob | LinkType::File)
    }
}

/// A link from a tree node to a child.
///
/// `size` is always the plaintext size of everything under the link.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub name: Option<String>,
    pub hash: Hash,
    pub key: Option<EncryptionKey>,
    pub size: u64,
    pub link_type: LinkType,
    pub meta: Option<serde_json::Value>,
}

impl Link {
    /// Unnamed chunk link inside a file node
    pub fn chunk(cid: &Cid, size: u64, link_type: LinkType) -> Self {
        Self {
            name: None,
            hash: cid.hash,
            key: cid.key,
            size,
            link_type,
            meta: None,
        }
    }

    pub fn cid(&self) -> Cid {
        Cid {
            hash: self.hash,
            key: self.key,
        }
    }
}

/// Tree node: either a directory (named links) or a chunked file (ordered
/// unnamed links).
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub node_type: LinkType,
    pub links: Vec<Link>,
}

impl TreeNode {
    pub fn directory(links: Vec<Link>) -> Self {
        Self {
            node_type: LinkType::Dir,
            links,
        }
    }

    pub fn file(links: Vec<Link>) -> Self {
        Self {
            node_type: LinkType::File,
            links,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.node_type == LinkType::Dir
    }

    /// Sum of link sizes, `None` if it does not fit in a `u64`
    pub fn total_size(&self) -> Option<u64> {
        self.links
            .iter()
            .try_fold(0u64, |total, link| total.checked_add(link.size))
    }

    pub fn find(&self, name: &str) -> Option<&Link> {
        self.links.iter().find(|l| l.name.as_deref() == Some(name))
    }

    /// Keep directory links sorted by name so equal entry sets encode equally
    pub(crate) fn sort_links(&mut self) {
        self.links.sort_by(|a, b| a.name.cmp(&b.name));
    }
}

/// Input entry for building a directory
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub hash: Hash,
    pub key: Option<EncryptionKey>,
    pub size: u64,
    pub link_type: LinkType,
    pub meta: Option<serde_json::Value>,
}

impl DirEntry {
    pub fn from_cid(name: impl Into<String>, cid: &Cid) -> Self {
        Self {
            name: name.into(),
            hash: cid.hash,
            key: cid.key,
            size: 0,
            link_type: LinkType::Blob,
            meta: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_link_type(mut self, link_type: LinkType) -> Self {
        self.link_type = link_type;
        self
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub(crate) fn into_link(self) -> Link {
        Link {
            name: Some(self.name),
            hash: self.hash,
            key: self.key,
            size: self.size,
            link_type: self.link_type,
            meta: self.meta,
        }
    }
}

/// Directory listing entry
#[derive(Debug, Clone, PartialEq)]
pub struct TreeEntry {
    pub name: String,
    pub hash: Hash,
    pub key: Option<EncryptionKey>,
    pub size: u64,
    pub link_type: LinkType,
    pub meta: Option<serde_json::Value>,
}

impl TreeEntry {
    pub fn cid(&self) -> Cid {
        Cid {
            hash: self.hash,
            key: self.key,
        }
    }
}

impl From<&Link> for TreeEntry {
    fn from(link: &Link) -> Self {
        Self {
            name: link.name.clone().unwrap_or_default(),
            hash: link.hash,
            key: link.key,
            size: link.size,
            link_type: link.link_type,
            meta: link.meta.clone(),
        }
    }
}

/// Result of a path lookup
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEntry {
    pub cid: Cid,
    pub link_type: LinkType,
    pub size: u64,
    pub meta: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cid_equality_ignores_key() {
        let a = Cid::public([1u8; 32]);
        let b = Cid::encrypted([1u8; 32], [9u8; 32]);
        assert_eq!(a, b);
        assert_ne!(a, Cid::public([2u8; 32]));
    }

    #[test]
    fn test_cid_parse_display() {
        let cid = Cid::encrypted([0xab; 32], [0xcd; 32]);
        let text = cid.to_string();
        assert!(text.contains(':'));
        let parsed: Cid = text.parse().unwrap();
        assert_eq!(parsed.hash, cid.hash);
        assert_eq!(parsed.key, cid.key);

        let public = Cid::parse(&to_hex(&[0x11; 32])).unwrap();
        assert!(!public.is_encrypted());
        assert!(matches!(Cid::parse("zz"), Err(CidParseError::Hash(_))));
        assert!(matches!(
            Cid::parse(&format!("{}:00", to_hex(&[0x11; 32]))),
            Err(CidParseError::Key(_))
        ));
    }

    #[test]
    fn test_link_type_roundtrip() {
        for t in [LinkType::Blob, LinkType::File, LinkType::Dir] {
            assert_eq!(LinkType::from_u8(t.as_u8()), Some(t));
        }
        assert_eq!(LinkType::from_u8(9), None);
    }
}
