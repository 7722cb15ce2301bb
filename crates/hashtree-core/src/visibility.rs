//! Tree visibility tiers and link-key helpers

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::{generate_key, key_from_hex, key_to_hex, CryptoError, EncryptionKey};
use crate::hash::sha256;

/// Who can recover a tree's content key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TreeVisibility {
    /// Key published in clear (or content unencrypted)
    #[default]
    Public,
    /// Key wrapped with a link key shared out of band
    LinkVisible,
    /// Key sealed to the owner only
    Private,
}

impl TreeVisibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            TreeVisibility::Public => "public",
            TreeVisibility::LinkVisible => "link-visible",
            TreeVisibility::Private => "private",
        }
    }
}

impl fmt::Display for TreeVisibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TreeVisibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "public" => Ok(TreeVisibility::Public),
            "link-visible" | "link_visible" | "linkvisible" | "unlisted" => {
                Ok(TreeVisibility::LinkVisible)
            }
            "private" => Ok(TreeVisibility::Private),
            _ => Err(format!("invalid visibility: {}", s)),
        }
    }
}

impl Serialize for TreeVisibility {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TreeVisibility {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// XOR two 32-byte keys (used for link-visible key masking)
pub fn xor_keys(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Out-of-band secret for link-visible trees. Travels in the URL fragment,
/// never in published events.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LinkKey([u8; 32]);

impl LinkKey {
    pub fn generate() -> Self {
        Self(generate_key())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        key_from_hex(s).map(Self)
    }

    pub fn to_hex(&self) -> String {
        key_to_hex(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Public lookup id: hex SHA256 of the link key
    pub fn key_id(&self) -> String {
        hex::encode(sha256(&self.0))
    }

    /// Mask (or unmask) a content key
    pub fn mask(&self, content_key: &EncryptionKey) -> EncryptionKey {
        xor_keys(content_key, &self.0)
    }

    /// Read the `k` parameter from a URL fragment such as `#k=<hex>`
    pub fn from_fragment(fragment: &str) -> Option<Self> {
        fragment
            .trim_start_matches('#')
            .split('&')
            .find_map(|pair| pair.strip_prefix("k="))
            .and_then(|value| Self::from_hex(value).ok())
    }

    pub fn to_fragment(&self) -> String {
        format!("k={}", self.to_hex())
    }
}

impl fmt::Debug for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LinkKey").field(&"<redacted>").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visibility_parse() {
        assert_eq!(TreeVisibility::from_str("public").unwrap(), TreeVisibility::Public);
        assert_eq!(TreeVisibility::from_str("link-visible").unwrap(), TreeVisibility::LinkVisible);
        assert_eq!(TreeVisibility::from_str("link_visible").unwrap(), TreeVisibility::LinkVisible);
        assert_eq!(TreeVisibility::from_str("private").unwrap(), TreeVisibility::Private);
        assert!(TreeVisibility::from_str("unknown").is_err());
    }

    #[test]
    fn test_visibility_serde_uses_kebab_names() {
        let json = serde_json::to_string(&TreeVisibility::LinkVisible).unwrap();
        assert_eq!(json, "\"link-visible\"");
        let back: TreeVisibility = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TreeVisibility::LinkVisible);
        assert!(serde_json::from_str::<TreeVisibility>("\"secret\"").is_err());
    }

    #[test]
    fn test_xor_keys_roundtrip() {
        let a = [0x11u8; 32];
        let b = [0x22u8; 32];
        let masked = xor_keys(&a, &b);
        let unmasked = xor_keys(&masked, &b);
        assert_eq!(unmasked, a);
    }

    #[test]
    fn test_link_key_mask_and_id() {
        let link = LinkKey::generate();
        let content = generate_key();
        let wrapped = link.mask(&content);
        assert_ne!(wrapped, content);
        assert_eq!(link.mask(&wrapped), content);

        assert_eq!(link.key_id().len(), 64);
        assert_ne!(link.key_id(), link.to_hex());
        assert_eq!(LinkKey::from_hex(&link.to_hex()).unwrap().key_id(), link.key_id());
    }

    #[test]
    fn test_link_key_fragment() {
        let link = LinkKey::generate();
        let fragment = format!("#foo=1&{}", link.to_fragment());
        assert_eq!(LinkKey::from_fragment(&fragment), Some(link));
        assert_eq!(LinkKey::from_fragment("#k=nothex"), None);
        assert_eq!(LinkKey::from_fragment(""), None);
    }
}
