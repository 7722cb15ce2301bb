//! HashTree - content-addressed merkle tree storage
//!
//! SHA256(content) -> content, with files split into chunks and directories
//! stored as MessagePack nodes linking their children by hash.
//!
//! # Overview
//!
//! Content is CHK (Content Hash Key) encrypted by default: the key is the
//! hash of the plaintext, so identical content still deduplicates. Use
//! `.public()` config to store plaintext blocks instead.
//!
//! Directories are immutable. Editing an entry rebuilds the nodes on the
//! path to the root and returns a new root CID; the old root and every
//! block it references remain valid.
//!
//! # Core Concepts
//!
//! - **Blobs**: Raw data stored directly by their hash
//! - **Tree Nodes**: MessagePack-encoded file or directory nodes
//! - **Links**: References to child nodes with name, plaintext size and key
//! - **Cid**: Content identifier with hash + optional decryption key
//!
//! # Example
//!
//! ```rust
//! use hashtree_core::{DirEntry, HashTree, HashTreeConfig, MemoryStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryStore::new());
//!     let tree = HashTree::new(HashTreeConfig::new(store));
//!
//!     let (file, size) = tree.put_file(b"Hello, World!").await?;
//!     let root = tree
//!         .put_directory(vec![DirEntry::from_cid("hello.txt", &file).with_size(size)])
//!         .await?;
//!
//!     let entry = tree.resolve(&root, "hello.txt").await?.expect("entry exists");
//!     let data = tree.read_file(&entry.cid).await?;
//!     assert_eq!(data, Some(b"Hello, World!".to_vec()));
//!
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod crypto;
pub mod hash;
pub mod hashtree;
pub mod store;
pub mod types;
pub mod visibility;

// Main API - unified HashTree
pub use hashtree::{
    HashTree, HashTreeConfig, HashTreeError, DEFAULT_CHUNK_SIZE, DEFAULT_FETCH_TIMEOUT,
    DEFAULT_MAX_LINKS,
};

// Low-level codec
pub use codec::{
    decode_tree_node, encode_and_hash, encode_tree_node, is_directory_node, is_tree_node,
    try_decode_tree_node, CodecError,
};
pub use hash::{sha256, verify};

pub use store::{MemoryStore, Store, StoreError};
pub use types::{
    from_hex, hash_equals, to_hex, Cid, CidParseError, DirEntry, Hash, Link, LinkType,
    ResolvedEntry, TreeEntry, TreeNode,
};

pub use crypto::{
    content_hash, could_be_encrypted, decrypt_chk, encrypt_chk, encrypted_size, generate_key,
    key_from_hex, key_to_hex, plaintext_size, CryptoError, EncryptionKey, ENCRYPTION_OVERHEAD,
};
pub use visibility::{xor_keys, LinkKey, TreeVisibility};
