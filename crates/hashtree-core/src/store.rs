//! Block storage
//!
//! A store maps `SHA256(bytes) -> bytes`. It knows nothing about trees or
//! encryption; those live in [`crate::hashtree`].

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{to_hex, Hash};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(String),
    #[error("hash mismatch for {0}")]
    HashMismatch(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Store a block. Returns false if it was already present.
    async fn put(&self, hash: Hash, data: Vec<u8>) -> Result<bool, StoreError>;

    async fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>, StoreError>;

    async fn has(&self, hash: &Hash) -> Result<bool, StoreError> {
        Ok(self.get(hash).await?.is_some())
    }

    async fn delete(&self, hash: &Hash) -> Result<bool, StoreError>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    blocks: RwLock<HashMap<Hash, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<Hash> {
        self.blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total stored bytes
    pub fn size(&self) -> u64 {
        self.blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|v| v.len() as u64)
            .sum()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put(&self, hash: Hash, data: Vec<u8>) -> Result<bool, StoreError> {
        if !crate::hash::verify(&hash, &data) {
            return Err(StoreError::HashMismatch(to_hex(&hash)));
        }
        let mut blocks = self.blocks.write().unwrap_or_else(PoisonError::into_inner);
        if blocks.contains_key(&hash) {
            return Ok(false);
        }
        blocks.insert(hash, data);
        Ok(true)
    }

    async fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hash)
            .cloned())
    }

    async fn has(&self, hash: &Hash) -> Result<bool, StoreError> {
        Ok(self
            .blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(hash))
    }

    async fn delete(&self, hash: &Hash) -> Result<bool, StoreError> {
        Ok(self
            .blocks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(hash)
            .is_some())
    }
}
