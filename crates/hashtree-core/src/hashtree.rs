//! HashTree - unified tree API
//!
//! Writes split files into chunks, encrypt every block with CHK (unless the
//! tree is configured public) and build MessagePack tree nodes on top.
//! Directories are immutable: edits rebuild only the nodes on the edited
//! path and reuse every other subtree by hash, so old roots stay readable.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tracing::debug;

use crate::codec::{decode_tree_node, encode_tree_node, try_decode_tree_node, CodecError};
use crate::crypto::{could_be_encrypted, decrypt_chk, encrypt_chk, CryptoError};
use crate::hash::sha256;
use crate::store::{Store, StoreError};
use crate::types::{
    to_hex, Cid, DirEntry, Hash, Link, LinkType, ResolvedEntry, TreeEntry, TreeNode,
};

/// Default chunk size (2 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Max links per file node before another level is added
pub const DEFAULT_MAX_LINKS: usize = 174;

/// Upper bound on a single block fetch
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum HashTreeError {
    #[error("storage write failed: {0}")]
    StorageWriteFailed(StoreError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("encryption error: {0}")]
    Crypto(CryptoError),
    #[error("block not found: {0}")]
    MissingBlock(String),
    #[error("block fetch timed out after {0:?}")]
    FetchTimeout(Duration),
    #[error("not a directory: {0}")]
    NotDirectory(String),
    #[error("is a directory")]
    IsDirectory,
    #[error("path not found: {0}")]
    PathNotFound(String),
    #[error("entry not found: {0}")]
    EntryNotFound(String),
    #[error("duplicate entry name: {0}")]
    DuplicateName(String),
    #[error("invalid entry name: {0:?}")]
    InvalidName(String),
    #[error("invalid node: {0}")]
    InvalidNode(String),
    #[error("invalid range: {start}..{end}")]
    InvalidRange { start: u64, end: u64 },
    #[error("chunk {hash} is {actual} bytes, link says {expected}")]
    SizeMismatch {
        hash: String,
        expected: u64,
        actual: u64,
    },
}

impl HashTreeError {
    /// Wrong or missing key ("link required"), as opposed to absent content
    pub fn is_access_denied(&self) -> bool {
        matches!(self, HashTreeError::AccessDenied(_))
    }
}

pub struct HashTreeConfig<S: Store> {
    pub store: Arc<S>,
    pub chunk_size: usize,
    pub max_links: usize,
    pub encrypted: bool,
    pub fetch_timeout: Duration,
}

impl<S: Store> Clone for HashTreeConfig<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            chunk_size: self.chunk_size,
            max_links: self.max_links,
            encrypted: self.encrypted,
            fetch_timeout: self.fetch_timeout,
        }
    }
}

impl<S: Store> HashTreeConfig<S> {
    /// Encrypted by default
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_links: DEFAULT_MAX_LINKS,
            encrypted: true,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    /// Store blocks unencrypted
    pub fn public(mut self) -> Self {
        self.encrypted = false;
        self
    }

    pub fn with_encryption(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_max_links(mut self, max_links: usize) -> Self {
        self.max_links = max_links.max(2);
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }
}

pub struct HashTree<S: Store> {
    config: HashTreeConfig<S>,
}

impl<S: Store> Clone for HashTree<S> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
        }
    }
}

fn normalize_path<'a>(path: &[&'a str]) -> Vec<&'a str> {
    path.iter().copied().filter(|s| !s.is_empty()).collect()
}

fn validate_name(name: &str) -> Result<(), HashTreeError> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(HashTreeError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Link sizes come from fetched nodes and may be hostile
fn node_size(node: &TreeNode) -> Result<u64, HashTreeError> {
    node.total_size()
        .ok_or_else(|| HashTreeError::InvalidNode("link sizes overflow".into()))
}

impl<S: Store> HashTree<S> {
    pub fn new(config: HashTreeConfig<S>) -> Self {
        Self { config }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.config.store
    }

    pub fn is_encrypted(&self) -> bool {
        self.config.encrypted
    }

    pub fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    /// Up-front reservation for a read of `len` claimed bytes, at most one
    /// chunk; the rest grows as verified blocks arrive.
    fn prealloc(&self, len: u64) -> usize {
        len.min(self.config.chunk_size as u64) as usize
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    async fn put_block(&self, data: &[u8]) -> Result<Cid, HashTreeError> {
        if self.config.encrypted {
            let (ciphertext, key) = encrypt_chk(data).map_err(HashTreeError::Crypto)?;
            let hash = sha256(&ciphertext);
            self.config
                .store
                .put(hash, ciphertext)
                .await
                .map_err(HashTreeError::StorageWriteFailed)?;
            Ok(Cid::encrypted(hash, key))
        } else {
            let hash = sha256(data);
            self.config
                .store
                .put(hash, data.to_vec())
                .await
                .map_err(HashTreeError::StorageWriteFailed)?;
            Ok(Cid::public(hash))
        }
    }

    /// Store raw bytes as one block
    pub async fn put_blob(&self, data: &[u8]) -> Result<Cid, HashTreeError> {
        self.put_block(data).await
    }

    pub async fn put_node(&self, node: &TreeNode) -> Result<Cid, HashTreeError> {
        let bytes = encode_tree_node(node)?;
        self.put_block(&bytes).await
    }

    /// Store file content. Returns the root CID and plaintext size.
    ///
    /// Content up to one chunk is stored as a single blob; larger content
    /// becomes a file node linking the chunks in order.
    pub async fn put_file(&self, data: &[u8]) -> Result<(Cid, u64), HashTreeError> {
        let size = data.len() as u64;
        if data.len() <= self.config.chunk_size {
            return Ok((self.put_block(data).await?, size));
        }

        let mut links = Vec::with_capacity(data.len().div_ceil(self.config.chunk_size));
        for chunk in data.chunks(self.config.chunk_size) {
            let cid = self.put_block(chunk).await?;
            links.push(Link::chunk(&cid, chunk.len() as u64, LinkType::Blob));
        }
        debug!("stored {} bytes as {} chunks", size, links.len());

        let cid = self.build_file_tree(links).await?;
        Ok((cid, size))
    }

    async fn build_file_tree(&self, mut links: Vec<Link>) -> Result<Cid, HashTreeError> {
        while links.len() > self.config.max_links {
            let mut parents = Vec::with_capacity(links.len().div_ceil(self.config.max_links));
            for group in links.chunks(self.config.max_links) {
                let node = TreeNode::file(group.to_vec());
                let cid = self.put_node(&node).await?;
                parents.push(Link::chunk(&cid, node_size(&node)?, LinkType::File));
            }
            links = parents;
        }
        self.put_node(&TreeNode::file(links)).await
    }

    /// Store a directory. Entries are sorted by name; names must be unique.
    pub async fn put_directory(&self, entries: Vec<DirEntry>) -> Result<Cid, HashTreeError> {
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            validate_name(&entry.name)?;
            if !seen.insert(entry.name.as_str()) {
                return Err(HashTreeError::DuplicateName(entry.name.clone()));
            }
        }

        let mut node = TreeNode::directory(entries.into_iter().map(DirEntry::into_link).collect());
        node.sort_links();
        self.put_node(&node).await
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    async fn fetch_raw(&self, hash: &Hash) -> Result<Option<Vec<u8>>, HashTreeError> {
        let timeout = self.config.fetch_timeout;
        tokio::time::timeout(timeout, self.config.store.get(hash))
            .await
            .map_err(|_| HashTreeError::FetchTimeout(timeout))?
            .map_err(HashTreeError::from)
    }

    /// Fetch a block and decrypt it if the CID carries a key
    pub async fn get_block(&self, cid: &Cid) -> Result<Option<Vec<u8>>, HashTreeError> {
        let Some(raw) = self.fetch_raw(&cid.hash).await? else {
            return Ok(None);
        };
        match &cid.key {
            Some(key) => decrypt_chk(&raw, key).map(Some).map_err(|_| {
                HashTreeError::AccessDenied(format!("cannot decrypt {}", to_hex(&cid.hash)))
            }),
            None => Ok(Some(raw)),
        }
    }

    pub async fn get_node(&self, cid: &Cid) -> Result<Option<TreeNode>, HashTreeError> {
        Ok(self
            .get_block(cid)
            .await?
            .and_then(|bytes| try_decode_tree_node(&bytes)))
    }

    /// Fetch a directory node. Undecodable bytes under a keyless CID are
    /// treated as ciphertext read without its key.
    async fn get_directory(&self, cid: &Cid) -> Result<Option<TreeNode>, HashTreeError> {
        let Some(bytes) = self.get_block(cid).await? else {
            return Ok(None);
        };
        match try_decode_tree_node(&bytes) {
            Some(node) if node.is_directory() => Ok(Some(node)),
            Some(_) => Err(HashTreeError::NotDirectory(to_hex(&cid.hash))),
            None if cid.key.is_none() && could_be_encrypted(bytes.len()) => Err(
                HashTreeError::AccessDenied(format!("missing key for {}", to_hex(&cid.hash))),
            ),
            None => Err(HashTreeError::NotDirectory(to_hex(&cid.hash))),
        }
    }

    pub async fn is_directory(&self, cid: &Cid) -> Result<bool, HashTreeError> {
        Ok(self.get_node(cid).await?.is_some_and(|n| n.is_directory()))
    }

    pub async fn list_directory(&self, cid: &Cid) -> Result<Vec<TreeEntry>, HashTreeError> {
        let node = self
            .get_directory(cid)
            .await?
            .ok_or_else(|| HashTreeError::MissingBlock(to_hex(&cid.hash)))?;
        Ok(node.links.iter().map(TreeEntry::from).collect())
    }

    /// Walk `path` from `root`. Returns `Ok(None)` if any segment (or the
    /// root block) is missing; decryption failures are `AccessDenied`.
    pub async fn resolve_path(
        &self,
        root: &Cid,
        path: &[&str],
    ) -> Result<Option<ResolvedEntry>, HashTreeError> {
        let segments = normalize_path(path);
        let Some(mut node) = self.get_directory(root).await? else {
            return Ok(None);
        };

        let mut resolved = ResolvedEntry {
            cid: *root,
            link_type: LinkType::Dir,
            size: node_size(&node)?,
            meta: None,
        };

        for (depth, segment) in segments.iter().enumerate() {
            let Some(link) = node.find(segment).cloned() else {
                return Ok(None);
            };
            resolved = ResolvedEntry {
                cid: link.cid(),
                link_type: link.link_type,
                size: link.size,
                meta: link.meta.clone(),
            };

            if depth + 1 < segments.len() {
                if link.link_type != LinkType::Dir {
                    return Ok(None);
                }
                match self.get_directory(&link.cid()).await? {
                    Some(child) => node = child,
                    None => return Ok(None),
                }
            }
        }

        Ok(Some(resolved))
    }

    /// `resolve_path` with a slash-separated path
    pub async fn resolve(
        &self,
        root: &Cid,
        path: &str,
    ) -> Result<Option<ResolvedEntry>, HashTreeError> {
        let segments: Vec<&str> = path.split('/').collect();
        self.resolve_path(root, &segments).await
    }

    /// Read a whole file (blob or chunked)
    pub async fn read_file(&self, cid: &Cid) -> Result<Option<Vec<u8>>, HashTreeError> {
        let Some(bytes) = self.get_block(cid).await? else {
            return Ok(None);
        };
        match try_decode_tree_node(&bytes) {
            Some(node) if node.node_type == LinkType::File => {
                let total = node_size(&node)?;
                let mut out = Vec::with_capacity(self.prealloc(total));
                self.read_node_range(&node, 0, total, &mut out).await?;
                Ok(Some(out))
            }
            Some(_) => Err(HashTreeError::IsDirectory),
            None => Ok(Some(bytes)),
        }
    }

    /// Read plaintext bytes `[start, end)`. `end` is clamped to the file size.
    pub async fn read_file_range(
        &self,
        cid: &Cid,
        start: u64,
        end: u64,
    ) -> Result<Option<Vec<u8>>, HashTreeError> {
        if start > end {
            return Err(HashTreeError::InvalidRange { start, end });
        }
        let Some(bytes) = self.get_block(cid).await? else {
            return Ok(None);
        };

        match try_decode_tree_node(&bytes) {
            Some(node) if node.node_type == LinkType::File => {
                let end = end.min(node_size(&node)?);
                let mut out = Vec::new();
                if start < end {
                    out.reserve(self.prealloc(end - start));
                    self.read_node_range(&node, start, end, &mut out).await?;
                }
                Ok(Some(out))
            }
            Some(_) => Err(HashTreeError::IsDirectory),
            None => {
                let len = bytes.len() as u64;
                let from = start.min(len) as usize;
                let to = end.min(len) as usize;
                Ok(Some(bytes[from..to].to_vec()))
            }
        }
    }

    /// Append plaintext `[start, end)` of a file node to `out`. Offsets are
    /// relative to the node; link sizes are plaintext sizes.
    fn read_node_range<'a>(
        &'a self,
        node: &'a TreeNode,
        start: u64,
        end: u64,
        out: &'a mut Vec<u8>,
    ) -> BoxFuture<'a, Result<(), HashTreeError>> {
        async move {
            let mut offset = 0u64;
            for link in &node.links {
                let link_start = offset;
                let link_end = offset.checked_add(link.size).ok_or_else(|| {
                    HashTreeError::InvalidNode(format!("size overflow at {}", to_hex(&link.hash)))
                })?;
                offset = link_end;

                if link_end <= start {
                    continue;
                }
                if link_start >= end {
                    break;
                }

                let from = start.saturating_sub(link_start);
                let to = end.min(link_end) - link_start;

                let cid = link.cid();
                let bytes = self
                    .get_block(&cid)
                    .await?
                    .ok_or_else(|| HashTreeError::MissingBlock(to_hex(&link.hash)))?;

                if link.link_type == LinkType::File {
                    let child = decode_tree_node(&bytes)?;
                    self.read_node_range(&child, from, to, out).await?;
                } else {
                    if bytes.len() as u64 != link.size {
                        return Err(HashTreeError::SizeMismatch {
                            hash: to_hex(&link.hash),
                            expected: link.size,
                            actual: bytes.len() as u64,
                        });
                    }
                    out.extend_from_slice(&bytes[from as usize..to as usize]);
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Plaintext size of a file
    pub async fn file_size(&self, cid: &Cid) -> Result<u64, HashTreeError> {
        let bytes = self
            .get_block(cid)
            .await?
            .ok_or_else(|| HashTreeError::MissingBlock(to_hex(&cid.hash)))?;
        match try_decode_tree_node(&bytes) {
            Some(node) if node.node_type == LinkType::File => node_size(&node),
            Some(_) => Err(HashTreeError::IsDirectory),
            None => Ok(bytes.len() as u64),
        }
    }

    // ------------------------------------------------------------------
    // Copy-on-write edits
    // ------------------------------------------------------------------

    /// Insert or replace `entry` in the directory at `parent_path`.
    /// Returns the new root; `root` and everything it references is left
    /// untouched.
    pub async fn set_entry(
        &self,
        root: &Cid,
        parent_path: &[&str],
        entry: DirEntry,
    ) -> Result<Cid, HashTreeError> {
        validate_name(&entry.name)?;
        self.rewrite_directory(root, parent_path, move |dir| {
            let link = entry.into_link();
            match dir.links.iter_mut().find(|l| l.name == link.name) {
                Some(existing) => *existing = link,
                None => dir.links.push(link),
            }
            Ok(())
        })
        .await
    }

    /// Remove `name` from the directory at `parent_path`
    pub async fn remove_entry(
        &self,
        root: &Cid,
        parent_path: &[&str],
        name: &str,
    ) -> Result<Cid, HashTreeError> {
        let name = name.to_string();
        self.rewrite_directory(root, parent_path, move |dir| {
            let before = dir.links.len();
            dir.links.retain(|l| l.name.as_deref() != Some(name.as_str()));
            if dir.links.len() == before {
                return Err(HashTreeError::EntryNotFound(name));
            }
            Ok(())
        })
        .await
    }

    /// Apply `edit` to the directory at `parent_path` and re-link every
    /// ancestor up to a new root. Siblings keep their hashes.
    async fn rewrite_directory<F>(
        &self,
        root: &Cid,
        parent_path: &[&str],
        edit: F,
    ) -> Result<Cid, HashTreeError>
    where
        F: FnOnce(&mut TreeNode) -> Result<(), HashTreeError> + Send,
    {
        let segments = normalize_path(parent_path);

        let root_node = self
            .get_directory(root)
            .await?
            .ok_or_else(|| HashTreeError::MissingBlock(to_hex(&root.hash)))?;
        let mut stack = Vec::with_capacity(segments.len() + 1);
        stack.push(root_node);

        for depth in 0..segments.len() {
            let walked = segments[..=depth].join("/");
            let link = stack[depth]
                .find(segments[depth])
                .cloned()
                .ok_or_else(|| HashTreeError::PathNotFound(walked.clone()))?;
            if link.link_type != LinkType::Dir {
                return Err(HashTreeError::NotDirectory(walked));
            }
            let child = self
                .get_directory(&link.cid())
                .await?
                .ok_or_else(|| HashTreeError::MissingBlock(to_hex(&link.hash)))?;
            stack.push(child);
        }

        let mut current = stack
            .pop()
            .ok_or_else(|| HashTreeError::PathNotFound(segments.join("/")))?;
        edit(&mut current)?;
        current.sort_links();

        let mut cid = self.put_node(&current).await?;
        let mut size = node_size(&current)?;

        for segment in segments.iter().rev() {
            let mut parent = stack
                .pop()
                .ok_or_else(|| HashTreeError::PathNotFound(segment.to_string()))?;
            let link = parent
                .links
                .iter_mut()
                .find(|l| l.name.as_deref() == Some(*segment))
                .ok_or_else(|| HashTreeError::PathNotFound(segment.to_string()))?;
            link.hash = cid.hash;
            link.key = cid.key;
            link.size = size;

            cid = self.put_node(&parent).await?;
            size = node_size(&parent)?;
        }

        Ok(cid)
    }
}
