//! MessagePack encoding for tree nodes
//!
//! Wire format: a map `{ t: node type, l: [links] }`, each link a map with
//! short keys `h` (hash), `n` (name), `s` (size), `k` (key), `t` (link
//! type), `m` (metadata). Optional fields are omitted when absent so the
//! encoding of a given node is canonical.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use thiserror::Error;

use crate::hash::sha256;
use crate::types::{Hash, Link, LinkType, TreeNode};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("invalid node type: {0}")]
    InvalidNodeType(u8),
    #[error("invalid link type: {0}")]
    InvalidLinkType(u8),
    #[error("invalid {field} length: {len}")]
    InvalidLength { field: &'static str, len: usize },
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireNode {
    #[serde(rename = "t")]
    node_type: u8,
    #[serde(rename = "l")]
    links: Vec<WireLink>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireLink {
    #[serde(rename = "h")]
    hash: ByteBuf,
    #[serde(rename = "n", default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(rename = "s")]
    size: u64,
    #[serde(rename = "k", default, skip_serializing_if = "Option::is_none")]
    key: Option<ByteBuf>,
    #[serde(rename = "t")]
    link_type: u8,
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    meta: Option<serde_json::Value>,
}

fn to_array(field: &'static str, bytes: &[u8]) -> Result<[u8; 32], CodecError> {
    <[u8; 32]>::try_from(bytes).map_err(|_| CodecError::InvalidLength {
        field,
        len: bytes.len(),
    })
}

pub fn encode_tree_node(node: &TreeNode) -> Result<Vec<u8>, CodecError> {
    let wire = WireNode {
        node_type: node.node_type.as_u8(),
        links: node
            .links
            .iter()
            .map(|link| WireLink {
                hash: ByteBuf::from(link.hash.to_vec()),
                name: link.name.clone(),
                size: link.size,
                key: link.key.map(|k| ByteBuf::from(k.to_vec())),
                link_type: link.link_type.as_u8(),
                meta: link.meta.clone(),
            })
            .collect(),
    };
    Ok(rmp_serde::to_vec_named(&wire)?)
}

pub fn decode_tree_node(data: &[u8]) -> Result<TreeNode, CodecError> {
    let wire: WireNode = rmp_serde::from_slice(data)?;
    let node_type = match LinkType::from_u8(wire.node_type) {
        Some(t @ (LinkType::File | LinkType::Dir)) => t,
        _ => return Err(CodecError::InvalidNodeType(wire.node_type)),
    };

    let mut links = Vec::with_capacity(wire.links.len());
    for link in wire.links {
        let link_type =
            LinkType::from_u8(link.link_type).ok_or(CodecError::InvalidLinkType(link.link_type))?;
        links.push(Link {
            name: link.name,
            hash: to_array("hash", &link.hash)?,
            key: link.key.map(|k| to_array("key", &k)).transpose()?,
            size: link.size,
            link_type,
            meta: link.meta,
        });
    }

    Ok(TreeNode { node_type, links })
}

/// Decode if the bytes are a tree node, `None` for raw blobs
pub fn try_decode_tree_node(data: &[u8]) -> Option<TreeNode> {
    decode_tree_node(data).ok()
}

pub fn is_tree_node(data: &[u8]) -> bool {
    try_decode_tree_node(data).is_some()
}

pub fn is_directory_node(data: &[u8]) -> bool {
    try_decode_tree_node(data).is_some_and(|n| n.is_directory())
}

/// Encode a node and hash the encoded bytes
pub fn encode_and_hash(node: &TreeNode) -> Result<(Vec<u8>, Hash), CodecError> {
    let bytes = encode_tree_node(node)?;
    let hash = sha256(&bytes);
    Ok((bytes, hash))
}
