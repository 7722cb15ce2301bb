//! Publish hook for dirty roots

use std::future::Future;

use async_trait::async_trait;
use thiserror::Error;

use crate::record::{TreeKey, TreeRootRecord};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("publish rejected: {0}")]
    Rejected(String),
    #[error("announcement error: {0}")]
    Announcement(#[from] crate::announcement::AnnouncementError),
}

/// Announces a root to the network.
///
/// May be called repeatedly with the same record on retry, so
/// implementations must tolerate duplicates. `Ok(false)` and `Err` are both
/// treated as a failed attempt.
#[async_trait]
pub trait RootPublisher: Send + Sync {
    async fn publish(&self, key: &TreeKey, record: &TreeRootRecord) -> Result<bool, PublishError>;
}

/// Closure-backed publisher, see [`publish_fn`]
pub struct FnPublisher<F> {
    f: F,
}

/// Wrap an async closure as a [`RootPublisher`]
pub fn publish_fn<F, Fut>(f: F) -> FnPublisher<F>
where
    F: Fn(TreeKey, TreeRootRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, PublishError>> + Send + 'static,
{
    FnPublisher { f }
}

#[async_trait]
impl<F, Fut> RootPublisher for FnPublisher<F>
where
    F: Fn(TreeKey, TreeRootRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, PublishError>> + Send + 'static,
{
    async fn publish(&self, key: &TreeKey, record: &TreeRootRecord) -> Result<bool, PublishError> {
        (self.f)(key.clone(), record.clone()).await
    }
}
