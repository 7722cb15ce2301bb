//! Tree root registry
//!
//! Reconciles the current root of each tree across local writes, signed
//! network announcements, a background worker mirror and speculative
//! prefetch hints:
//!
//! - a dirty record (local write not yet published) is never replaced by
//!   a non-local source;
//! - otherwise a non-local update applies only if its timestamp is strictly
//!   newer than the stored one (ties keep the first value seen);
//! - omitted visibility is inherited, never reset to public.
//!
//! All state sits behind one mutex that is never held across an `.await`.
//! Publishing is driven by per-key timers, see [`crate::scheduler`].

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::Stream;
use hashtree_core::{EncryptionKey, Hash};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::persistence::{PersistenceError, RootPersistence};
use crate::publisher::RootPublisher;
use crate::record::{
    ExternalSource, RecordState, RootOptions, RootSource, RootUpdate, TreeKey, TreeRootRecord,
};

/// Default delay between a local write and its publish
pub const DEFAULT_PUBLISH_DEBOUNCE: Duration = Duration::from_millis(1000);

/// Default delay before retrying a failed publish
pub const DEFAULT_PUBLISH_RETRY: Duration = Duration::from_millis(5000);

/// Default wait in [`TreeRootRegistry::resolve_default`]
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    pub publish_debounce: Duration,
    pub publish_retry: Duration,
    pub resolve_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            publish_debounce: DEFAULT_PUBLISH_DEBOUNCE,
            publish_retry: DEFAULT_PUBLISH_RETRY,
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
        }
    }
}

impl RegistryConfig {
    pub fn with_publish_debounce(mut self, delay: Duration) -> Self {
        self.publish_debounce = delay;
        self
    }

    pub fn with_publish_retry(mut self, delay: Duration) -> Self {
        self.publish_retry = delay;
        self
    }

    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) struct ScheduledPublish {
    pub generation: u64,
    pub handle: JoinHandle<()>,
}

#[derive(Default)]
pub(crate) struct State {
    pub records: HashMap<TreeKey, TreeRootRecord>,
    pub timers: HashMap<TreeKey, ScheduledPublish>,
    pub next_generation: u64,
    subscribers: HashMap<TreeKey, Vec<UnboundedSender<RootUpdate>>>,
    all_subscribers: Vec<UnboundedSender<RootUpdate>>,
}

impl State {
    /// Fan an update out to key and global subscribers, dropping closed ones
    pub(crate) fn notify(&mut self, key: &TreeKey, record: Option<TreeRootRecord>) {
        let update = RootUpdate {
            key: key.clone(),
            record,
        };

        let drained = match self.subscribers.get_mut(key) {
            Some(senders) => {
                senders.retain(|tx| tx.send(update.clone()).is_ok());
                senders.is_empty()
            }
            None => false,
        };
        if drained {
            self.subscribers.remove(key);
        }

        self.all_subscribers.retain(|tx| tx.send(update.clone()).is_ok());
    }

    /// Forget closed subscriptions for `key`
    fn prune_subscribers(&mut self, key: &TreeKey) {
        if let Some(senders) = self.subscribers.get_mut(key) {
            senders.retain(|tx| !tx.is_closed());
            if senders.is_empty() {
                self.subscribers.remove(key);
            }
        }
    }

    pub(crate) fn cancel_timer(&mut self, key: &TreeKey) -> bool {
        match self.timers.remove(key) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    fn cancel_all_timers(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
    }
}

pub(crate) struct Inner {
    pub config: RegistryConfig,
    pub state: Mutex<State>,
    pub persistence: Arc<dyn RootPersistence>,
    pub publisher: Arc<dyn RootPublisher>,
}

impl Inner {
    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write-through; failures are logged and the in-memory value stays.
    ///
    /// Called with the state lock held, so the slot sees writes in the same
    /// order as the record map. The write is synchronous: with a
    /// [`FileSlot`](crate::persistence::FileSlot) every record change
    /// costs a blob rewrite and an fsync on the calling thread, including
    /// runtime workers finishing a publish. Slots on slow media should be
    /// driven from a blocking-friendly context.
    pub(crate) fn persist(&self, key: &TreeKey, record: &TreeRootRecord) {
        if let Err(e) = self.persistence.save(key, record) {
            warn!("failed to persist tree root {}: {}", key, e);
        }
    }

    fn persist_delete(&self, key: &TreeKey) {
        if let Err(e) = self.persistence.delete(key) {
            warn!("failed to delete persisted tree root {}: {}", key, e);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel_all_timers();
    }
}

/// Cloneable handle to the registry
#[derive(Clone)]
pub struct TreeRootRegistry {
    pub(crate) inner: Arc<Inner>,
}

impl TreeRootRegistry {
    pub fn new(
        config: RegistryConfig,
        persistence: Arc<dyn RootPersistence>,
        publisher: Arc<dyn RootPublisher>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                persistence,
                publisher,
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Load persisted records and re-schedule a publish for every record
    /// still dirty. Records already in memory that are dirty or at least as
    /// new are kept. Returns the number of records loaded.
    pub fn hydrate(&self) -> Result<usize, PersistenceError> {
        let loaded = self.inner.persistence.load_all()?;

        let mut state = self.inner.lock();
        let mut count = 0;
        let mut dirty = 0;
        for (key, record) in loaded {
            if let Some(existing) = state.records.get(&key) {
                if existing.is_dirty() || existing.updated_at() >= record.updated_at() {
                    continue;
                }
            }
            let is_dirty = record.is_dirty();
            state.records.insert(key.clone(), record.clone());
            state.notify(&key, Some(record));
            if is_dirty {
                self.inner
                    .schedule_publish(&mut state, &key, self.inner.config.publish_debounce);
                dirty += 1;
            }
            count += 1;
        }

        info!("hydrated {} tree roots ({} pending publish)", count, dirty);
        Ok(count)
    }

    /// Record a local write. Always applies: the record becomes dirty,
    /// is persisted, and a publish is scheduled after the debounce delay,
    /// replacing any pending one for the key.
    pub fn set_local(&self, key: &TreeKey, hash: Hash, options: RootOptions) -> TreeRootRecord {
        let mut state = self.inner.lock();
        let prev = state.records.get(key);

        let (content_key, visibility, envelope) = options.resolve(prev, &hash);
        // keep local timestamps strictly increasing within a second
        let now = now_secs();
        let updated_at = prev.map_or(now, |p| now.max(p.updated_at().saturating_add(1)));

        let record = TreeRootRecord {
            hash,
            key: content_key,
            visibility,
            envelope,
            state: RecordState::Dirty {
                pending_since: updated_at,
                retry_count: 0,
            },
        };
        if !record.is_recoverable() {
            warn!("{} root {} has no recoverable key envelope", visibility, key);
        }

        state.records.insert(key.clone(), record.clone());
        self.inner.persist(key, &record);
        state.notify(key, Some(record.clone()));
        self.inner
            .schedule_publish(&mut state, key, self.inner.config.publish_debounce);

        debug!("local write {} -> {}", key, hex::encode(hash));
        record
    }

    /// Root from a signed network announcement
    pub fn set_from_resolver(
        &self,
        key: &TreeKey,
        hash: Hash,
        updated_at: u64,
        options: RootOptions,
    ) -> bool {
        self.apply_remote(key, hash, updated_at, RootSource::Nostr, options)
    }

    /// Root mirrored from a background worker
    pub fn set_from_worker(
        &self,
        key: &TreeKey,
        hash: Hash,
        updated_at: u64,
        options: RootOptions,
    ) -> bool {
        self.apply_remote(key, hash, updated_at, RootSource::Worker, options)
    }

    /// Speculative root from prefetch or a native bridge
    pub fn set_from_external(
        &self,
        key: &TreeKey,
        hash: Hash,
        source: ExternalSource,
        updated_at: u64,
        options: RootOptions,
    ) -> bool {
        self.apply_remote(key, hash, updated_at, source.into(), options)
    }

    fn apply_remote(
        &self,
        key: &TreeKey,
        hash: Hash,
        updated_at: u64,
        source: RootSource,
        options: RootOptions,
    ) -> bool {
        let mut state = self.inner.lock();

        if let Some(current) = state.records.get(key) {
            if current.is_dirty() {
                debug!("ignoring {} root for {}: local write pending", source, key);
                return false;
            }
            if current.updated_at() >= updated_at {
                debug!(
                    "ignoring stale {} root for {} ({} <= {})",
                    source,
                    key,
                    updated_at,
                    current.updated_at()
                );
                return false;
            }
        }

        let (content_key, visibility, envelope) = options.resolve(state.records.get(key), &hash);
        let record = TreeRootRecord {
            hash,
            key: content_key,
            visibility,
            envelope,
            state: RecordState::Clean { source, updated_at },
        };

        state.records.insert(key.clone(), record.clone());
        self.inner.persist(key, &record);
        state.notify(key, Some(record));
        true
    }

    /// Attach a recovered content key to a clean record with a matching
    /// hash and no key yet. Ordering fields are left as they are.
    pub fn merge_key(&self, key: &TreeKey, hash: Hash, content_key: EncryptionKey) -> bool {
        let mut state = self.inner.lock();
        let record = match state.records.get_mut(key) {
            Some(record) if !record.is_dirty() && record.hash == hash && record.key.is_none() => {
                record.key = Some(content_key);
                record.clone()
            }
            _ => return false,
        };

        self.inner.persist(key, &record);
        state.notify(key, Some(record));
        true
    }

    /// Remove a record. Cancels its pending publish first so a late publish
    /// cannot bring it back.
    pub fn delete(&self, key: &TreeKey) -> bool {
        let mut state = self.inner.lock();
        state.cancel_timer(key);
        let removed = state.records.remove(key).is_some();
        if removed {
            self.inner.persist_delete(key);
            state.notify(key, None);
            debug!("deleted tree root {}", key);
        }
        removed
    }

    pub fn get(&self, key: &TreeKey) -> Option<TreeRootRecord> {
        self.inner.lock().records.get(key).cloned()
    }

    /// Cached record, or the first one to arrive within `timeout`
    pub async fn resolve(&self, key: &TreeKey, timeout: Duration) -> Option<TreeRootRecord> {
        if let Some(record) = self.get(key) {
            return Some(record);
        }

        let mut subscription = self.subscribe(key);
        let first = async {
            while let Some(update) = subscription.recv().await {
                if update.record.is_some() {
                    return update.record;
                }
            }
            None
        };
        tokio::time::timeout(timeout, first).await.ok().flatten()
    }

    /// [`resolve`](Self::resolve) with the configured timeout
    pub async fn resolve_default(&self, key: &TreeKey) -> Option<TreeRootRecord> {
        self.resolve(key, self.inner.config.resolve_timeout).await
    }

    /// Updates for one key. A cached record is queued first, so the
    /// subscriber sees the current value before any later change.
    pub fn subscribe(&self, key: &TreeKey) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.lock();
        if let Some(record) = state.records.get(key) {
            let _ = tx.send(RootUpdate {
                key: key.clone(),
                record: Some(record.clone()),
            });
        }
        state.subscribers.entry(key.clone()).or_default().push(tx);
        Subscription {
            rx,
            key: key.clone(),
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Every keyed update, from now on
    pub fn subscribe_all(&self) -> UpdateStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.lock();
        state.all_subscribers.retain(|tx| !tx.is_closed());
        state.all_subscribers.push(tx);
        UpdateStream { rx }
    }

    /// Cancel all timers and close every subscription
    pub fn shutdown(&self) {
        let mut state = self.inner.lock();
        state.cancel_all_timers();
        state.subscribers.clear();
        state.all_subscribers.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<TreeKey> {
        let mut keys: Vec<TreeKey> = self.inner.lock().records.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Keys with a local write not yet published
    pub fn dirty_keys(&self) -> Vec<TreeKey> {
        let mut keys: Vec<TreeKey> = self
            .inner
            .lock()
            .records
            .iter()
            .filter(|(_, r)| r.is_dirty())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

/// Updates for one key; dropping it unsubscribes
pub struct Subscription {
    rx: UnboundedReceiver<RootUpdate>,
    key: TreeKey,
    registry: Weak<Inner>,
}

impl Subscription {
    /// Next update, `None` once the registry shuts down
    pub async fn recv(&mut self) -> Option<RootUpdate> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RootUpdate> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(inner) = self.registry.upgrade() {
            inner.lock().prune_subscribers(&self.key);
        }
    }
}

impl Stream for Subscription {
    type Item = RootUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Global update feed from [`TreeRootRegistry::subscribe_all`]
pub struct UpdateStream {
    rx: UnboundedReceiver<RootUpdate>,
}

impl UpdateStream {
    pub async fn recv(&mut self) -> Option<RootUpdate> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RootUpdate> {
        self.rx.try_recv().ok()
    }
}

impl Stream for UpdateStream {
    type Item = RootUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
