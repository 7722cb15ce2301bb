//! Publish scheduling
//!
//! Each dirty key has at most one pending timer. Scheduling a new one
//! aborts the old, so a burst of local writes ends in a single publish.
//! Timers carry a generation number; a timer that fires after being
//! superseded finds a different generation in the table and does nothing.
//!
//! A publish attempt snapshots the record, calls the publisher without
//! holding the lock, then re-checks the record before clearing `dirty`:
//! if the key was deleted or rewritten meanwhile, the result is dropped.
//!
//! A non-public record whose envelope cannot yield the content key is held
//! back without a retry: announcing it would publish a root nobody can
//! open. The next local write with a complete envelope schedules it again.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::record::{RecordState, RootSource, TreeKey};
use crate::registry::{Inner, ScheduledPublish, State, TreeRootRegistry};

impl Inner {
    /// Replace the key's timer with one firing after `delay`
    pub(crate) fn schedule_publish(
        self: &Arc<Self>,
        state: &mut State,
        key: &TreeKey,
        delay: Duration,
    ) {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("no async runtime, publish of {} stays pending", key);
                return;
            }
        };

        state.cancel_timer(key);
        state.next_generation += 1;
        let generation = state.next_generation;

        let weak = Arc::downgrade(self);
        let task_key = key.clone();
        let join = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_timer_fired(task_key, generation).await;
            }
        });

        state.timers.insert(
            key.clone(),
            ScheduledPublish {
                generation,
                handle: join,
            },
        );
        debug!("publish of {} scheduled in {:?}", key, delay);
    }

    async fn on_timer_fired(self: Arc<Self>, key: TreeKey, generation: u64) {
        {
            let mut state = self.lock();
            match state.timers.get(&key) {
                Some(timer) if timer.generation == generation => {
                    state.timers.remove(&key);
                }
                _ => return,
            }
        }
        self.attempt_publish(key).await;
    }

    /// Publish the key's dirty record once. Returns true if the record was
    /// confirmed published and marked clean.
    pub(crate) async fn attempt_publish(self: &Arc<Self>, key: TreeKey) -> bool {
        let snapshot = {
            let state = self.lock();
            match state.records.get(&key) {
                Some(record) if record.is_dirty() => record.clone(),
                _ => return false,
            }
        };
        if !snapshot.is_recoverable() {
            warn!(
                "holding publish of {}: {} key is not recoverable from its envelope",
                key,
                snapshot.visibility.as_str()
            );
            return false;
        }

        let published = match self.publisher.publish(&key, &snapshot).await {
            Ok(true) => true,
            Ok(false) => {
                warn!("publish of {} was not accepted", key);
                false
            }
            Err(e) => {
                warn!("publish of {} failed: {}", key, e);
                false
            }
        };

        let mut state = self.lock();
        let Some(current) = state.records.get_mut(&key) else {
            debug!("{} deleted during publish, dropping result", key);
            return false;
        };
        let RecordState::Dirty {
            pending_since,
            retry_count,
        } = current.state
        else {
            return false;
        };
        if current.hash != snapshot.hash || pending_since != snapshot.updated_at() {
            debug!("{} rewritten during publish, dropping result", key);
            return false;
        }

        if published {
            current.state = RecordState::Clean {
                source: RootSource::LocalWrite,
                updated_at: pending_since,
            };
            let record = current.clone();
            self.persist(&key, &record);
            state.notify(&key, Some(record));
            info!("published {} -> {}", key, hex::encode(snapshot.hash));
            return true;
        }

        current.state = RecordState::Dirty {
            pending_since,
            retry_count: retry_count.saturating_add(1),
        };
        if !state.timers.contains_key(&key) {
            warn!(
                "retrying publish of {} in {:?} (attempt {})",
                key,
                self.config.publish_retry,
                retry_count + 1
            );
            self.schedule_publish(&mut state, &key, self.config.publish_retry);
        }
        false
    }
}

impl TreeRootRegistry {
    /// Cancel all timers and publish every dirty record now. Returns the
    /// number of records confirmed published; failures get a retry timer.
    pub async fn flush_pending_publishes(&self) -> usize {
        let keys = {
            let mut state = self.inner.lock();
            let timers: Vec<TreeKey> = state.timers.keys().cloned().collect();
            for key in &timers {
                state.cancel_timer(key);
            }
            state
                .records
                .iter()
                .filter(|(_, r)| r.is_dirty())
                .map(|(k, _)| k.clone())
                .collect::<Vec<_>>()
        };

        let results = join_all(
            keys.into_iter()
                .map(|key| self.inner.attempt_publish(key)),
        )
        .await;
        results.into_iter().filter(|ok| *ok).count()
    }

    /// Drop the key's pending publish timer, if any
    pub fn cancel_pending_publish(&self, key: &TreeKey) -> bool {
        self.inner.lock().cancel_timer(key)
    }

    /// Whether a publish timer is pending for `key`
    pub fn has_pending_publish(&self, key: &TreeKey) -> bool {
        self.inner.lock().timers.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::RootPersistence;
    use crate::record::{KeyEnvelope, RootOptions};
    use crate::testing::{memory_registry, ScriptedPublisher};
    use hashtree_core::TreeVisibility;

    fn key() -> TreeKey {
        TreeKey::new("npub1alice", "site")
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_bursts() {
        let publisher = ScriptedPublisher::succeeding();
        let (registry, _, publisher) = memory_registry(publisher);

        registry.set_local(&key(), [1u8; 32], RootOptions::new());
        tokio::time::sleep(ms(400)).await;
        registry.set_local(&key(), [2u8; 32], RootOptions::new());
        tokio::time::sleep(ms(400)).await;
        registry.set_local(&key(), [3u8; 32], RootOptions::new());
        assert_eq!(publisher.call_count(), 0);

        tokio::time::sleep(ms(1001)).await;
        let calls = publisher.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.hash, [3u8; 32]);

        let record = registry.get(&key()).unwrap();
        assert!(!record.is_dirty());
        assert_eq!(record.source(), RootSource::LocalWrite);
        assert!(!registry.has_pending_publish(&key()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_publish_retries_until_success() {
        let publisher = ScriptedPublisher::failing();
        let (registry, _, publisher) = memory_registry(publisher);
        registry.set_local(&key(), [1u8; 32], RootOptions::new());

        tokio::time::sleep(ms(1001)).await;
        assert_eq!(publisher.call_count(), 1);
        let record = registry.get(&key()).unwrap();
        assert!(record.is_dirty());
        assert_eq!(record.retry_count(), 1);

        tokio::time::sleep(ms(4998)).await;
        assert_eq!(publisher.call_count(), 1);
        tokio::time::sleep(ms(3)).await;
        assert_eq!(publisher.call_count(), 2);
        assert_eq!(registry.get(&key()).unwrap().retry_count(), 2);

        publisher.set_default(true);
        tokio::time::sleep(ms(5001)).await;
        assert_eq!(publisher.call_count(), 3);
        assert!(!registry.get(&key()).unwrap().is_dirty());

        // no further timers once clean
        tokio::time::sleep(ms(20_000)).await;
        assert_eq!(publisher.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_error_is_retried_like_false() {
        let publisher = ScriptedPublisher::erroring();
        let (registry, _, publisher) = memory_registry(publisher);
        registry.set_local(&key(), [1u8; 32], RootOptions::new());

        tokio::time::sleep(ms(6002)).await;
        assert_eq!(publisher.call_count(), 2);
        assert!(registry.get(&key()).unwrap().is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_cancels_pending_publish() {
        let (registry, persistence, publisher) = memory_registry(ScriptedPublisher::succeeding());
        registry.set_local(&key(), [1u8; 32], RootOptions::new());
        assert!(registry.has_pending_publish(&key()));

        assert!(registry.delete(&key()));
        assert!(!registry.has_pending_publish(&key()));

        tokio::time::sleep(ms(10_000)).await;
        assert_eq!(publisher.call_count(), 0);
        assert!(registry.get(&key()).is_none());
        assert!(persistence.load(&key()).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_during_publish_does_not_resurrect() {
        let publisher = ScriptedPublisher::succeeding();
        publisher.hold();
        let (registry, persistence, publisher) = memory_registry(publisher);
        registry.set_local(&key(), [1u8; 32], RootOptions::new());

        tokio::time::sleep(ms(1001)).await;
        assert_eq!(publisher.call_count(), 1);

        registry.delete(&key());
        publisher.release();
        tokio::time::sleep(ms(10)).await;

        assert!(registry.get(&key()).is_none());
        assert!(persistence.load(&key()).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_publish_keeps_newer_write_dirty() {
        let publisher = ScriptedPublisher::succeeding();
        publisher.hold();
        let (registry, _, publisher) = memory_registry(publisher);
        registry.set_local(&key(), [1u8; 32], RootOptions::new());

        tokio::time::sleep(ms(1001)).await;
        assert_eq!(publisher.call_count(), 1);

        // newer local write lands while the first publish is in flight
        registry.set_local(&key(), [2u8; 32], RootOptions::new());
        publisher.release();
        tokio::time::sleep(ms(10)).await;

        let record = registry.get(&key()).unwrap();
        assert!(record.is_dirty());
        assert_eq!(record.hash, [2u8; 32]);

        tokio::time::sleep(ms(1001)).await;
        publisher.release();
        tokio::time::sleep(ms(10)).await;
        let calls = publisher.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].1.hash, [2u8; 32]);
        assert!(!registry.get(&key()).unwrap().is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_publishes_all_dirty_now() {
        let (registry, _, publisher) = memory_registry(ScriptedPublisher::succeeding());
        let other = TreeKey::new("npub1alice", "notes");
        registry.set_local(&key(), [1u8; 32], RootOptions::new());
        registry.set_local(&other, [2u8; 32], RootOptions::new());
        let remote = TreeKey::new("npub1bob", "x");
        registry.set_from_resolver(&remote, [3u8; 32], 5, RootOptions::new());

        assert_eq!(registry.flush_pending_publishes().await, 2);
        assert_eq!(publisher.call_count(), 2);
        assert!(registry.dirty_keys().is_empty());
        assert!(!registry.has_pending_publish(&key()));

        // cancelled timers never fire
        tokio::time::sleep(ms(5000)).await;
        assert_eq!(publisher.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_failure_schedules_retry() {
        let (registry, _, publisher) = memory_registry(ScriptedPublisher::failing());
        registry.set_local(&key(), [1u8; 32], RootOptions::new());

        assert_eq!(registry.flush_pending_publishes().await, 0);
        assert!(registry.has_pending_publish(&key()));
        tokio::time::sleep(ms(5001)).await;
        assert_eq!(publisher.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_publish() {
        let (registry, _, publisher) = memory_registry(ScriptedPublisher::succeeding());
        registry.set_local(&key(), [1u8; 32], RootOptions::new());
        assert!(registry.cancel_pending_publish(&key()));
        assert!(!registry.cancel_pending_publish(&key()));

        tokio::time::sleep(ms(2000)).await;
        assert_eq!(publisher.call_count(), 0);
        assert!(registry.get(&key()).unwrap().is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hydrate_reschedules_dirty_records() {
        let (first, persistence, _) = memory_registry(ScriptedPublisher::failing());
        first.set_local(
            &key(),
            [1u8; 32],
            RootOptions::new()
                .with_visibility(TreeVisibility::Private)
                .with_envelope(KeyEnvelope {
                    self_encrypted_key: Some("sealed".into()),
                    ..Default::default()
                }),
        );
        first.set_from_resolver(&TreeKey::new("npub1bob", "x"), [2u8; 32], 9, RootOptions::new());
        first.shutdown();
        drop(first);

        let publisher = ScriptedPublisher::succeeding();
        let restarted = crate::registry::TreeRootRegistry::new(
            crate::registry::RegistryConfig::default(),
            persistence,
            publisher.clone(),
        );
        assert_eq!(restarted.hydrate().unwrap(), 2);
        assert_eq!(restarted.dirty_keys(), vec![key()]);
        assert!(restarted.has_pending_publish(&key()));

        tokio::time::sleep(ms(1001)).await;
        assert_eq!(publisher.call_count(), 1);
        let record = restarted.get(&key()).unwrap();
        assert!(!record.is_dirty());
        assert_eq!(record.visibility, TreeVisibility::Private);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecoverable_record_is_held_back() {
        let (registry, _, publisher) = memory_registry(ScriptedPublisher::succeeding());
        registry.set_local(
            &key(),
            [1u8; 32],
            RootOptions::new().with_visibility(TreeVisibility::Private),
        );

        tokio::time::sleep(ms(1001)).await;
        assert_eq!(publisher.call_count(), 0);
        assert!(registry.get(&key()).unwrap().is_dirty());
        assert!(!registry.has_pending_publish(&key()));
        assert_eq!(registry.flush_pending_publishes().await, 0);

        registry.set_local(
            &key(),
            [1u8; 32],
            RootOptions::new().with_envelope(KeyEnvelope {
                self_encrypted_key: Some("sealed".into()),
                ..Default::default()
            }),
        );
        tokio::time::sleep(ms(1001)).await;
        assert_eq!(publisher.call_count(), 1);
        let record = registry.get(&key()).unwrap();
        assert!(!record.is_dirty());
        assert_eq!(record.visibility, TreeVisibility::Private);
    }

    #[test]
    fn test_set_local_without_runtime_stays_dirty() {
        let (registry, _, _) = memory_registry(ScriptedPublisher::succeeding());
        let record = registry.set_local(&key(), [1u8; 32], RootOptions::new());
        assert!(record.is_dirty());
        assert!(!registry.has_pending_publish(&key()));
    }
}
