//! Test helpers shared by the registry and scheduler tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::persistence::{JsonPersistence, MemorySlot};
use crate::publisher::{PublishError, RootPublisher};
use crate::record::{TreeKey, TreeRootRecord};
use crate::registry::{RegistryConfig, TreeRootRegistry};

#[derive(Clone, Copy)]
enum Outcome {
    Accept,
    Refuse,
    Fail,
}

/// Publisher that records every call and answers with a fixed outcome
pub(crate) struct ScriptedPublisher {
    calls: Mutex<Vec<(TreeKey, TreeRootRecord)>>,
    default: Mutex<Outcome>,
    hold: AtomicBool,
    gate: Notify,
}

impl ScriptedPublisher {
    fn with_default(outcome: Outcome) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            default: Mutex::new(outcome),
            hold: AtomicBool::new(false),
            gate: Notify::new(),
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::with_default(Outcome::Accept)
    }

    /// Answers `Ok(false)`
    pub fn failing() -> Arc<Self> {
        Self::with_default(Outcome::Refuse)
    }

    /// Answers `Err`
    pub fn erroring() -> Arc<Self> {
        Self::with_default(Outcome::Fail)
    }

    pub fn set_default(&self, accept: bool) {
        *self.default.lock().unwrap() = if accept {
            Outcome::Accept
        } else {
            Outcome::Refuse
        };
    }

    /// Make every publish wait for [`ScriptedPublisher::release`]
    pub fn hold(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }

    pub fn calls(&self) -> Vec<(TreeKey, TreeRootRecord)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl RootPublisher for ScriptedPublisher {
    async fn publish(&self, key: &TreeKey, record: &TreeRootRecord) -> Result<bool, PublishError> {
        self.calls
            .lock()
            .unwrap()
            .push((key.clone(), record.clone()));
        if self.hold.load(Ordering::SeqCst) {
            self.gate.notified().await;
        }

        let outcome = *self.default.lock().unwrap();
        match outcome {
            Outcome::Accept => Ok(true),
            Outcome::Refuse => Ok(false),
            Outcome::Fail => Err(PublishError::Transport("relay unreachable".into())),
        }
    }
}

/// Registry over in-memory persistence with default timings
pub(crate) fn memory_registry(
    publisher: Arc<ScriptedPublisher>,
) -> (
    TreeRootRegistry,
    Arc<JsonPersistence<MemorySlot>>,
    Arc<ScriptedPublisher>,
) {
    let persistence = Arc::new(JsonPersistence::new(MemorySlot::new()));
    let registry = TreeRootRegistry::new(
        RegistryConfig::default(),
        persistence.clone(),
        publisher.clone(),
    );
    (registry, persistence, publisher)
}
