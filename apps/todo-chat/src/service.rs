use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broadcast::Broadcaster;
use crate::clock::{Clock, SystemClock};
use crate::config::ChatConfig;
use crate::retention::RetentionPolicy;
use crate::rooms::RoomRegistry;
use crate::storage::SharedStore;

/// Everything a chat connection needs: the room registry, the retention
/// policy, the broadcaster and the background sweeper that goes with them.
#[derive(Clone)]
pub struct ChatService {
    inner: Arc<ChatServiceInner>,
}

struct ChatServiceInner {
    registry: RoomRegistry,
    retention: RetentionPolicy,
    broadcaster: Broadcaster,
    outbound_buffer: usize,
    sweeper_started: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl ChatService {
    pub fn new(store: SharedStore, config: ChatConfig) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), config)
    }

    pub fn with_clock(store: SharedStore, clock: Arc<dyn Clock>, config: ChatConfig) -> Self {
        let registry = RoomRegistry::new();
        let retention = RetentionPolicy::with_clock(store, clock, config.retention);
        let broadcaster = Broadcaster::new(registry.clone(), retention.clone());
        Self {
            inner: Arc::new(ChatServiceInner {
                registry,
                retention,
                broadcaster,
                outbound_buffer: config.outbound_buffer.max(1),
                sweeper_started: AtomicBool::new(false),
                sweeper: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.inner.registry
    }

    pub fn retention(&self) -> &RetentionPolicy {
        &self.inner.retention
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.inner.broadcaster
    }

    pub fn outbound_buffer(&self) -> usize {
        self.inner.outbound_buffer
    }

    /// Start the retention sweeper. Only the first call spawns it; every
    /// later or concurrent call returns `false`.
    pub fn start_sweeper(&self) -> bool {
        if self
            .inner
            .sweeper_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let handle = self
            .inner
            .retention
            .spawn_sweeper(self.inner.cancel.child_token());
        *self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(
            interval_secs = self.inner.retention.config().sweep_interval.as_secs(),
            "retention sweeper started"
        );
        true
    }

    pub fn sweeper_running(&self) -> bool {
        self.inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop background work and wait for the sweeper to finish.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handle = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "retention sweeper ended abnormally");
            }
        }
    }
}
