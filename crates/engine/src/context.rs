//! Shared engine state handed to every component.

use std::sync::Arc;
use std::time::Duration;

use beacon_common::config::AppConfig;
use beacon_notifier::DeliveryGateway;

use crate::observer::{JobObserver, TracingObserver};
use crate::queue::QueueManager;
use crate::store::NotificationStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Attempt cap for one notification across single and retry jobs.
    pub max_retry_attempts: u32,
    /// Idle sleep between claims on an empty queue.
    pub worker_poll_interval: Duration,
    pub scheduler_interval: Duration,
    /// A `processing` row untouched for this long is returned to `pending`.
    pub stale_processing_after: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_retry_attempts: config.max_retry_attempts,
            worker_poll_interval: Duration::from_millis(config.worker_poll_interval_ms),
            scheduler_interval: Duration::from_secs(config.scheduler_interval_secs),
            stale_processing_after: Duration::from_secs(config.stale_processing_secs),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            worker_poll_interval: Duration::from_millis(500),
            scheduler_interval: Duration::from_secs(60),
            stale_processing_after: Duration::from_secs(30 * 60),
        }
    }
}

/// Store, queues, gateway and settings, constructed once at startup.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn NotificationStore>,
    pub queues: QueueManager,
    pub gateway: DeliveryGateway,
    pub observer: Arc<dyn JobObserver>,
    pub settings: EngineSettings,
}

impl EngineContext {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        queues: QueueManager,
        gateway: DeliveryGateway,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            queues,
            gateway,
            observer: Arc::new(TracingObserver),
            settings,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.observer = observer;
        self
    }
}
